//! Restricted CEL-dialect expression evaluator.
//!
//! The built-in dialect covers exactly what route invariants need:
//! equality between two operands (`a.b == c.d`, `a.b == "literal"`),
//! membership (`a.b in ["x", "y"]`), and conjunction via `&&`. Everything
//! else is rejected at parse time as unsupported.
//!
//! Path lookup over a missing intermediate yields a typed *undefined*
//! that is distinct from an empty string; any comparison against
//! undefined evaluates to false. Evaluation is deterministic: no clock,
//! no I/O, no environment access beyond the value handed in.

#![deny(unsafe_code)]

use serde_json::Value;
use thiserror::Error;

/// Errors from parsing or evaluating an expression.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CelError {
    /// The expression is not well-formed.
    #[error("parse error: {0}")]
    Parse(String),
    /// The expression uses a construct outside the supported dialect.
    #[error("unsupported construct: {0}")]
    Unsupported(String),
}

/// Pluggable expression evaluator capability.
///
/// Hosts may install their own (e.g. a full CEL implementation) through
/// the PDP options; the PDP treats any error as a failed invariant.
pub trait CelEvaluator: Send + Sync {
    /// Evaluate `expr` against the frozen environment.
    fn eval(&self, expr: &str, env: &Value) -> Result<bool, CelError>;
}

/// Built-in minimal evaluator.
#[derive(Debug, Clone, Copy, Default)]
pub struct MiniCel;

impl CelEvaluator for MiniCel {
    fn eval(&self, expr: &str, env: &Value) -> Result<bool, CelError> {
        Program::parse(expr)?.eval(env)
    }
}

/// Parsed expression: a conjunction of terms.
#[derive(Debug, Clone)]
pub struct Program {
    terms: Vec<Term>,
}

#[derive(Debug, Clone)]
enum Term {
    Eq(Operand, Operand),
    In(Operand, Vec<Value>),
}

#[derive(Debug, Clone)]
enum Operand {
    Path(Vec<String>),
    Literal(Value),
}

impl Program {
    /// Parse an expression in the restricted dialect.
    pub fn parse(expr: &str) -> Result<Self, CelError> {
        let tokens = lex(expr)?;
        Parser { tokens, pos: 0 }.parse_program()
    }

    /// Evaluate against an environment. Never fails at this point; paths
    /// that do not resolve make their comparison false.
    #[allow(clippy::unnecessary_wraps)]
    pub fn eval(&self, env: &Value) -> Result<bool, CelError> {
        for term in &self.terms {
            let ok = match term {
                Term::Eq(lhs, rhs) => match (lhs.resolve(env), rhs.resolve(env)) {
                    (Some(a), Some(b)) => value_eq(a, b),
                    _ => false,
                },
                Term::In(lhs, list) => match lhs.resolve(env) {
                    Some(v) => list.iter().any(|item| value_eq(v, item)),
                    None => false,
                },
            };
            if !ok {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl Operand {
    fn resolve<'a>(&'a self, env: &'a Value) -> Option<&'a Value> {
        match self {
            Self::Literal(v) => Some(v),
            Self::Path(segments) => {
                let mut current = env;
                for segment in segments {
                    current = current.as_object()?.get(segment)?;
                }
                Some(current)
            }
        }
    }
}

// Numbers compare by value (1 == 1.0); everything else structurally.
fn value_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
    Dot,
    EqEq,
    AndAnd,
    In,
    LBracket,
    RBracket,
    Comma,
}

fn lex(expr: &str) -> Result<Vec<Token>, CelError> {
    let mut tokens = Vec::new();
    let mut chars = expr.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\r' | '\n' => {
                chars.next();
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '[' => {
                chars.next();
                tokens.push(Token::LBracket);
            }
            ']' => {
                chars.next();
                tokens.push(Token::RBracket);
            }
            '=' => {
                chars.next();
                if chars.next_if_eq(&'=').is_some() {
                    tokens.push(Token::EqEq);
                } else {
                    return Err(CelError::Unsupported("assignment '='".into()));
                }
            }
            '&' => {
                chars.next();
                if chars.next_if_eq(&'&').is_some() {
                    tokens.push(Token::AndAnd);
                } else {
                    return Err(CelError::Unsupported("bitwise '&'".into()));
                }
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some(ch) if ch == quote => break,
                        Some('\\') => match chars.next() {
                            Some(esc @ ('\\' | '\'' | '"')) => s.push(esc),
                            Some('n') => s.push('\n'),
                            Some('t') => s.push('\t'),
                            other => {
                                return Err(CelError::Parse(format!(
                                    "invalid escape {other:?} in string literal"
                                )))
                            }
                        },
                        Some(ch) => s.push(ch),
                        None => return Err(CelError::Parse("unterminated string literal".into())),
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut num = String::new();
                num.push(c);
                chars.next();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        num.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let parsed: f64 = num
                    .parse()
                    .map_err(|_| CelError::Parse(format!("invalid number '{num}'")))?;
                tokens.push(Token::Num(parsed));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_alphanumeric() || d == '_' {
                        ident.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(match ident.as_str() {
                    "in" => Token::In,
                    "true" => Token::Bool(true),
                    "false" => Token::Bool(false),
                    "null" => Token::Null,
                    _ => Token::Ident(ident),
                });
            }
            other => return Err(CelError::Unsupported(format!("character '{other}'"))),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn parse_program(mut self) -> Result<Program, CelError> {
        let mut terms = vec![self.parse_term()?];
        while self.peek().is_some() {
            self.expect(&Token::AndAnd, "'&&'")?;
            terms.push(self.parse_term()?);
        }
        Ok(Program { terms })
    }

    fn parse_term(&mut self) -> Result<Term, CelError> {
        let lhs = self.parse_operand()?;
        match self.next() {
            Some(Token::EqEq) => {
                let rhs = self.parse_operand()?;
                Ok(Term::Eq(lhs, rhs))
            }
            Some(Token::In) => {
                self.expect(&Token::LBracket, "'['")?;
                let mut list = Vec::new();
                if self.peek() != Some(&Token::RBracket) {
                    loop {
                        list.push(self.parse_literal()?);
                        match self.next() {
                            Some(Token::Comma) => continue,
                            Some(Token::RBracket) => break,
                            other => {
                                return Err(CelError::Parse(format!(
                                    "expected ',' or ']' in list, found {other:?}"
                                )))
                            }
                        }
                    }
                } else {
                    self.next();
                }
                Ok(Term::In(lhs, list))
            }
            other => Err(CelError::Unsupported(format!(
                "expected '==' or 'in', found {other:?}"
            ))),
        }
    }

    fn parse_operand(&mut self) -> Result<Operand, CelError> {
        match self.next() {
            Some(Token::Ident(first)) => {
                let mut segments = vec![first];
                while self.peek() == Some(&Token::Dot) {
                    self.next();
                    match self.next() {
                        Some(Token::Ident(seg)) => segments.push(seg),
                        other => {
                            return Err(CelError::Parse(format!(
                                "expected identifier after '.', found {other:?}"
                            )))
                        }
                    }
                }
                Ok(Operand::Path(segments))
            }
            Some(Token::Str(s)) => Ok(Operand::Literal(Value::String(s))),
            Some(Token::Num(n)) => Ok(Operand::Literal(number(n))),
            Some(Token::Bool(b)) => Ok(Operand::Literal(Value::Bool(b))),
            Some(Token::Null) => Ok(Operand::Literal(Value::Null)),
            other => Err(CelError::Parse(format!("expected operand, found {other:?}"))),
        }
    }

    fn parse_literal(&mut self) -> Result<Value, CelError> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Value::String(s)),
            Some(Token::Num(n)) => Ok(number(n)),
            Some(Token::Bool(b)) => Ok(Value::Bool(b)),
            Some(Token::Null) => Ok(Value::Null),
            other => Err(CelError::Parse(format!("expected literal, found {other:?}"))),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, token: &Token, what: &str) -> Result<(), CelError> {
        match self.next() {
            Some(ref t) if t == token => Ok(()),
            other => Err(CelError::Parse(format!("expected {what}, found {other:?}"))),
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        Value::from(n as i64)
    } else {
        Value::from(n)
    }
}
