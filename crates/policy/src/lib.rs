//! ContractShield policy document model.
//!
//! A `PolicySet` is the declarative input of the PDP: global defaults, an
//! ordered route list, and per-route rules. Loading is strict where it has
//! to be (unknown rule `type` values fail with a descriptive error, route
//! ids must be unique) and lenient where the wire format allows growth
//! (unknown fields at the policy root are ignored).
//!
//! Policy-load errors surface to the host before `evaluate` is called;
//! nothing in this crate is catchable inside the pipeline.

#![deny(unsafe_code)]

use serde::Deserialize;
use serde_json::Value;
use shield_core::decision::Severity;
use std::collections::HashSet;
use std::path::Path;
use thiserror::Error;

pub mod vuln;

/// Errors raised while loading or validating a policy document.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// The document is not well-formed YAML/JSON or violates the schema.
    #[error("malformed policy: {0}")]
    Parse(String),
    /// A rule declared a `type` outside the supported set.
    #[error("unknown rule type '{kind}' on rule '{rule_id}'; valid: cel|webhook-signature|webhook-replay|contract|limits")]
    UnknownRuleType {
        /// Id of the offending rule.
        rule_id: String,
        /// The unsupported type tag.
        kind: String,
    },
    /// The document parsed but fails a semantic check.
    #[error("invalid policy: {0}")]
    Validation(String),
    /// Reading the policy file failed.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Enforcement mode of a route or of the whole policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Violations block the request.
    Enforce,
    /// Violations are recorded but the request proceeds.
    Monitor,
}

impl Mode {
    /// Lowercase wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Enforce => "enforce",
            Self::Monitor => "monitor",
        }
    }
}

/// What to do with a request no route matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnmatchedRouteAction {
    /// Let it through silently.
    Allow,
    /// Block with a synthetic `route.unmatched` hit.
    Block,
    /// Record a synthetic `route.unmatched` hit, let it through.
    Monitor,
}

/// Action a rule asks for when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    /// Never escalate this rule.
    Allow,
    /// Record only.
    Monitor,
    /// Block in enforce mode.
    #[default]
    Block,
}

/// Top-level policy document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicySet {
    /// Document version tag chosen by the author.
    #[serde(default)]
    pub policy_version: String,
    /// Global defaults routes inherit from.
    #[serde(default)]
    pub defaults: Defaults,
    /// Ordered route list; first exact match wins.
    #[serde(default)]
    pub routes: Vec<PolicyRoute>,
}

/// Global defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Defaults {
    /// Policy-wide mode; `enforce` when absent.
    #[serde(default)]
    pub mode: Option<Mode>,
    /// Disposition for unmatched routes; `allow` when absent.
    #[serde(default)]
    pub unmatched_route_action: Option<UnmatchedRouteAction>,
    /// Response shaping.
    #[serde(default)]
    pub response: ResponseDefaults,
    /// Policy-wide quantitative limits.
    #[serde(default)]
    pub limits: Limits,
    /// Policy-wide vulnerability check configuration.
    #[serde(default)]
    pub vulnerability_checks: vuln::VulnerabilityChecks,
}

/// Response shaping defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseDefaults {
    /// Status code emitted on BLOCK.
    #[serde(default = "default_block_status")]
    pub block_status_code: u16,
}

fn default_block_status() -> u16 {
    403
}

impl Default for ResponseDefaults {
    fn default() -> Self {
        Self { block_status_code: default_block_status() }
    }
}

/// Quantitative limits; an absent field means unlimited.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Limits {
    /// Maximum transport-layer body size in bytes.
    #[serde(default)]
    pub max_body_bytes: Option<u64>,
    /// Maximum JSON nesting depth of the body sample.
    #[serde(default)]
    pub max_json_depth: Option<u32>,
    /// Maximum length of any array in the body sample.
    #[serde(default)]
    pub max_array_length: Option<u64>,
}

impl Limits {
    /// Per-field `route ?? default ?? unlimited` resolution.
    #[must_use]
    pub fn resolve(route: Option<&Limits>, defaults: &Limits) -> Limits {
        let route = route.copied().unwrap_or_default();
        Limits {
            max_body_bytes: route.max_body_bytes.or(defaults.max_body_bytes),
            max_json_depth: route.max_json_depth.or(defaults.max_json_depth),
            max_array_length: route.max_array_length.or(defaults.max_array_length),
        }
    }
}

/// One route of the policy.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyRoute {
    /// Unique route identifier.
    pub id: String,
    /// Exact-match criteria.
    #[serde(rename = "match")]
    pub matcher: RouteMatch,
    /// Route-level mode override.
    #[serde(default)]
    pub mode: Option<Mode>,
    /// Schema contract configuration.
    #[serde(default)]
    pub contract: Option<ContractConfig>,
    /// Webhook verification configuration.
    #[serde(default)]
    pub webhook: Option<WebhookConfig>,
    /// Route-level vulnerability check overrides.
    #[serde(default)]
    pub vulnerability: Option<vuln::VulnerabilityChecks>,
    /// Ordered rule list evaluated by the CEL stage.
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
    /// Route-level limit overrides.
    #[serde(default)]
    pub limits: Option<Limits>,
}

impl PolicyRoute {
    /// Effective mode = `route.mode ?? defaults.mode ?? enforce`.
    #[must_use]
    pub fn effective_mode(&self, defaults: &Defaults) -> Mode {
        self.mode.or(defaults.mode).unwrap_or(Mode::Enforce)
    }
}

/// Exact route match criteria. v0.1 compares method and path as strings;
/// no templating, no prefixes.
#[derive(Debug, Clone, Deserialize)]
pub struct RouteMatch {
    /// HTTP method.
    pub method: String,
    /// Request path.
    pub path: String,
}

/// Schema contract configuration of a route.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContractConfig {
    /// Reference resolved through the injected schema loader.
    #[serde(default)]
    pub request_schema_ref: Option<String>,
    /// Require the schema to reject unknown fields at every object level.
    #[serde(default)]
    pub reject_unknown_fields: bool,
}

/// Webhook verification configuration of a route.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    /// Provider plugin name (e.g. `stripe`).
    pub provider: String,
    /// Name of an environment variable holding the secret.
    #[serde(default)]
    pub secret_ref: Option<String>,
    /// Inline secret. Discouraged; wins over `secret_ref`.
    #[serde(default)]
    pub secret: Option<String>,
    /// Track event ids in the replay store.
    #[serde(default = "default_true")]
    pub replay_protection: bool,
    /// Signature timestamp tolerance in seconds; 300 when absent.
    #[serde(default)]
    pub timestamp_tolerance: Option<u64>,
    /// Refuse to verify without the exact transport bytes.
    #[serde(default = "default_true")]
    pub require_raw_body: bool,
    /// When set, event types outside this list are flagged.
    #[serde(default)]
    pub allowed_event_types: Option<Vec<String>>,
}

fn default_true() -> bool {
    true
}

/// Config payload of a `cel` rule.
#[derive(Debug, Clone, Deserialize)]
pub struct CelRuleConfig {
    /// Boolean invariant over the evaluation environment.
    pub expression: String,
}

/// Stage binding of a rule. The sum type keeps a rule from ever being
/// evaluated by the wrong stage.
#[derive(Debug, Clone)]
pub enum RuleKind {
    /// Expression invariant, evaluated by the CEL stage.
    Cel(CelRuleConfig),
    /// Reserved binding to the webhook signature check.
    WebhookSignature,
    /// Reserved binding to the webhook replay check.
    WebhookReplay,
    /// Reserved binding to the schema contract check.
    Contract,
    /// Reserved binding to the limit checker.
    Limits,
}

/// One policy rule.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "RawRule")]
pub struct PolicyRule {
    /// Stable rule identifier, reported verbatim in hits.
    pub id: String,
    /// Requested action when the rule fires.
    pub action: RuleAction,
    /// Severity reported when the rule fires.
    pub severity: Severity,
    /// Stage binding and config.
    pub kind: RuleKind,
}

#[derive(Debug, Clone, Deserialize)]
struct RawRule {
    id: String,
    #[serde(default)]
    action: RuleAction,
    severity: Severity,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    config: Option<Value>,
}

impl TryFrom<RawRule> for PolicyRule {
    type Error = PolicyError;

    fn try_from(raw: RawRule) -> Result<Self, Self::Error> {
        let kind = match raw.kind.as_str() {
            "cel" => {
                let config = raw.config.ok_or_else(|| {
                    PolicyError::Validation(format!(
                        "rule '{}': cel rules require config.expression",
                        raw.id
                    ))
                })?;
                let config: CelRuleConfig = serde_json::from_value(config).map_err(|e| {
                    PolicyError::Validation(format!("rule '{}': invalid cel config: {e}", raw.id))
                })?;
                RuleKind::Cel(config)
            }
            "webhook-signature" => RuleKind::WebhookSignature,
            "webhook-replay" => RuleKind::WebhookReplay,
            "contract" => RuleKind::Contract,
            "limits" => RuleKind::Limits,
            other => {
                return Err(PolicyError::UnknownRuleType {
                    rule_id: raw.id,
                    kind: other.to_string(),
                })
            }
        };
        Ok(Self { id: raw.id, action: raw.action, severity: raw.severity, kind })
    }
}

impl PolicySet {
    /// Parse a YAML policy document and validate it.
    pub fn from_yaml_str(text: &str) -> Result<Self, PolicyError> {
        let set: Self = serde_yaml::from_str(text).map_err(|e| PolicyError::Parse(e.to_string()))?;
        set.validate()?;
        Ok(set)
    }

    /// Parse a JSON policy document and validate it.
    pub fn from_json_str(text: &str) -> Result<Self, PolicyError> {
        let set: Self = serde_json::from_str(text).map_err(|e| PolicyError::Parse(e.to_string()))?;
        set.validate()?;
        Ok(set)
    }

    /// Load a policy file, dispatching on the extension (`.yaml`/`.yml`
    /// parse as YAML, anything else as JSON).
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, PolicyError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml" | "yml") => Self::from_yaml_str(&text),
            _ => Self::from_json_str(&text),
        }
    }

    /// Semantic checks beyond the serde schema.
    pub fn validate(&self) -> Result<(), PolicyError> {
        let mut seen = HashSet::new();
        if self.defaults.response.block_status_code < 100
            || self.defaults.response.block_status_code > 599
        {
            return Err(PolicyError::Validation(format!(
                "defaults.response.block_status_code {} is not a valid HTTP status",
                self.defaults.response.block_status_code
            )));
        }
        for (i, route) in self.routes.iter().enumerate() {
            if route.id.trim().is_empty() {
                return Err(PolicyError::Validation(format!("routes[{i}].id must be non-empty")));
            }
            if !seen.insert(route.id.as_str()) {
                return Err(PolicyError::Validation(format!(
                    "duplicate route id '{}'",
                    route.id
                )));
            }
            if route.matcher.method.trim().is_empty() {
                return Err(PolicyError::Validation(format!(
                    "routes[{i}].match.method must be non-empty"
                )));
            }
            if route.matcher.path.trim().is_empty() {
                return Err(PolicyError::Validation(format!(
                    "routes[{i}].match.path must be non-empty"
                )));
            }
            if let Some(webhook) = &route.webhook {
                if webhook.provider.trim().is_empty() {
                    return Err(PolicyError::Validation(format!(
                        "routes[{i}].webhook.provider must be non-empty"
                    )));
                }
            }
            for (j, rule) in route.rules.iter().enumerate() {
                if rule.id.trim().is_empty() {
                    return Err(PolicyError::Validation(format!(
                        "routes[{i}].rules[{j}].id must be non-empty"
                    )));
                }
                if let RuleKind::Cel(cfg) = &rule.kind {
                    if cfg.expression.trim().is_empty() {
                        return Err(PolicyError::Validation(format!(
                            "routes[{i}].rules[{j}].config.expression must be non-empty"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}
