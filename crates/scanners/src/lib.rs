//! Vulnerability denylist scanners and quantitative limit checks.
//!
//! Each scanner is an independent deterministic walk over the parsed body
//! sample and the query map (path traversal additionally inspects the
//! request path). Findings aggregate per (check, field path): repeated
//! occurrences of the same pattern at the same path collapse into a single
//! hit, and hits are emitted in sorted path order so that identical inputs
//! always produce identical hit sequences.
//!
//! Field paths are dotted and rooted at `body`, `query` or `path`
//! (array elements use the index as a segment, e.g. `body.items.3`).

#![deny(unsafe_code)]

use once_cell::sync::Lazy;
use policy::vuln::{EffectiveCheck, EffectiveChecks};
use policy::Limits;
use regex::Regex;
use serde_json::Value;
use shield_core::context::RequestContext;
use shield_core::decision::{RuleHit, Severity};
use shield_core::jsonstats;
use std::collections::BTreeMap;
use url::{Host, Url};

/// Hit id of the prototype pollution scanner.
pub const RULE_PROTOTYPE_POLLUTION: &str = "vuln.prototype_pollution";
/// Hit id of the path traversal scanner.
pub const RULE_PATH_TRAVERSAL: &str = "vuln.path_traversal";
/// Hit id of the SSRF target scanner.
pub const RULE_SSRF_INTERNAL: &str = "vuln.ssrf_internal";
/// Hit id of the NoSQL operator scanner.
pub const RULE_NOSQL_INJECTION: &str = "vuln.nosql_injection";
/// Hit id of the command injection scanner.
pub const RULE_COMMAND_INJECTION: &str = "vuln.command_injection";

/// Hit id for body size over the limit.
pub const RULE_LIMIT_BODY: &str = "limit.body.max";
/// Hit id for JSON depth over the limit.
pub const RULE_LIMIT_DEPTH: &str = "limit.json.depth";
/// Hit id for array length over the limit.
pub const RULE_LIMIT_ARRAY: &str = "limit.array.max";

const DANGEROUS_KEYS: [&str; 3] = ["__proto__", "constructor", "prototype"];

const SSRF_KEY_MARKERS: [&str; 18] = [
    "url", "callback", "webhook", "redirect", "next", "return_url", "returnurl", "return",
    "forward", "goto", "target", "dest", "destination", "uri", "link", "href", "src", "source",
];

const MONGO_OPERATORS: [&str; 24] = [
    "$where", "$ne", "$gt", "$gte", "$lt", "$lte", "$in", "$nin", "$or", "$and", "$not", "$nor",
    "$exists", "$type", "$expr", "$regex", "$options", "$text", "$search", "$mod", "$size",
    "$all", "$elemMatch", "$jsonSchema",
];

static TRAVERSAL: Lazy<Regex> = Lazy::new(|| {
    // ../ and ..\, %2e%2e with plain or encoded separators, partial
    // ..%2f / ..%5c encodings, overlong %c0%ae, U+2215 / U+2216 slashes.
    Regex::new(r"(?i)\.\./|\.\.\\|%2e%2e(?:/|\\|%2f|%5c)|\.\.%(?:2f|5c)|%c0%ae|[\u{2215}\u{2216}]")
        .unwrap()
});

static COMMAND: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?x)
        [;&|]\s*[\w./-]                 # chained command after ; & |
        | `[^`]*`                       # backtick substitution
        | \$\([^)]*\)                   # $() substitution
        | &&
        | \|\|
        | \n\s*(?:sh|bash|zsh|curl|wget|nc|ncat|python|perl|ruby|php|cat|rm|chmod)\b",
    )
    .unwrap()
});

/// Run every enabled vulnerability scanner in fixed order and return the
/// aggregated hits.
#[must_use]
pub fn scan_vulnerabilities(ctx: &RequestContext, checks: &EffectiveChecks) -> Vec<RuleHit> {
    let mut hits = Vec::new();
    if checks.prototype_pollution.enabled {
        hits.extend(scan_prototype_pollution(ctx, &checks.prototype_pollution));
    }
    if checks.path_traversal.enabled {
        hits.extend(scan_path_traversal(ctx, &checks.path_traversal));
    }
    if checks.ssrf_internal.enabled {
        hits.extend(scan_ssrf_internal(ctx, &checks.ssrf_internal));
    }
    if checks.nosql_injection.enabled {
        hits.extend(scan_nosql_injection(ctx, &checks.nosql_injection));
    }
    if checks.command_injection.enabled {
        hits.extend(scan_command_injection(ctx, &checks.command_injection));
    }
    hits
}

/// Flag `__proto__` / `constructor` / `prototype` object keys at any depth.
#[must_use]
pub fn scan_prototype_pollution(ctx: &RequestContext, check: &EffectiveCheck) -> Vec<RuleHit> {
    let mut found: BTreeMap<String, String> = BTreeMap::new();
    for_each_key(ctx, &mut |path, key| {
        if DANGEROUS_KEYS.contains(&key) && in_scope(check, path) {
            found.entry(path.dotted()).or_insert_with(|| key.to_string());
        }
    });
    found
        .into_iter()
        .map(|(path, key)| {
            RuleHit::with_message(
                RULE_PROTOTYPE_POLLUTION,
                Severity::Critical,
                format!("Found '{key}' key in request at {path}"),
            )
        })
        .collect()
}

/// Flag traversal sequences (`../`, encoded and Unicode variants) in
/// string values and in the request path.
#[must_use]
pub fn scan_path_traversal(ctx: &RequestContext, check: &EffectiveCheck) -> Vec<RuleHit> {
    let mut found: BTreeMap<String, ()> = BTreeMap::new();
    for_each_string(ctx, &mut |path, s| {
        if TRAVERSAL.is_match(s) && in_scope(check, path) {
            found.insert(path.dotted(), ());
        }
    });
    if TRAVERSAL.is_match(&ctx.request.path) {
        found.insert("path".to_string(), ());
    }
    found
        .into_keys()
        .map(|path| {
            RuleHit::with_message(
                RULE_PATH_TRAVERSAL,
                Severity::Critical,
                format!("Path traversal sequence in {path}"),
            )
        })
        .collect()
}

/// Flag URL-bearing fields whose target is loopback, link-local or a
/// private range, or whose scheme reaches local services directly.
#[must_use]
pub fn scan_ssrf_internal(ctx: &RequestContext, check: &EffectiveCheck) -> Vec<RuleHit> {
    let mut found: BTreeMap<String, ()> = BTreeMap::new();
    for_each_string(ctx, &mut |path, s| {
        let leaf = path.leaf().to_ascii_lowercase();
        if !SSRF_KEY_MARKERS.iter().any(|m| leaf.contains(m)) {
            return;
        }
        if is_internal_url(s) && in_scope(check, path) {
            found.insert(path.dotted(), ());
        }
    });
    found
        .into_keys()
        .map(|path| {
            RuleHit::with_message(
                RULE_SSRF_INTERNAL,
                Severity::Critical,
                format!("Internal or loopback URL target in {path}"),
            )
        })
        .collect()
}

/// Flag `$`-prefixed MongoDB operator keys.
#[must_use]
pub fn scan_nosql_injection(ctx: &RequestContext, check: &EffectiveCheck) -> Vec<RuleHit> {
    let mut found: BTreeMap<String, String> = BTreeMap::new();
    for_each_key(ctx, &mut |path, key| {
        if key.starts_with('$') && MONGO_OPERATORS.contains(&key) && in_scope(check, path) {
            found.entry(path.dotted()).or_insert_with(|| key.to_string());
        }
    });
    found
        .into_iter()
        .map(|(path, key)| {
            RuleHit::with_message(
                RULE_NOSQL_INJECTION,
                Severity::High,
                format!("MongoDB operator '{key}' in {path}"),
            )
        })
        .collect()
}

/// Flag shell metacharacter sequences in string values of configured
/// fields (all string fields when no scope is set).
#[must_use]
pub fn scan_command_injection(ctx: &RequestContext, check: &EffectiveCheck) -> Vec<RuleHit> {
    let mut found: BTreeMap<String, ()> = BTreeMap::new();
    for_each_string(ctx, &mut |path, s| {
        if COMMAND.is_match(s) && in_scope(check, path) {
            found.insert(path.dotted(), ());
        }
    });
    found
        .into_keys()
        .map(|path| {
            RuleHit::with_message(
                RULE_COMMAND_INJECTION,
                Severity::Critical,
                format!("Shell metacharacter sequence in {path}"),
            )
        })
        .collect()
}

/// Check the resolved quantitative limits against the request.
#[must_use]
pub fn check_limits(ctx: &RequestContext, limits: &Limits) -> Vec<RuleHit> {
    let mut hits = Vec::new();
    if let Some(max) = limits.max_body_bytes {
        if ctx.request.body.size_bytes > max {
            hits.push(RuleHit::with_message(
                RULE_LIMIT_BODY,
                Severity::High,
                format!("body size {} exceeds limit {max}", ctx.request.body.size_bytes),
            ));
        }
    }
    let stats = ctx.request.body.json.as_ref().map(|j| jsonstats::measure(&j.sample));
    if let (Some(max), Some(stats)) = (limits.max_json_depth, stats) {
        if stats.depth > max {
            hits.push(RuleHit::with_message(
                RULE_LIMIT_DEPTH,
                Severity::High,
                format!("JSON depth {} exceeds limit {max}", stats.depth),
            ));
        }
    }
    if let (Some(max), Some(stats)) = (limits.max_array_length, stats) {
        if stats.max_array_len > max {
            hits.push(RuleHit::with_message(
                RULE_LIMIT_ARRAY,
                Severity::High,
                format!("array length {} exceeds limit {max}", stats.max_array_len),
            ));
        }
    }
    hits
}

/// Dotted field path under a fixed root segment.
struct FieldPath<'a> {
    root: &'a str,
    segments: Vec<String>,
}

impl<'a> FieldPath<'a> {
    fn new(root: &'a str) -> Self {
        Self { root, segments: Vec::new() }
    }

    fn dotted(&self) -> String {
        if self.segments.is_empty() {
            self.root.to_string()
        } else {
            format!("{}.{}", self.root, self.segments.join("."))
        }
    }

    fn below_root(&self) -> String {
        self.segments.join(".")
    }

    fn leaf(&self) -> &str {
        self.segments.last().map_or(self.root, String::as_str)
    }
}

fn in_scope(check: &EffectiveCheck, path: &FieldPath<'_>) -> bool {
    check.field_in_scope(path.leaf(), &path.below_root())
}

/// Visit every object key in the body sample and the query map, in map
/// order (sorted), body first.
fn for_each_key(ctx: &RequestContext, visit: &mut dyn FnMut(&FieldPath<'_>, &str)) {
    if let Some(json) = &ctx.request.body.json {
        let mut path = FieldPath::new("body");
        walk_keys(&json.sample, &mut path, visit);
    }
    let mut path = FieldPath::new("query");
    for (key, value) in &ctx.request.query {
        path.segments.push(key.clone());
        visit(&path, key);
        walk_keys(value, &mut path, visit);
        path.segments.pop();
    }
}

fn walk_keys(value: &Value, path: &mut FieldPath<'_>, visit: &mut dyn FnMut(&FieldPath<'_>, &str)) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                path.segments.push(key.clone());
                visit(path, key);
                walk_keys(child, path, visit);
                path.segments.pop();
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                path.segments.push(i.to_string());
                walk_keys(child, path, visit);
                path.segments.pop();
            }
        }
        _ => {}
    }
}

/// Visit every string value in the body sample and the query map, in map
/// order (sorted), body first.
fn for_each_string(ctx: &RequestContext, visit: &mut dyn FnMut(&FieldPath<'_>, &str)) {
    if let Some(json) = &ctx.request.body.json {
        let mut path = FieldPath::new("body");
        walk_strings(&json.sample, &mut path, visit);
    }
    let mut path = FieldPath::new("query");
    for (key, value) in &ctx.request.query {
        path.segments.push(key.clone());
        walk_strings(value, &mut path, visit);
        path.segments.pop();
    }
}

fn walk_strings(
    value: &Value,
    path: &mut FieldPath<'_>,
    visit: &mut dyn FnMut(&FieldPath<'_>, &str),
) {
    match value {
        Value::String(s) => visit(path, s),
        Value::Object(map) => {
            for (key, child) in map {
                path.segments.push(key.clone());
                walk_strings(child, path, visit);
                path.segments.pop();
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                path.segments.push(i.to_string());
                walk_strings(child, path, visit);
                path.segments.pop();
            }
        }
        _ => {}
    }
}

fn is_internal_url(candidate: &str) -> bool {
    let Ok(parsed) = Url::parse(candidate) else {
        return false;
    };
    match parsed.scheme() {
        "file" | "gopher" | "dict" => return true,
        _ => {}
    }
    match parsed.host() {
        Some(Host::Domain(domain)) => {
            let domain = domain.to_ascii_lowercase();
            domain == "localhost" || domain.ends_with(".localhost")
        }
        Some(Host::Ipv4(ip)) => {
            let [a, b, _, _] = ip.octets();
            a == 127
                || a == 10
                || (a == 172 && (16..=31).contains(&b))
                || (a == 192 && b == 168)
                || (a == 169 && b == 254)
        }
        Some(Host::Ipv6(ip)) => ip.is_loopback(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use policy::vuln::VulnerabilityChecks;
    use serde_json::json;
    use shield_core::context::JsonBody;

    fn ctx_with_body(sample: Value) -> RequestContext {
        let mut ctx = RequestContext::for_request("POST", "/api/thing");
        ctx.request.body.present = true;
        ctx.request.body.json = Some(JsonBody { sample, redacted: false });
        ctx
    }

    fn all_on() -> EffectiveChecks {
        EffectiveChecks::resolve(
            &VulnerabilityChecks {
                nosql_injection: Some(policy::vuln::CheckConfig::Enabled(true)),
                command_injection: Some(policy::vuln::CheckConfig::Enabled(true)),
                ..VulnerabilityChecks::default()
            },
            None,
        )
    }

    fn open_check() -> EffectiveCheck {
        EffectiveCheck { enabled: true, fields: None }
    }

    #[test]
    fn prototype_pollution_reports_exact_path() {
        let ctx = ctx_with_body(json!({"a": {"__proto__": {"isAdmin": true}}}));
        let hits = scan_prototype_pollution(&ctx, &open_check());
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, RULE_PROTOTYPE_POLLUTION);
        assert_eq!(hits[0].severity, Severity::Critical);
        assert_eq!(
            hits[0].message.as_deref(),
            Some("Found '__proto__' key in request at body.a.__proto__")
        );
    }

    #[test]
    fn prototype_pollution_collapses_duplicates() {
        let ctx = ctx_with_body(json!({
            "a": {"constructor": 1},
            "b": {"constructor": 2}
        }));
        let hits = scan_prototype_pollution(&ctx, &open_check());
        // Two distinct paths, one hit each, sorted.
        assert_eq!(hits.len(), 2);
        assert!(hits[0].message.as_deref().unwrap().contains("body.a.constructor"));
        assert!(hits[1].message.as_deref().unwrap().contains("body.b.constructor"));
    }

    #[test]
    fn traversal_variants_match() {
        for payload in [
            "../../etc/passwd",
            r"..\..\windows",
            "%2e%2e/secret",
            "%2E%2E%2Fsecret",
            "..%2fsecret",
            "..%5Csecret",
            "%c0%ae%c0%ae/",
            "a\u{2215}..\u{2215}b",
        ] {
            let ctx = ctx_with_body(json!({ "file": payload }));
            let hits = scan_path_traversal(&ctx, &open_check());
            assert_eq!(hits.len(), 1, "payload {payload:?} should match");
            assert_eq!(hits[0].message.as_deref(), Some("Path traversal sequence in body.file"));
        }
    }

    #[test]
    fn traversal_inspects_request_path() {
        let mut ctx = RequestContext::for_request("GET", "/files/../../etc/passwd");
        ctx.request.query.insert("safe".into(), json!("value"));
        let hits = scan_path_traversal(&ctx, &open_check());
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].message.as_deref(), Some("Path traversal sequence in path"));
    }

    #[test]
    fn traversal_scoping_limits_fields() {
        let ctx = ctx_with_body(json!({"file": "../x", "note": "../y"}));
        let check = EffectiveCheck { enabled: true, fields: Some(vec!["file".into()]) };
        let hits = scan_path_traversal(&ctx, &check);
        assert_eq!(hits.len(), 1);
        assert!(hits[0].message.as_deref().unwrap().contains("body.file"));
    }

    #[test]
    fn ssrf_flags_internal_hosts() {
        for target in [
            "http://localhost/admin",
            "http://127.0.0.1:8080/",
            "http://[::1]/x",
            "http://10.1.2.3/meta",
            "http://172.20.0.1/",
            "http://192.168.1.1/",
            "http://169.254.169.254/latest/meta-data",
            "file:///etc/passwd",
            "gopher://example.com/x",
            "dict://example.com/x",
        ] {
            let ctx = ctx_with_body(json!({ "callback_url": target }));
            let hits = scan_ssrf_internal(&ctx, &open_check());
            assert_eq!(hits.len(), 1, "target {target:?} should be flagged");
        }
    }

    #[test]
    fn ssrf_ignores_public_hosts_and_unmarked_keys() {
        let ctx = ctx_with_body(json!({
            "callback_url": "https://example.com/hook",
            "note": "http://127.0.0.1/ignored-key-name"
        }));
        assert!(scan_ssrf_internal(&ctx, &open_check()).is_empty());
    }

    #[test]
    fn ssrf_inspects_query() {
        let mut ctx = RequestContext::for_request("GET", "/go");
        ctx.request.query.insert("redirect".into(), json!("http://192.168.0.1/"));
        let hits = scan_ssrf_internal(&ctx, &open_check());
        assert_eq!(hits.len(), 1);
        assert!(hits[0].message.as_deref().unwrap().contains("query.redirect"));
    }

    #[test]
    fn nosql_operator_keys_flagged() {
        let ctx = ctx_with_body(json!({"filter": {"$where": "this.a == 1", "name": "x"}}));
        let hits = scan_nosql_injection(&ctx, &open_check());
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].severity, Severity::High);
        assert_eq!(
            hits[0].message.as_deref(),
            Some("MongoDB operator '$where' in body.filter.$where")
        );
    }

    #[test]
    fn nosql_ignores_unknown_dollar_keys() {
        let ctx = ctx_with_body(json!({"$customTag": 1}));
        assert!(scan_nosql_injection(&ctx, &open_check()).is_empty());
    }

    #[test]
    fn command_injection_patterns() {
        for payload in ["a; rm -rf /", "`id`", "$(whoami)", "a && b", "a || b", "x\ncurl evil"] {
            let ctx = ctx_with_body(json!({ "cmd": payload }));
            let hits = scan_command_injection(&ctx, &open_check());
            assert_eq!(hits.len(), 1, "payload {payload:?} should match");
        }
        let ctx = ctx_with_body(json!({"cmd": "plain words only"}));
        assert!(scan_command_injection(&ctx, &open_check()).is_empty());
    }

    #[test]
    fn stage_runs_only_enabled_checks() {
        let ctx = ctx_with_body(json!({
            "a": {"__proto__": 1},
            "filter": {"$ne": 1}
        }));
        let default_checks = EffectiveChecks::resolve(&VulnerabilityChecks::default(), None);
        let hits = scan_vulnerabilities(&ctx, &default_checks);
        // nosql is off by default; only the prototype hit remains.
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, RULE_PROTOTYPE_POLLUTION);

        let hits = scan_vulnerabilities(&ctx, &all_on());
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, RULE_PROTOTYPE_POLLUTION);
        assert_eq!(hits[1].id, RULE_NOSQL_INJECTION);
    }

    #[test]
    fn limits_emit_expected_hits() {
        let mut ctx = ctx_with_body(json!({"deep": {"deeper": {"deepest": [1, 2, 3, 4]}}}));
        ctx.request.body.size_bytes = 2048;
        let limits = Limits {
            max_body_bytes: Some(1024),
            max_json_depth: Some(3),
            max_array_length: Some(3),
        };
        let hits = check_limits(&ctx, &limits);
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec![RULE_LIMIT_BODY, RULE_LIMIT_DEPTH, RULE_LIMIT_ARRAY]);
        assert!(hits.iter().all(|h| h.severity == Severity::High));
    }

    #[test]
    fn limits_unlimited_when_absent() {
        let mut ctx = ctx_with_body(json!({"a": []}));
        ctx.request.body.size_bytes = u64::MAX;
        assert!(check_limits(&ctx, &Limits::default()).is_empty());
    }

    #[test]
    fn limits_at_boundary_do_not_fire() {
        let mut ctx = ctx_with_body(json!({"a": [1, 2, 3]}));
        ctx.request.body.size_bytes = 1024;
        let limits = Limits {
            max_body_bytes: Some(1024),
            max_json_depth: Some(3),
            max_array_length: Some(3),
        };
        assert!(check_limits(&ctx, &limits).is_empty());
    }
}
