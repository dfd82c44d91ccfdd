//! ContractShield core primitives and shared types.

#![deny(unsafe_code)]

/// Version of the ContractShield core library.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol tag carried by contexts and decisions in this major line.
pub const PROTOCOL_VERSION: &str = "0.1";

pub mod clock {
    //! Deterministic time source for tolerance and TTL checks.

    use std::sync::Mutex;
    use std::time::{SystemTime, UNIX_EPOCH};

    /// Clock abstraction. Returns milliseconds since the UNIX epoch.
    pub trait Clock: Send + Sync {
        /// Current time in milliseconds since the UNIX epoch.
        fn now_ms(&self) -> u64;
    }

    /// System (production) clock. Wraps `SystemTime`.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now_ms(&self) -> u64 {
            SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as u64
        }
    }

    /// Fixed clock with manual control, for tests and replay.
    #[derive(Debug)]
    pub struct FixedClock {
        inner: Mutex<u64>,
    }

    impl FixedClock {
        /// Create a fixed clock seeded at `start_ms`.
        pub fn new(start_ms: u64) -> Self {
            Self { inner: Mutex::new(start_ms) }
        }

        /// Advance the clock by `delta_ms`.
        pub fn advance_ms(&self, delta_ms: u64) {
            let mut g = self.inner.lock().expect("clock lock poisoned");
            *g = g.saturating_add(delta_ms);
        }

        /// Set the clock to an absolute millisecond value.
        pub fn set_ms(&self, value: u64) {
            *self.inner.lock().expect("clock lock poisoned") = value;
        }
    }

    impl Clock for FixedClock {
        fn now_ms(&self) -> u64 {
            *self.inner.lock().expect("clock lock poisoned")
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn fixed_clock_is_deterministic() {
            let clk = FixedClock::new(1_000);
            assert_eq!(clk.now_ms(), 1_000);
            clk.advance_ms(5);
            assert_eq!(clk.now_ms(), 1_005);
            clk.set_ms(42);
            assert_eq!(clk.now_ms(), 42);
        }

        #[test]
        fn system_clock_moves_forward() {
            let clk = SystemClock;
            let a = clk.now_ms();
            let b = clk.now_ms();
            assert!(b >= a);
        }
    }
}

pub mod context {
    //! Canonical request context: the normalized, immutable PDP input.

    use serde::{Deserialize, Serialize};
    use serde_json::Value;
    use sha2::{Digest, Sha256};
    use std::collections::BTreeMap;

    fn default_version() -> String {
        super::PROTOCOL_VERSION.to_string()
    }

    /// Normalized request representation handed to `evaluate`.
    ///
    /// Invariants: header keys are lowercase, `body.raw` holds the exact
    /// transport bytes (no re-encoding), and `body.json.sample` is a parsed
    /// structural view that is absent when parsing was not performed. The
    /// PDP never mutates a context.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct RequestContext {
        /// Protocol tag (currently "0.1").
        #[serde(default = "default_version")]
        pub version: String,
        /// Opaque correlation identifier.
        #[serde(default)]
        pub id: String,
        /// Opaque correlation timestamp.
        #[serde(default)]
        pub timestamp: String,
        /// Transport-level request view.
        pub request: RequestInfo,
        /// Caller identity as established by the host.
        #[serde(default)]
        pub identity: Identity,
        /// Client network attributes.
        #[serde(default)]
        pub client: Client,
        /// Host runtime attributes.
        #[serde(default)]
        pub runtime: Runtime,
        /// Test-mode webhook overrides.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub webhook: Option<WebhookOverrides>,
    }

    impl RequestContext {
        /// Minimal context for a method/path pair; every other field takes
        /// its default.
        pub fn for_request(method: impl Into<String>, path: impl Into<String>) -> Self {
            Self {
                version: default_version(),
                id: String::new(),
                timestamp: String::new(),
                request: RequestInfo {
                    method: method.into(),
                    path: path.into(),
                    route_id: None,
                    headers: BTreeMap::new(),
                    query: BTreeMap::new(),
                    content_type: None,
                    body: BodyInfo::default(),
                },
                identity: Identity::default(),
                client: Client::default(),
                runtime: Runtime::default(),
                webhook: None,
            }
        }

        /// Return a copy with header keys lowercased and `body.sha256`
        /// filled from the raw bytes when no fingerprint was supplied.
        /// Hosts call this once before evaluation; the PDP assumes the
        /// invariants already hold.
        #[must_use]
        pub fn canonicalize(&self) -> Self {
            let mut ctx = self.clone();
            let headers = std::mem::take(&mut ctx.request.headers);
            ctx.request.headers =
                headers.into_iter().map(|(k, v)| (k.to_ascii_lowercase(), v)).collect();
            if ctx.request.body.sha256.is_none() {
                if let Some(raw) = &ctx.request.body.raw {
                    ctx.request.body.sha256 = Some(hex::encode(Sha256::digest(raw)));
                }
            }
            ctx
        }
    }

    /// Transport-level request attributes.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct RequestInfo {
        /// HTTP method, uppercase by convention.
        pub method: String,
        /// Request path as received.
        pub path: String,
        /// Framework route identifier, when the adapter knows it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub route_id: Option<String>,
        /// Headers with lowercase keys.
        #[serde(default)]
        pub headers: BTreeMap<String, String>,
        /// Parsed query parameters.
        #[serde(default)]
        pub query: BTreeMap<String, Value>,
        /// Content-Type header value, when present.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub content_type: Option<String>,
        /// Body facts and views.
        #[serde(default)]
        pub body: BodyInfo,
    }

    impl RequestInfo {
        /// Header lookup; the queried name is lowercased first, keys are
        /// canonically lowercase.
        pub fn header(&self, name: &str) -> Option<&str> {
            self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
        }
    }

    /// Body facts: size, fingerprint, raw bytes and parsed sample.
    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct BodyInfo {
        /// Whether the request carried a body at all.
        #[serde(default)]
        pub present: bool,
        /// Transport-layer body size.
        #[serde(default)]
        pub size_bytes: u64,
        /// Hex SHA-256 of the raw bytes.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub sha256: Option<String>,
        /// Exact transport bytes; required for webhook signature
        /// verification.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub raw: Option<Vec<u8>>,
        /// Parsed structural view, when the host parsed the body.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub json: Option<JsonBody>,
    }

    /// Parsed body sample plus its redaction marker.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct JsonBody {
        /// Parsed structural view of the body.
        pub sample: Value,
        /// True when the host redacted fields before sampling.
        #[serde(default)]
        pub redacted: bool,
    }

    /// Caller identity established by the host.
    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct Identity {
        /// Whether the request was authenticated.
        #[serde(default)]
        pub authenticated: bool,
        /// Authenticated subject.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub subject: Option<String>,
        /// Tenant the subject belongs to.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub tenant: Option<String>,
        /// Granted scopes, in grant order.
        #[serde(default)]
        pub scopes: Vec<String>,
        /// Raw claims from the credential.
        #[serde(default)]
        pub claims: BTreeMap<String, Value>,
    }

    /// Client network attributes.
    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct Client {
        /// Remote address as seen by the host.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub ip: Option<String>,
        /// User-Agent header value.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub user_agent: Option<String>,
    }

    /// Host runtime attributes.
    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct Runtime {
        /// Host language ("node", "rust", ...).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub language: Option<String>,
        /// Service name.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub service: Option<String>,
        /// Deployment environment ("prod", "staging", ...).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub env: Option<String>,
    }

    /// Test-mode webhook overrides carried by fixtures.
    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct WebhookOverrides {
        /// Provider hint.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub provider: Option<String>,
        /// When set, overrides cryptographic signature verification.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub signature_valid: Option<bool>,
        /// When set, overrides the replay store outcome.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub replayed: Option<bool>,
    }

}

pub mod decision {
    //! Decision wire types: rule hits, risk, action.

    use serde::{Deserialize, Serialize};
    use serde_json::{Map, Value};

    /// Severity attached to a rule hit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum Severity {
        /// Informational.
        Low,
        /// Worth surfacing, rarely block-worthy alone.
        Med,
        /// Serious violation.
        High,
        /// Exploitable or integrity-breaking violation.
        Critical,
    }

    /// Final action of a decision. `Challenge` is reserved; v0.1 emitters
    /// must not produce it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "SCREAMING_SNAKE_CASE")]
    pub enum Action {
        /// Let the request through.
        Allow,
        /// Reject the request.
        Block,
        /// Let the request through but record the violations.
        Monitor,
        /// Reserved for interactive challenges.
        Challenge,
    }

    /// Record that one stage's check fired.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct RuleHit {
        /// Stable rule identifier (e.g. `vuln.prototype_pollution`).
        pub id: String,
        /// Severity of the violation.
        pub severity: Severity,
        /// Optional human-readable detail. Never contains secrets or raw
        /// request bodies.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub message: Option<String>,
    }

    impl RuleHit {
        /// Hit without a message.
        pub fn new(id: impl Into<String>, severity: Severity) -> Self {
            Self { id: id.into(), severity, message: None }
        }

        /// Hit with a message.
        pub fn with_message(
            id: impl Into<String>,
            severity: Severity,
            message: impl Into<String>,
        ) -> Self {
            Self { id: id.into(), severity, message: Some(message.into()) }
        }
    }

    /// Categorical risk level.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum RiskLevel {
        /// No hits.
        None,
        /// Maximum severity low.
        Low,
        /// Maximum severity med.
        Med,
        /// Maximum severity high.
        High,
        /// Maximum severity critical.
        Critical,
    }

    /// Numeric and categorical summary of hit severity.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Risk {
        /// 0..=100. A critical hit pins the score to 90, any other hit to 60.
        pub score: u8,
        /// Maximum severity among hits.
        pub level: RiskLevel,
    }

    impl Risk {
        /// Fold a hit sequence into its risk summary.
        #[must_use]
        pub fn from_hits(hits: &[RuleHit]) -> Self {
            let level = hits
                .iter()
                .map(|h| match h.severity {
                    Severity::Low => RiskLevel::Low,
                    Severity::Med => RiskLevel::Med,
                    Severity::High => RiskLevel::High,
                    Severity::Critical => RiskLevel::Critical,
                })
                .max()
                .unwrap_or(RiskLevel::None);
            let score = match level {
                RiskLevel::None => 0,
                RiskLevel::Critical => 90,
                _ => 60,
            };
            Self { score, level }
        }

        /// Risk of an empty hit sequence.
        #[must_use]
        pub fn none() -> Self {
            Self { score: 0, level: RiskLevel::None }
        }
    }

    /// Evaluation result. The sole user-visible surface of the PDP; field
    /// names and types are a stable wire format within v0.1.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Decision {
        /// Wire format version ("0.1").
        pub version: String,
        /// Final action.
        pub action: Action,
        /// Policy-configured block status when blocking, 200 otherwise.
        pub status_code: u16,
        /// Short human-readable summary; absent on allow.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub reason: Option<String>,
        /// Hits in pipeline stage order.
        pub rule_hits: Vec<RuleHit>,
        /// Severity summary of the hits.
        pub risk: Risk,
        /// Field paths the host redacted before sampling.
        pub redactions: Vec<String>,
        /// Evaluation metadata (`route_id`, `mode`). Additive only.
        pub metadata: Map<String, Value>,
    }

    impl Decision {
        /// An allow with no hits (status 200).
        #[must_use]
        pub fn allow() -> Self {
            Self {
                version: super::PROTOCOL_VERSION.to_string(),
                action: Action::Allow,
                status_code: 200,
                reason: None,
                rule_hits: Vec::new(),
                risk: Risk::none(),
                redactions: Vec::new(),
                metadata: Map::new(),
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn severity_ordering() {
            assert!(Severity::Low < Severity::Med);
            assert!(Severity::Med < Severity::High);
            assert!(Severity::High < Severity::Critical);
        }

        #[test]
        fn risk_bands() {
            let none = Risk::from_hits(&[]);
            assert_eq!((none.score, none.level), (0, RiskLevel::None));

            let high = Risk::from_hits(&[RuleHit::new("a", Severity::High)]);
            assert_eq!((high.score, high.level), (60, RiskLevel::High));

            let med = Risk::from_hits(&[RuleHit::new("a", Severity::Med)]);
            assert_eq!((med.score, med.level), (60, RiskLevel::Med));

            let critical = Risk::from_hits(&[
                RuleHit::new("a", Severity::High),
                RuleHit::new("b", Severity::Critical),
            ]);
            assert_eq!((critical.score, critical.level), (90, RiskLevel::Critical));
        }

        #[test]
        fn action_wire_names() {
            assert_eq!(serde_json::to_string(&Action::Block).unwrap(), "\"BLOCK\"");
            assert_eq!(serde_json::to_string(&Action::Monitor).unwrap(), "\"MONITOR\"");
            assert_eq!(serde_json::to_string(&Severity::Critical).unwrap(), "\"critical\"");
            assert_eq!(serde_json::to_string(&RiskLevel::None).unwrap(), "\"none\"");
        }

        #[test]
        fn hit_message_skipped_when_absent() {
            let hit = RuleHit::new("route.unmatched", Severity::High);
            let json = serde_json::to_string(&hit).unwrap();
            assert_eq!(json, "{\"id\":\"route.unmatched\",\"severity\":\"high\"}");
        }
    }
}

pub mod jsonstats {
    //! Structural measurements of a parsed body sample.

    use serde_json::Value;

    /// Depth and array-size measurements of a JSON value.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct JsonStats {
        /// Nesting depth: a scalar is 1, an empty container is 2, a
        /// populated container is one more than its deepest child.
        pub depth: u32,
        /// Largest array length found anywhere in the value.
        pub max_array_len: u64,
    }

    /// Measure a value in a single recursive walk.
    #[must_use]
    pub fn measure(value: &Value) -> JsonStats {
        let mut max_array_len = 0;
        let depth = walk(value, &mut max_array_len);
        JsonStats { depth, max_array_len }
    }

    fn walk(value: &Value, max_array_len: &mut u64) -> u32 {
        match value {
            Value::Array(items) => {
                *max_array_len = (*max_array_len).max(items.len() as u64);
                match items.iter().map(|v| walk(v, max_array_len)).max() {
                    Some(deepest) => 1 + deepest,
                    None => 2,
                }
            }
            Value::Object(map) => match map.values().map(|v| walk(v, max_array_len)).max() {
                Some(deepest) => 1 + deepest,
                None => 2,
            },
            _ => 1,
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use serde_json::json;

        #[test]
        fn scalar_depth_is_one() {
            assert_eq!(measure(&json!(42)).depth, 1);
            assert_eq!(measure(&json!("s")).depth, 1);
            assert_eq!(measure(&json!(null)).depth, 1);
        }

        #[test]
        fn empty_container_depth_is_two() {
            assert_eq!(measure(&json!({})).depth, 2);
            assert_eq!(measure(&json!([])).depth, 2);
        }

        #[test]
        fn nested_depth() {
            assert_eq!(measure(&json!({"a": 1})).depth, 2);
            assert_eq!(measure(&json!({"a": {"b": 1}})).depth, 3);
            assert_eq!(measure(&json!({"a": {"b": {}}})).depth, 4);
            assert_eq!(measure(&json!([[1, 2], [3]])).depth, 3);
        }

        #[test]
        fn max_array_len_is_global() {
            let v = json!({"a": [1, 2, 3], "b": {"c": [1, 2, 3, 4, 5]}});
            assert_eq!(measure(&v).max_array_len, 5);
        }
    }
}
