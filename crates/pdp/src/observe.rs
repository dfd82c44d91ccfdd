//! In-process observability: decision observer, counters, audit sink.
//!
//! Observers never influence the decision; they exist for tests and
//! in-process metrics. Counters are low-cardinality by construction
//! (keyed by route id and action only).

use shield_core::decision::{Action, Decision};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, RwLock};

/// Observer invoked for each decision the pipeline emits.
///
/// Install an implementation via [`set_observer()`]. Implementations must
/// be cheap and non-blocking; avoid I/O on hot paths.
pub trait DecisionObserver: Send + Sync {
    /// Called once per `evaluate` with the matched route id (if any).
    fn on_decision(&self, route_id: Option<&str>, decision: &Decision);
}

static OBSERVER: OnceLock<RwLock<Option<Arc<dyn DecisionObserver>>>> = OnceLock::new();

/// Install or clear the global decision observer.
pub fn set_observer(observer: Option<Box<dyn DecisionObserver>>) {
    let cell = OBSERVER.get_or_init(|| RwLock::new(None));
    let mut guard = cell.write().expect("observer write lock poisoned");
    *guard = observer.map(Arc::from);
}

/// In-process counters for decisions keyed by `{route, action}`.
#[derive(Default)]
pub struct PdpMetrics {
    inner: Arc<Mutex<HashMap<String, u64>>>,
}

impl PdpMetrics {
    /// Current count for a (route, action) pair. Unmatched evaluations
    /// count under the route key `-`.
    pub fn decision_counter(&self, route: &str, action: &str) -> u64 {
        let key = format!("{route}:{action}");
        self.inner.lock().expect("metrics lock poisoned").get(&key).copied().unwrap_or(0)
    }

    fn inc(&self, route: &str, action: &str) {
        let mut guard = self.inner.lock().expect("metrics lock poisoned");
        *guard.entry(format!("{route}:{action}")).or_insert(0) += 1;
    }
}

static METRICS: OnceLock<PdpMetrics> = OnceLock::new();

/// Access the global decision metrics registry.
pub fn pdp_metrics() -> &'static PdpMetrics {
    METRICS.get_or_init(PdpMetrics::default)
}

/// Audit record for a single decision.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    /// Matched route id, when a route matched.
    pub route_id: Option<String>,
    /// Final action.
    pub action: Action,
    /// Ids of every hit, in emission order.
    pub rule_ids: Vec<String>,
    /// Numeric risk score.
    pub risk_score: u8,
}

/// Handle for draining captured audit records. Cheap to clone;
/// thread-safe.
#[derive(Clone)]
pub struct AuditSink {
    inner: Arc<Mutex<Vec<AuditRecord>>>,
}

impl AuditSink {
    /// Drain and return all captured audit records.
    pub fn drain(&self) -> Vec<AuditRecord> {
        let mut guard = self.inner.lock().expect("audit lock poisoned");
        std::mem::take(&mut *guard)
    }
}

static AUDIT: OnceLock<AuditSink> = OnceLock::new();

/// Install (or retrieve) the process-global audit sink.
pub fn install_audit_sink() -> AuditSink {
    if let Some(sink) = AUDIT.get() {
        return sink.clone();
    }
    let sink = AuditSink { inner: Arc::new(Mutex::new(Vec::new())) };
    let _ = AUDIT.set(sink.clone());
    sink
}

/// Lowercase action name for counters.
#[must_use]
pub fn action_str(action: Action) -> &'static str {
    match action {
        Action::Allow => "allow",
        Action::Block => "block",
        Action::Monitor => "monitor",
        Action::Challenge => "challenge",
    }
}

pub(crate) fn notify_observers_and_record(route_id: Option<&str>, decision: &Decision) {
    let metrics = METRICS.get_or_init(PdpMetrics::default);
    metrics.inc(route_id.unwrap_or("-"), action_str(decision.action));
    if let Some(lock) = OBSERVER.get() {
        if let Ok(guard) = lock.read() {
            if let Some(observer) = guard.as_ref() {
                observer.on_decision(route_id, decision);
            }
        }
    }
    if let Some(sink) = AUDIT.get() {
        let mut guard = sink.inner.lock().expect("audit lock poisoned");
        guard.push(AuditRecord {
            route_id: route_id.map(ToString::to_string),
            action: decision.action,
            rule_ids: decision.rule_hits.iter().map(|h| h.id.clone()).collect(),
            risk_score: decision.risk.score,
        });
    }
}
