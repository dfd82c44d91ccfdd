//! Tracing-backed observer for PDP decisions.

use crate::EvalMetrics;
use shield_core::decision::Decision;
use tracing::info;

/// Observer logging every decision as a structured `tracing` event and
/// feeding an [`EvalMetrics`] instance.
#[derive(Clone, Default)]
pub struct TracingDecisionObserver {
    metrics: EvalMetrics,
}

impl TracingDecisionObserver {
    /// Observer with fresh counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The counters this observer feeds.
    #[must_use]
    pub fn metrics(&self) -> EvalMetrics {
        self.metrics.clone()
    }
}

impl pdp::DecisionObserver for TracingDecisionObserver {
    fn on_decision(&self, route_id: Option<&str>, decision: &Decision) {
        self.metrics.record(decision.action);
        info!(
            route = route_id.unwrap_or("-"),
            action = pdp::action_str(decision.action),
            status = decision.status_code,
            hits = decision.rule_hits.len(),
            risk_score = decision.risk.score,
            "decision"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pdp::{evaluate, DecisionObserver, PdpOptions};
    use policy::PolicySet;
    use shield_core::context::RequestContext;

    #[tokio::test]
    async fn observer_counts_decisions() {
        let observer = TracingDecisionObserver::new();
        let metrics = observer.metrics();
        let policy = PolicySet::from_yaml_str(
            "defaults:\n  unmatched_route_action: block\nroutes: []\n",
        )
        .unwrap();
        let ctx = RequestContext::for_request("GET", "/nope");
        let decision = evaluate(&policy, &ctx, &PdpOptions::default()).await;
        observer.on_decision(None, &decision);
        let (evaluations, blocks, _) = metrics.snapshot();
        assert_eq!(evaluations, 1);
        assert_eq!(blocks, 1);
    }
}
