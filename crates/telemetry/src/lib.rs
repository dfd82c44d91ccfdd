//! Telemetry: structured logging setup and in-process decision counters.
//!
//! Hosts own exporter wiring; this crate only initializes a JSON tracing
//! subscriber and offers a [`TracingDecisionObserver`] that bridges PDP
//! decisions into `tracing` events.

#![deny(unsafe_code)]

pub mod decision_observer;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

/// Initialize structured logging (JSON) with env filter.
/// Set RUST_LOG, e.g., "info,pdp=debug".
pub fn init_json_logging() {
    let fmt_layer = fmt::layer().json().with_current_span(true).with_span_list(true);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = Registry::default().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).ok();
}

/// Atomic counters over evaluation outcomes.
#[derive(Clone, Default)]
pub struct EvalMetrics {
    evaluations: Arc<AtomicU64>,
    blocks: Arc<AtomicU64>,
    monitors: Arc<AtomicU64>,
}

impl EvalMetrics {
    /// Fresh zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one decision outcome.
    pub fn record(&self, action: shield_core::decision::Action) {
        use shield_core::decision::Action;
        let _ = self.evaluations.fetch_add(1, Ordering::Relaxed);
        match action {
            Action::Block => {
                let _ = self.blocks.fetch_add(1, Ordering::Relaxed);
            }
            Action::Monitor => {
                let _ = self.monitors.fetch_add(1, Ordering::Relaxed);
            }
            Action::Allow | Action::Challenge => {}
        }
    }

    /// (evaluations, blocks, monitors) snapshot.
    #[must_use]
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.evaluations.load(Ordering::Relaxed),
            self.blocks.load(Ordering::Relaxed),
            self.monitors.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shield_core::decision::Action;

    #[test]
    fn counters_accumulate() {
        let metrics = EvalMetrics::new();
        metrics.record(Action::Allow);
        metrics.record(Action::Block);
        metrics.record(Action::Block);
        metrics.record(Action::Monitor);
        assert_eq!(metrics.snapshot(), (4, 2, 1));
    }
}
