//! Capability bag handed to `evaluate`.
//!
//! All side-effectful configuration of the PDP passes through these
//! options; the core consumes no environment variables of its own.

use cel::CelEvaluator;
use contract::SchemaLoader;
use replay_store::ReplayStore;
use shield_core::clock::{Clock, SystemClock};
use std::sync::Arc;
use webhook_host::SecretProvider;

/// Host-injected capabilities. Every capability is optional; the stage
/// that needs a missing one reports a capability failure as a critical
/// hit rather than erroring out.
#[derive(Clone)]
pub struct PdpOptions {
    /// Resolves schema refs; may suspend.
    pub schema_loader: Option<Arc<dyn SchemaLoader>>,
    /// Expression evaluator override; the built-in minimal dialect is
    /// used when absent.
    pub cel_evaluator: Option<Arc<dyn CelEvaluator>>,
    /// Webhook replay store; may suspend. Replay protection is skipped
    /// without one.
    pub replay_store: Option<Arc<dyn ReplayStore>>,
    /// Webhook secret source of last resort.
    pub secret_provider: Option<Arc<dyn SecretProvider>>,
    /// Evaluation clock; the system clock unless a test injects one.
    pub clock: Arc<dyn Clock>,
}

impl Default for PdpOptions {
    fn default() -> Self {
        Self {
            schema_loader: None,
            cel_evaluator: None,
            replay_store: None,
            secret_provider: None,
            clock: Arc::new(SystemClock),
        }
    }
}

impl PdpOptions {
    /// Options with every capability absent and the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a schema loader.
    #[must_use]
    pub fn with_schema_loader(mut self, loader: Arc<dyn SchemaLoader>) -> Self {
        self.schema_loader = Some(loader);
        self
    }

    /// Install a custom expression evaluator.
    #[must_use]
    pub fn with_cel_evaluator(mut self, evaluator: Arc<dyn CelEvaluator>) -> Self {
        self.cel_evaluator = Some(evaluator);
        self
    }

    /// Install a replay store.
    #[must_use]
    pub fn with_replay_store(mut self, store: Arc<dyn ReplayStore>) -> Self {
        self.replay_store = Some(store);
        self
    }

    /// Install a secret provider.
    #[must_use]
    pub fn with_secret_provider(mut self, provider: Arc<dyn SecretProvider>) -> Self {
        self.secret_provider = Some(provider);
        self
    }

    /// Install a clock (tests, replay).
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}
