//! Webhook plugin framework: provider registry, signature verification
//! and replay protection.
//!
//! The registry is process-wide with an init-once, read-many lifecycle:
//! the four built-in providers are seeded on first access and custom
//! plugins registered later are visible to subsequent evaluations (not to
//! in-flight ones). Verification is deny-on-failure: a missing plugin,
//! missing raw body, unresolvable secret or bad signature each emit a
//! critical hit and end the stage before the replay check.
//!
//! Hit messages never contain secrets or raw request bodies.

#![deny(unsafe_code)]

mod providers;
mod sig;

pub use providers::{GithubPlugin, SlackPlugin, StripePlugin, TwilioPlugin};

use policy::WebhookConfig;
use replay_store::{ReplayCheck, ReplayStore};
use shield_core::clock::Clock;
use shield_core::context::RequestContext;
use shield_core::decision::{RuleHit, Severity};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};
use tracing::{debug, info_span};

/// Default signature timestamp tolerance and replay TTL, in seconds.
pub const DEFAULT_TOLERANCE_SECS: u64 = 300;

/// Inputs a plugin needs beyond the context and the secret.
#[derive(Debug, Clone, Copy)]
pub struct VerifyOptions {
    /// Maximum accepted distance between the signature timestamp and now.
    pub tolerance_secs: u64,
    /// Evaluation time in milliseconds since the UNIX epoch.
    pub now_ms: u64,
}

/// Outcome of one signature verification.
#[derive(Debug, Clone)]
pub struct SignatureOutcome {
    /// Whether the signature matched.
    pub valid: bool,
    /// Failure reason; safe for logging.
    pub reason: Option<String>,
    /// Timestamp carried by the signature scheme, when it has one.
    pub timestamp: Option<u64>,
}

impl SignatureOutcome {
    /// Successful verification.
    #[must_use]
    pub fn ok(timestamp: Option<u64>) -> Self {
        Self { valid: true, reason: None, timestamp }
    }

    /// Failed verification with a reason.
    pub fn fail(reason: impl Into<String>) -> Self {
        Self { valid: false, reason: Some(reason.into()), timestamp: None }
    }
}

/// One webhook provider implementation.
pub trait WebhookPlugin: Send + Sync {
    /// Registry name of the provider.
    fn name(&self) -> &'static str;

    /// Headers the provider's scheme reads.
    fn required_headers(&self) -> &'static [&'static str];

    /// Verify the signature over the canonical context.
    fn validate_signature(
        &self,
        ctx: &RequestContext,
        secret: &[u8],
        opts: &VerifyOptions,
    ) -> SignatureOutcome;

    /// Provider-assigned event id, for replay protection.
    fn extract_event_id(&self, ctx: &RequestContext) -> Option<String>;

    /// Provider-assigned event type, for `allowed_event_types` filtering.
    fn extract_event_type(&self, _ctx: &RequestContext) -> Option<String> {
        None
    }
}

/// Host-injected secret source, consulted after the inline secret and the
/// `secret_ref` environment variable.
pub trait SecretProvider: Send + Sync {
    /// Resolve the signing secret for a (provider, route) pair.
    fn get_secret(&self, provider: &str, route_id: &str, ctx: &RequestContext) -> Option<String>;
}

static REGISTRY: OnceLock<RwLock<HashMap<String, Arc<dyn WebhookPlugin>>>> = OnceLock::new();

fn registry() -> &'static RwLock<HashMap<String, Arc<dyn WebhookPlugin>>> {
    REGISTRY.get_or_init(|| {
        let mut map: HashMap<String, Arc<dyn WebhookPlugin>> = HashMap::new();
        for plugin in builtin_plugins() {
            map.insert(plugin.name().to_string(), plugin);
        }
        RwLock::new(map)
    })
}

/// The four built-in provider plugins.
#[must_use]
pub fn builtin_plugins() -> Vec<Arc<dyn WebhookPlugin>> {
    vec![
        Arc::new(StripePlugin),
        Arc::new(GithubPlugin),
        Arc::new(SlackPlugin),
        Arc::new(TwilioPlugin),
    ]
}

/// Register (or replace) a plugin under its name. Visible to subsequent
/// evaluations.
pub fn register_plugin(plugin: Arc<dyn WebhookPlugin>) {
    registry()
        .write()
        .expect("plugin registry lock poisoned")
        .insert(plugin.name().to_string(), plugin);
}

/// Look up a plugin by provider name.
#[must_use]
pub fn lookup_plugin(name: &str) -> Option<Arc<dyn WebhookPlugin>> {
    registry().read().expect("plugin registry lock poisoned").get(name).cloned()
}

/// Hit id of the signature check for a provider.
#[must_use]
pub fn signature_rule_id(provider: &str) -> String {
    format!("webhook.{provider}.signature")
}

/// Hit id of the replay check for a provider.
#[must_use]
pub fn replay_rule_id(provider: &str) -> String {
    format!("webhook.{provider}.replay")
}

/// Hit id of the event type filter for a provider.
#[must_use]
pub fn event_type_rule_id(provider: &str) -> String {
    format!("webhook.{provider}.event_type")
}

/// Capabilities the webhook stage borrows from the PDP options.
pub struct WebhookStageDeps<'a> {
    /// Host secret source, if any.
    pub secret_provider: Option<&'a dyn SecretProvider>,
    /// Replay store, if any; replay protection is silently skipped
    /// without one.
    pub replay_store: Option<&'a dyn ReplayStore>,
    /// Evaluation clock.
    pub clock: &'a dyn Clock,
}

/// Run signature verification and replay protection for one route.
///
/// May suspend only at the replay store call.
pub async fn run_webhook_stage(
    config: &WebhookConfig,
    route_id: &str,
    ctx: &RequestContext,
    deps: &WebhookStageDeps<'_>,
) -> Vec<RuleHit> {
    let provider = config.provider.as_str();
    let Some(plugin) = lookup_plugin(provider) else {
        return vec![RuleHit::with_message(
            signature_rule_id(provider),
            Severity::Critical,
            format!("unknown webhook provider '{provider}'"),
        )];
    };

    let mut hits = Vec::new();
    let signature_ok = {
        let span = info_span!("shield.webhook.verify", provider = %provider, route = %route_id);
        let _guard = span.enter();
        verify_signature(config, route_id, ctx, plugin.as_ref(), deps, &mut hits)
    };
    if !signature_ok {
        return hits;
    }

    if let Some(allowed) = &config.allowed_event_types {
        if let Some(event_type) = plugin.extract_event_type(ctx) {
            if !allowed.contains(&event_type) {
                hits.push(RuleHit::with_message(
                    event_type_rule_id(provider),
                    Severity::High,
                    format!("event type '{event_type}' not allowed for this route"),
                ));
            }
        }
    }

    if !config.replay_protection {
        return hits;
    }
    if let Some(replayed) = ctx.webhook.as_ref().and_then(|w| w.replayed) {
        if replayed {
            hits.push(RuleHit::with_message(
                replay_rule_id(provider),
                Severity::Critical,
                "webhook event already processed (fixture override)",
            ));
        }
        return hits;
    }
    let Some(event_id) = plugin.extract_event_id(ctx) else {
        // No id means no replay to detect.
        return hits;
    };
    let Some(store) = deps.replay_store else {
        debug!(provider, "no replay store configured; skipping replay protection");
        return hits;
    };
    let check = ReplayCheck {
        provider: provider.to_string(),
        event_id: event_id.clone(),
        ttl_seconds: config.timestamp_tolerance.unwrap_or(DEFAULT_TOLERANCE_SECS),
    };
    match store.check_and_store(&check).await {
        Ok(true) => hits.push(RuleHit::with_message(
            replay_rule_id(provider),
            Severity::Critical,
            format!("webhook event '{event_id}' already processed"),
        )),
        Ok(false) => {}
        Err(e) => hits.push(RuleHit::with_message(
            replay_rule_id(provider),
            Severity::Critical,
            e.to_string(),
        )),
    }
    hits
}

fn verify_signature(
    config: &WebhookConfig,
    route_id: &str,
    ctx: &RequestContext,
    plugin: &dyn WebhookPlugin,
    deps: &WebhookStageDeps<'_>,
    hits: &mut Vec<RuleHit>,
) -> bool {
    let provider = config.provider.as_str();
    // Fixture override short-circuits verification entirely, raw body or not.
    match ctx.webhook.as_ref().and_then(|w| w.signature_valid) {
        Some(true) => return true,
        Some(false) => {
            hits.push(RuleHit::with_message(
                signature_rule_id(provider),
                Severity::Critical,
                "signature verification failed (fixture override)",
            ));
            return false;
        }
        None => {}
    }
    if config.require_raw_body && ctx.request.body.raw.is_none() {
        hits.push(RuleHit::with_message(
            signature_rule_id(provider),
            Severity::Critical,
            "raw body required for signature verification",
        ));
        return false;
    }
    let Some(secret) = resolve_secret(config, route_id, ctx, deps.secret_provider) else {
        hits.push(RuleHit::with_message(
            signature_rule_id(provider),
            Severity::Critical,
            format!("no signing secret available for provider '{provider}'"),
        ));
        return false;
    };
    let opts = VerifyOptions {
        tolerance_secs: config.timestamp_tolerance.unwrap_or(DEFAULT_TOLERANCE_SECS),
        now_ms: deps.clock.now_ms(),
    };
    let outcome = plugin.validate_signature(ctx, secret.as_bytes(), &opts);
    if outcome.valid {
        true
    } else {
        hits.push(RuleHit::with_message(
            signature_rule_id(provider),
            Severity::Critical,
            outcome.reason.unwrap_or_else(|| "signature verification failed".to_string()),
        ));
        false
    }
}

fn resolve_secret(
    config: &WebhookConfig,
    route_id: &str,
    ctx: &RequestContext,
    provider_cb: Option<&dyn SecretProvider>,
) -> Option<String> {
    if let Some(secret) = &config.secret {
        return Some(secret.clone());
    }
    if let Some(var) = &config.secret_ref {
        if let Ok(value) = std::env::var(var) {
            if !value.is_empty() {
                return Some(value);
            }
        }
    }
    provider_cb?.get_secret(&config.provider, route_id, ctx)
}
