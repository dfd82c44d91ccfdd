//! ContractShield Policy Decision Point.
//!
//! `evaluate` is a deterministic evaluator: given a policy document and a
//! canonical request context it produces a [`Decision`] with an
//! explainable trail of rule hits. For any (policy, context) pair the
//! rule-hit sequence is byte-identical across invocations, modulo the
//! replay store's observable state.
//!
//! Stage order is fixed; reordering is a breaking change:
//! 1. Route match (a synthetic `route.unmatched` hit short-circuits,
//!    since later stages have no route context)
//! 2. Vulnerability scanners
//! 3. Limit checker
//! 4. Schema contract validation
//! 5. Webhook signature + replay (only for webhook-bearing routes)
//! 6. CEL rules, in policy order
//!
//! Stages 2-6 always run to completion even when earlier stages produced
//! hits, so policy authors see every violation at once and the hit
//! sequence does not depend on short-circuiting. Hits appear in stage
//! order; within a stage, in the deterministic order the stage inspects
//! its inputs.
//!
//! Decision folding:
//! - no hits ⇒ `ALLOW`, status 200;
//! - hits in `enforce` mode ⇒ `BLOCK`, status `block_status_code`;
//! - hits in `monitor` mode ⇒ `MONITOR`, status 200;
//! - risk level is the maximum hit severity; a critical hit pins the
//!   score to 90, any other hit to 60.
//!
//! Capability errors (schema loader failure, missing secret, replay store
//! error) and programmer errors in host-provided capabilities become
//! critical hits from the owning stage; the pipeline never throws through
//! to the host. An `evaluate` call may suspend only at the schema loader
//! and at the replay store.

#![deny(unsafe_code)]

mod env;
mod observe;
mod options;
mod route;

pub use env::build_cel_env;
pub use observe::{
    action_str, install_audit_sink, pdp_metrics, set_observer, AuditRecord, AuditSink,
    DecisionObserver, PdpMetrics,
};
pub use options::PdpOptions;
pub use route::{match_route, RULE_ROUTE_UNMATCHED};

use cel::{CelEvaluator, MiniCel};
use policy::vuln::EffectiveChecks;
use policy::{Limits, Mode, PolicyRoute, PolicySet, RuleKind, UnmatchedRouteAction};
use serde_json::{Map, Value};
use shield_core::context::RequestContext;
use shield_core::decision::{Action, Decision, Risk, RuleHit, Severity};
use shield_core::PROTOCOL_VERSION;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::instrument;
use webhook_host::WebhookStageDeps;

static MINI_CEL: MiniCel = MiniCel;

/// Evaluate one request context against a policy.
///
/// The context is never mutated; all mutable state is local to the call
/// except the compiled-schema cache, the plugin registry and the replay
/// store, whose concurrency behavior is documented on their own types.
#[instrument(name = "shield.evaluate", skip_all, fields(method = %ctx.request.method, path = %ctx.request.path))]
pub async fn evaluate(policy: &PolicySet, ctx: &RequestContext, options: &PdpOptions) -> Decision {
    let Some(matched) = match_route(
        &policy.routes,
        &ctx.request.method,
        &ctx.request.path,
        ctx.request.route_id.as_deref(),
    ) else {
        return unmatched(policy);
    };

    let mode = matched.effective_mode(&policy.defaults);
    let mut hits: Vec<RuleHit> = Vec::new();

    // Stage 2: vulnerability scanners.
    let checks =
        EffectiveChecks::resolve(&policy.defaults.vulnerability_checks, matched.vulnerability.as_ref());
    hits.extend(scanners::scan_vulnerabilities(ctx, &checks));

    // Stage 3: limit checker.
    let limits = Limits::resolve(matched.limits.as_ref(), &policy.defaults.limits);
    hits.extend(scanners::check_limits(ctx, &limits));

    // Stage 4: schema contract.
    if let Some(contract_cfg) = &matched.contract {
        hits.extend(
            contract::run_contract_stage(contract_cfg, options.schema_loader.as_deref(), ctx)
                .await,
        );
    }

    // Stage 5: webhook signature + replay.
    if let Some(webhook_cfg) = &matched.webhook {
        let deps = WebhookStageDeps {
            secret_provider: options.secret_provider.as_deref(),
            replay_store: options.replay_store.as_deref(),
            clock: options.clock.as_ref(),
        };
        hits.extend(webhook_host::run_webhook_stage(webhook_cfg, &matched.id, ctx, &deps).await);
    }

    // Stage 6: CEL rules, in policy order.
    hits.extend(run_cel_stage(matched, ctx, options.cel_evaluator.as_deref()));

    finalize(policy, Some(matched), mode, hits)
}

/// Evaluate the CEL rules of a route against a fresh environment.
///
/// Exposed so hosts and property tests can exercise the stage in
/// isolation; `evaluate` calls the same code.
#[must_use]
pub fn run_cel_stage(
    route: &PolicyRoute,
    ctx: &RequestContext,
    evaluator: Option<&dyn CelEvaluator>,
) -> Vec<RuleHit> {
    let cel_rules: Vec<_> =
        route.rules.iter().filter(|r| matches!(r.kind, RuleKind::Cel(_))).collect();
    if cel_rules.is_empty() {
        return Vec::new();
    }
    let env = build_cel_env(ctx);
    let evaluator = evaluator.unwrap_or(&MINI_CEL);
    let mut hits = Vec::new();
    for rule in cel_rules {
        let RuleKind::Cel(cfg) = &rule.kind else {
            continue;
        };
        match catch_unwind(AssertUnwindSafe(|| evaluator.eval(&cfg.expression, &env))) {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) | Ok(Err(_)) => {
                hits.push(RuleHit::with_message(
                    rule.id.clone(),
                    rule.severity,
                    "CEL invariant failed",
                ));
            }
            Err(_) => {
                // Programmer error in a host-provided evaluator; the
                // evaluation still completes.
                hits.push(RuleHit::with_message(
                    rule.id.clone(),
                    Severity::Critical,
                    "CEL evaluator panicked",
                ));
            }
        }
    }
    hits
}

fn unmatched(policy: &PolicySet) -> Decision {
    let mode = policy.defaults.mode.unwrap_or(Mode::Enforce);
    let disposition =
        policy.defaults.unmatched_route_action.unwrap_or(UnmatchedRouteAction::Allow);
    let (action, status_code, hits) = match disposition {
        UnmatchedRouteAction::Allow => (Action::Allow, 200, Vec::new()),
        UnmatchedRouteAction::Block => (
            Action::Block,
            policy.defaults.response.block_status_code,
            vec![RuleHit::new(RULE_ROUTE_UNMATCHED, Severity::High)],
        ),
        UnmatchedRouteAction::Monitor => (
            Action::Monitor,
            200,
            vec![RuleHit::new(RULE_ROUTE_UNMATCHED, Severity::Med)],
        ),
    };
    let risk = Risk::from_hits(&hits);
    let reason = hits.first().map(|h| format!("policy violation: {}", h.id));
    let mut metadata = Map::new();
    metadata.insert("mode".to_string(), Value::String(mode.as_str().to_string()));
    let decision = Decision {
        version: PROTOCOL_VERSION.to_string(),
        action,
        status_code,
        reason,
        rule_hits: hits,
        risk,
        redactions: Vec::new(),
        metadata,
    };
    observe::notify_observers_and_record(None, &decision);
    decision
}

fn finalize(
    policy: &PolicySet,
    route: Option<&PolicyRoute>,
    mode: Mode,
    hits: Vec<RuleHit>,
) -> Decision {
    let risk = Risk::from_hits(&hits);
    let (action, status_code) = if hits.is_empty() {
        (Action::Allow, 200)
    } else {
        match mode {
            Mode::Enforce => (Action::Block, policy.defaults.response.block_status_code),
            Mode::Monitor => (Action::Monitor, 200),
        }
    };
    let reason = match hits.len() {
        0 => None,
        1 => Some(format!("policy violation: {}", hits[0].id)),
        n => Some(format!("policy violations: {} and {} more", hits[0].id, n - 1)),
    };
    let mut metadata = Map::new();
    if let Some(route) = route {
        metadata.insert("route_id".to_string(), Value::String(route.id.clone()));
    }
    metadata.insert("mode".to_string(), Value::String(mode.as_str().to_string()));
    let decision = Decision {
        version: PROTOCOL_VERSION.to_string(),
        action,
        status_code,
        reason,
        rule_hits: hits,
        risk,
        redactions: Vec::new(),
        metadata,
    };
    observe::notify_observers_and_record(route.map(|r| r.id.as_str()), &decision);
    decision
}
