#![allow(missing_docs)]

use pdp::{evaluate, run_cel_stage, PdpOptions};
use policy::vuln::EffectiveChecks;
use policy::{Limits, PolicySet};
use proptest::prelude::*;
use serde_json::json;
use shield_core::context::{JsonBody, RequestContext};
use shield_core::decision::{Action, RiskLevel, Severity};

fn rt() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().build().unwrap()
}

fn policy_with_mode(mode: &str) -> PolicySet {
    PolicySet::from_yaml_str(&format!(
        r#"
defaults:
  limits:
    max_json_depth: 4
routes:
  - id: under.test
    match: {{ method: POST, path: /p }}
    mode: {mode}
    rules:
      - id: tenant.binding
        type: cel
        severity: critical
        config:
          expression: identity.tenant == request.body.json.sample.tenantId
"#
    ))
    .unwrap()
}

fn ctx_for(tenant: &str, body_tenant: &str, note: &str) -> RequestContext {
    let mut ctx = RequestContext::for_request("POST", "/p");
    ctx.identity.tenant = Some(tenant.to_string());
    let sample = json!({"tenantId": body_tenant, "note": note});
    ctx.request.body.present = true;
    ctx.request.body.size_bytes = sample.to_string().len() as u64;
    ctx.request.body.json = Some(JsonBody { sample, redacted: false });
    ctx
}

fn max_level(decision: &shield_core::decision::Decision) -> RiskLevel {
    decision
        .rule_hits
        .iter()
        .map(|h| match h.severity {
            Severity::Low => RiskLevel::Low,
            Severity::Med => RiskLevel::Med,
            Severity::High => RiskLevel::High,
            Severity::Critical => RiskLevel::Critical,
        })
        .max()
        .unwrap_or(RiskLevel::None)
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 48, .. ProptestConfig::default() })]

    // Two evaluations of the same (policy, context) yield equal decisions.
    #[test]
    fn purity(
        tenant in "[a-z]{1,6}",
        body_tenant in "[a-z]{1,6}",
        note in "[ -~]{0,24}",
    ) {
        let rt = rt();
        let policy = policy_with_mode("enforce");
        let ctx = ctx_for(&tenant, &body_tenant, &note);
        let first = rt.block_on(evaluate(&policy, &ctx, &PdpOptions::default()));
        let second = rt.block_on(evaluate(&policy, &ctx, &PdpOptions::default()));
        prop_assert_eq!(
            serde_json::to_value(&first).unwrap(),
            serde_json::to_value(&second).unwrap()
        );
    }

    // Switching a route between enforce and monitor changes only action
    // and status_code.
    #[test]
    fn mode_invariance_of_hits(
        tenant in "[a-z]{1,6}",
        body_tenant in "[a-z]{1,6}",
        note in "[ -~]{0,24}",
    ) {
        let rt = rt();
        let ctx = ctx_for(&tenant, &body_tenant, &note);
        let enforced = rt.block_on(evaluate(&policy_with_mode("enforce"), &ctx, &PdpOptions::default()));
        let monitored = rt.block_on(evaluate(&policy_with_mode("monitor"), &ctx, &PdpOptions::default()));

        prop_assert_eq!(&enforced.rule_hits, &monitored.rule_hits);
        prop_assert_eq!(enforced.risk, monitored.risk);
        prop_assert_eq!(&enforced.metadata["route_id"], &monitored.metadata["route_id"]);
        if enforced.rule_hits.is_empty() {
            prop_assert_eq!(enforced.action, Action::Allow);
            prop_assert_eq!(monitored.action, Action::Allow);
        } else {
            prop_assert_eq!(enforced.action, Action::Block);
            prop_assert_eq!(enforced.status_code, 403);
            prop_assert_eq!(monitored.action, Action::Monitor);
            prop_assert_eq!(monitored.status_code, 200);
        }
    }

    // risk.level is the maximum hit severity; the score obeys the bands.
    #[test]
    fn severity_monotonicity(
        tenant in "[a-z]{1,6}",
        body_tenant in "[a-z]{1,6}",
        note in "[ -~]{0,24}",
    ) {
        let rt = rt();
        let policy = policy_with_mode("enforce");
        let ctx = ctx_for(&tenant, &body_tenant, &note);
        let decision = rt.block_on(evaluate(&policy, &ctx, &PdpOptions::default()));
        prop_assert_eq!(decision.risk.level, max_level(&decision));
        let expected_score = match decision.risk.level {
            RiskLevel::None => 0,
            RiskLevel::Critical => 90,
            _ => 60,
        };
        prop_assert_eq!(decision.risk.score, expected_score);
        if decision.rule_hits.iter().any(|h| h.severity == Severity::Critical) {
            prop_assert!(decision.risk.score >= 90);
        } else if !decision.rule_hits.is_empty() {
            prop_assert!(decision.risk.score >= 60);
        }
    }

    // Permuting routes whose matches do not collide leaves decisions
    // unchanged.
    #[test]
    fn order_stability(tenant in "[a-z]{1,6}", body_tenant in "[a-z]{1,6}") {
        let forward = PolicySet::from_yaml_str(r#"
routes:
  - id: a
    match: { method: POST, path: /a }
  - id: p
    match: { method: POST, path: /p }
    rules:
      - id: tenant.binding
        type: cel
        severity: critical
        config:
          expression: identity.tenant == request.body.json.sample.tenantId
  - id: z
    match: { method: POST, path: /z }
"#).unwrap();
        let reversed = {
            let mut set = forward.clone();
            set.routes.reverse();
            set
        };
        let rt = rt();
        let ctx = ctx_for(&tenant, &body_tenant, "note");
        let d1 = rt.block_on(evaluate(&forward, &ctx, &PdpOptions::default()));
        let d2 = rt.block_on(evaluate(&reversed, &ctx, &PdpOptions::default()));
        prop_assert_eq!(
            serde_json::to_value(&d1).unwrap(),
            serde_json::to_value(&d2).unwrap()
        );
    }
}

// The pipeline's hit ids equal the union of what each stage produces
// independently on the same inputs, in stage order.
#[tokio::test]
async fn stage_completeness() {
    let policy = policy_with_mode("enforce");
    let route = &policy.routes[0];
    let mut ctx = ctx_for("t-1", "t-2", "x");
    ctx.request.body.json.as_mut().unwrap().sample =
        json!({"tenantId": "t-2", "a": {"b": {"c": {"d": 1}}}});

    let decision = evaluate(&policy, &ctx, &PdpOptions::default()).await;
    let pipeline_ids: Vec<String> =
        decision.rule_hits.iter().map(|h| h.id.clone()).collect();

    let checks =
        EffectiveChecks::resolve(&policy.defaults.vulnerability_checks, route.vulnerability.as_ref());
    let mut stage_ids: Vec<String> = scanners::scan_vulnerabilities(&ctx, &checks)
        .into_iter()
        .map(|h| h.id)
        .collect();
    let limits = Limits::resolve(route.limits.as_ref(), &policy.defaults.limits);
    stage_ids.extend(scanners::check_limits(&ctx, &limits).into_iter().map(|h| h.id));
    stage_ids.extend(run_cel_stage(route, &ctx, None).into_iter().map(|h| h.id));

    assert_eq!(pipeline_ids, stage_ids);
    assert!(pipeline_ids.contains(&"limit.json.depth".to_string()));
    assert!(pipeline_ids.contains(&"tenant.binding".to_string()));
}
