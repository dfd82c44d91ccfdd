//! Frozen CEL environment built once per evaluation.

use serde_json::{json, Map, Value};
use shield_core::context::RequestContext;

fn string_map<'a, I: Iterator<Item = (&'a String, &'a String)>>(entries: I) -> Value {
    Value::Object(entries.map(|(k, v)| (k.clone(), Value::String(v.clone()))).collect::<Map<_, _>>())
}

fn opt(value: Option<&String>) -> Value {
    value.map_or(Value::Null, |s| Value::String(s.clone()))
}

/// Build the expression environment from a context. Computed once per
/// `evaluate` call and shared by every CEL rule of the route.
#[must_use]
pub fn build_cel_env(ctx: &RequestContext) -> Value {
    let mut body = json!({
        "present": ctx.request.body.present,
        "size_bytes": ctx.request.body.size_bytes,
    });
    if let Some(json_body) = &ctx.request.body.json {
        body["json"] = json!({ "sample": json_body.sample.clone() });
    }

    json!({
        "request": {
            "method": ctx.request.method,
            "path": ctx.request.path,
            "route_id": opt(ctx.request.route_id.as_ref()),
            "headers": string_map(ctx.request.headers.iter()),
            "content_type": opt(ctx.request.content_type.as_ref()),
            "body": body,
        },
        "identity": {
            "authenticated": ctx.identity.authenticated,
            "subject": opt(ctx.identity.subject.as_ref()),
            "tenant": opt(ctx.identity.tenant.as_ref()),
            "scopes": ctx.identity.scopes,
            "claims": ctx.identity.claims,
        },
        "client": {
            "ip": opt(ctx.client.ip.as_ref()),
            "user_agent": opt(ctx.client.user_agent.as_ref()),
        },
        "runtime": {
            "language": opt(ctx.runtime.language.as_ref()),
            "service": opt(ctx.runtime.service.as_ref()),
            "env": opt(ctx.runtime.env.as_ref()),
        },
        "webhook": {
            "provider": opt(ctx.webhook.as_ref().and_then(|w| w.provider.as_ref())),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_mirrors_context() {
        let mut ctx = RequestContext::for_request("POST", "/api/x");
        ctx.identity.tenant = Some("t-1".into());
        ctx.identity.scopes = vec!["read".into()];
        ctx.request.headers.insert("content-type".into(), "application/json".into());
        ctx.request.body.present = true;
        ctx.request.body.size_bytes = 2;
        ctx.request.body.json = Some(shield_core::context::JsonBody {
            sample: json!({"tenantId": "t-1"}),
            redacted: false,
        });

        let env = build_cel_env(&ctx);
        assert_eq!(env["request"]["method"], "POST");
        assert_eq!(env["request"]["headers"]["content-type"], "application/json");
        assert_eq!(env["request"]["body"]["json"]["sample"]["tenantId"], "t-1");
        assert_eq!(env["identity"]["tenant"], "t-1");
        assert_eq!(env["identity"]["scopes"][0], "read");
        // Absent optionals are null, not missing.
        assert_eq!(env["client"]["ip"], Value::Null);
    }

    #[test]
    fn env_omits_unparsed_body_sample() {
        let ctx = RequestContext::for_request("GET", "/x");
        let env = build_cel_env(&ctx);
        assert_eq!(env["request"]["body"]["present"], false);
        assert!(env["request"]["body"].get("json").is_none());
    }
}
