//! Built-in provider plugins: Stripe, GitHub, Slack, Twilio.
//!
//! Each implements its provider's documented signature scheme byte-exactly
//! over `body.raw`; header names are already lowercase in a canonical
//! context.

use crate::sig::{ct_eq_b64, ct_eq_hex, hmac_sha1, hmac_sha256};
use crate::{SignatureOutcome, VerifyOptions, WebhookPlugin};
use serde_json::Value;
use shield_core::context::RequestContext;

fn body_string_field(ctx: &RequestContext, key: &str) -> Option<String> {
    if let Some(json) = &ctx.request.body.json {
        return json.sample.get(key).and_then(Value::as_str).map(ToString::to_string);
    }
    let raw = ctx.request.body.raw.as_deref()?;
    let parsed: Value = serde_json::from_slice(raw).ok()?;
    parsed.get(key).and_then(Value::as_str).map(ToString::to_string)
}

/// Stripe webhook signatures: `stripe-signature: t=<unix>,v1=<hex>`,
/// HMAC-SHA256 over `<t>.<raw_body>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StripePlugin;

impl WebhookPlugin for StripePlugin {
    fn name(&self) -> &'static str {
        "stripe"
    }

    fn required_headers(&self) -> &'static [&'static str] {
        &["stripe-signature"]
    }

    fn validate_signature(
        &self,
        ctx: &RequestContext,
        secret: &[u8],
        opts: &VerifyOptions,
    ) -> SignatureOutcome {
        let Some(header) = ctx.request.header("stripe-signature") else {
            return SignatureOutcome::fail("missing stripe-signature header");
        };
        let mut timestamp: Option<u64> = None;
        let mut candidates: Vec<&str> = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse().ok(),
                Some(("v1", value)) => candidates.push(value),
                _ => {}
            }
        }
        let Some(t) = timestamp else {
            return SignatureOutcome::fail("malformed stripe-signature header");
        };
        if candidates.is_empty() {
            return SignatureOutcome::fail("malformed stripe-signature header");
        }
        if (opts.now_ms / 1000).abs_diff(t) > opts.tolerance_secs {
            return SignatureOutcome {
                valid: false,
                reason: Some("Stripe signature timestamp outside tolerance".into()),
                timestamp: Some(t),
            };
        }
        let Some(raw) = ctx.request.body.raw.as_deref() else {
            return SignatureOutcome::fail("raw body unavailable");
        };
        let mut payload = t.to_string().into_bytes();
        payload.push(b'.');
        payload.extend_from_slice(raw);
        let expected = hmac_sha256(secret, &payload);
        if candidates.iter().any(|candidate| ct_eq_hex(candidate, &expected)) {
            SignatureOutcome::ok(Some(t))
        } else {
            SignatureOutcome::fail("Stripe signature mismatch")
        }
    }

    fn extract_event_id(&self, ctx: &RequestContext) -> Option<String> {
        body_string_field(ctx, "id")
    }

    fn extract_event_type(&self, ctx: &RequestContext) -> Option<String> {
        body_string_field(ctx, "type")
    }
}

/// GitHub webhook signatures: `x-hub-signature-256: sha256=<hex>`,
/// HMAC-SHA256 over the raw body.
#[derive(Debug, Clone, Copy, Default)]
pub struct GithubPlugin;

impl WebhookPlugin for GithubPlugin {
    fn name(&self) -> &'static str {
        "github"
    }

    fn required_headers(&self) -> &'static [&'static str] {
        &["x-hub-signature-256"]
    }

    fn validate_signature(
        &self,
        ctx: &RequestContext,
        secret: &[u8],
        _opts: &VerifyOptions,
    ) -> SignatureOutcome {
        let Some(header) = ctx.request.header("x-hub-signature-256") else {
            return SignatureOutcome::fail("missing x-hub-signature-256 header");
        };
        let Some(candidate) = header.strip_prefix("sha256=") else {
            return SignatureOutcome::fail("malformed x-hub-signature-256 header");
        };
        let Some(raw) = ctx.request.body.raw.as_deref() else {
            return SignatureOutcome::fail("raw body unavailable");
        };
        let expected = hmac_sha256(secret, raw);
        if ct_eq_hex(candidate, &expected) {
            SignatureOutcome::ok(None)
        } else {
            SignatureOutcome::fail("GitHub signature mismatch")
        }
    }

    fn extract_event_id(&self, ctx: &RequestContext) -> Option<String> {
        ctx.request.header("x-github-delivery").map(ToString::to_string)
    }

    fn extract_event_type(&self, ctx: &RequestContext) -> Option<String> {
        ctx.request.header("x-github-event").map(ToString::to_string)
    }
}

/// Slack webhook signatures: `x-slack-signature: v0=<hex>` over
/// `v0:<timestamp>:<raw_body>`, HMAC-SHA256.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlackPlugin;

impl WebhookPlugin for SlackPlugin {
    fn name(&self) -> &'static str {
        "slack"
    }

    fn required_headers(&self) -> &'static [&'static str] {
        &["x-slack-signature", "x-slack-request-timestamp"]
    }

    fn validate_signature(
        &self,
        ctx: &RequestContext,
        secret: &[u8],
        opts: &VerifyOptions,
    ) -> SignatureOutcome {
        let Some(header) = ctx.request.header("x-slack-signature") else {
            return SignatureOutcome::fail("missing x-slack-signature header");
        };
        let Some(candidate) = header.strip_prefix("v0=") else {
            return SignatureOutcome::fail("malformed x-slack-signature header");
        };
        let Some(ts) = ctx
            .request
            .header("x-slack-request-timestamp")
            .and_then(|v| v.trim().parse::<u64>().ok())
        else {
            return SignatureOutcome::fail("missing or malformed x-slack-request-timestamp header");
        };
        if (opts.now_ms / 1000).abs_diff(ts) > opts.tolerance_secs {
            return SignatureOutcome {
                valid: false,
                reason: Some("Slack signature timestamp outside tolerance".into()),
                timestamp: Some(ts),
            };
        }
        let Some(raw) = ctx.request.body.raw.as_deref() else {
            return SignatureOutcome::fail("raw body unavailable");
        };
        let mut payload = format!("v0:{ts}:").into_bytes();
        payload.extend_from_slice(raw);
        let expected = hmac_sha256(secret, &payload);
        if ct_eq_hex(candidate, &expected) {
            SignatureOutcome::ok(Some(ts))
        } else {
            SignatureOutcome::fail("Slack signature mismatch")
        }
    }

    fn extract_event_id(&self, ctx: &RequestContext) -> Option<String> {
        body_string_field(ctx, "event_id")
    }

    fn extract_event_type(&self, ctx: &RequestContext) -> Option<String> {
        body_string_field(ctx, "type")
    }
}

/// Twilio webhook signatures: `x-twilio-signature` = base64 HMAC-SHA1 over
/// the full URL concatenated with the sorted-key `<key><value>` pairs of
/// the parsed body.
#[derive(Debug, Clone, Copy, Default)]
pub struct TwilioPlugin;

impl TwilioPlugin {
    fn full_url(ctx: &RequestContext) -> Option<String> {
        if let Some(url) = ctx.request.header("x-forwarded-url") {
            return Some(url.to_string());
        }
        if let Some(url) = ctx.request.header("x-original-url") {
            return Some(url.to_string());
        }
        let host = ctx.request.header("host")?;
        let proto = ctx.request.header("x-forwarded-proto").unwrap_or("https");
        Some(format!("{proto}://{host}{}", ctx.request.path))
    }
}

impl WebhookPlugin for TwilioPlugin {
    fn name(&self) -> &'static str {
        "twilio"
    }

    fn required_headers(&self) -> &'static [&'static str] {
        &["x-twilio-signature"]
    }

    fn validate_signature(
        &self,
        ctx: &RequestContext,
        secret: &[u8],
        _opts: &VerifyOptions,
    ) -> SignatureOutcome {
        let Some(candidate) = ctx.request.header("x-twilio-signature") else {
            return SignatureOutcome::fail("missing x-twilio-signature header");
        };
        let Some(url) = Self::full_url(ctx) else {
            return SignatureOutcome::fail("cannot reconstruct request URL");
        };
        let mut signed = url;
        if let Some(params) =
            ctx.request.body.json.as_ref().and_then(|json| json.sample.as_object())
        {
            // serde_json maps iterate in sorted key order.
            for (key, value) in params {
                signed.push_str(key);
                match value {
                    Value::String(s) => signed.push_str(s),
                    other => signed.push_str(&other.to_string()),
                }
            }
        }
        let expected = hmac_sha1(secret, signed.as_bytes());
        if ct_eq_b64(candidate, &expected) {
            SignatureOutcome::ok(None)
        } else {
            SignatureOutcome::fail("Twilio signature mismatch")
        }
    }

    fn extract_event_id(&self, ctx: &RequestContext) -> Option<String> {
        ctx.request.header("i-twilio-idempotency-token").map(ToString::to_string)
    }

    fn extract_event_type(&self, ctx: &RequestContext) -> Option<String> {
        body_string_field(ctx, "EventType")
    }
}
