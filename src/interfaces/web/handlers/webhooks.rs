use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::{info, warn};

use super::super::AppState;
use crate::core::dispatcher::{FireContext, Outcome};
use crate::core::error::AgentvisorError;
use crate::core::profile::TriggerKind;
use crate::core::state::FireSource;

/// How much of a request body ends up in the daemon log.
const LOGGED_BODY_CHARS: usize = 512;

fn reply(status: StatusCode, body: serde_json::Value) -> Response {
    (status, Json(body)).into_response()
}

pub async fn hook_endpoint(
    Path(trigger_id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let catalog = state.supervisor().declarations().current();
    let Some(trigger) = catalog
        .trigger(&trigger_id)
        .filter(|t| t.enabled && t.kind == TriggerKind::Webhook)
        .cloned()
    else {
        info!(trigger_id = %trigger_id, "Webhook for unknown or disabled trigger");
        return reply(
            StatusCode::NOT_FOUND,
            serde_json::json!({ "success": false, "error": "Unknown trigger" }),
        );
    };

    if let Some(secret) = trigger.secret()
        && !verify_shared_secret(&headers, secret)
        && !verify_webhook_signature(&headers, &body, secret)
    {
        warn!(trigger_id = %trigger_id, "{}", AgentvisorError::Unauthorized);
        return reply(
            StatusCode::UNAUTHORIZED,
            serde_json::json!({ "success": false, "error": "Signature verification failed" }),
        );
    }

    let event = event_type(&headers);
    if let Some(filter) = trigger.event_filter.as_deref()
        && event != Some(filter)
    {
        info!(trigger_id = %trigger_id, event = ?event, filter, "Webhook event filtered out");
        return reply(
            StatusCode::OK,
            serde_json::json!({ "success": true, "status": "ignored" }),
        );
    }

    info!(
        trigger_id = %trigger_id,
        event = ?event,
        bytes = body.len(),
        "Webhook received: {}",
        truncate(&String::from_utf8_lossy(&body), LOGGED_BODY_CHARS)
    );

    let detail = match event {
        Some(event) => format!("event {event}"),
        None => format!("{} byte payload", body.len()),
    };
    let ctx = FireContext::new(FireSource::Webhook).with_detail(detail);
    match state.dispatcher.fire(&trigger, ctx).await {
        Ok(Outcome::Started { pid }) => reply(
            StatusCode::ACCEPTED,
            serde_json::json!({ "success": true, "status": "started", "pid": pid }),
        ),
        Ok(Outcome::AlreadyRunning) => reply(
            StatusCode::CONFLICT,
            serde_json::json!({ "success": false, "status": "already_running" }),
        ),
        Ok(Outcome::Cooldown { remaining_seconds }) => reply(
            StatusCode::CONFLICT,
            serde_json::json!({
                "success": false,
                "status": "cooldown",
                "remaining_seconds": remaining_seconds
            }),
        ),
        Ok(Outcome::Failed(reason)) => reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "success": false, "status": "failed", "error": reason }),
        ),
        Err(e @ AgentvisorError::StateCorrupt { .. }) => reply(
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({ "success": false, "status": "degraded", "error": e.to_string() }),
        ),
        Err(e) => reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "success": false, "status": "failed", "error": e.to_string() }),
        ),
    }
}

fn event_type(headers: &HeaderMap) -> Option<&str> {
    ["x-github-event", "x-event-type"]
        .iter()
        .find_map(|name| headers.get(*name).and_then(|v| v.to_str().ok()))
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

fn verify_shared_secret(headers: &HeaderMap, secret: &str) -> bool {
    headers
        .get("x-webhook-secret")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|given| constant_time_eq(given.as_bytes(), secret.as_bytes()))
}

fn hmac_hex(secret: &str, parts: &[&[u8]]) -> Option<String> {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).ok()?;
    for part in parts {
        mac.update(part);
    }
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Verify webhook signature against common patterns.
/// Supports: GitHub (X-Hub-Signature-256), Stripe (Stripe-Signature), generic (X-Signature).
fn verify_webhook_signature(headers: &HeaderMap, body: &[u8], secret: &str) -> bool {
    // GitHub: X-Hub-Signature-256: sha256=<hex>
    if let Some(sig) = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        && let Some(hex_sig) = sig.strip_prefix("sha256=")
    {
        return hmac_hex(secret, &[body])
            .is_some_and(|expected| constant_time_eq(hex_sig.as_bytes(), expected.as_bytes()));
    }

    // Stripe: Stripe-Signature: t=<timestamp>,v1=<hex>
    if let Some(sig) = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
    {
        let parts: std::collections::HashMap<&str, &str> =
            sig.split(',').filter_map(|p| p.split_once('=')).collect();
        if let (Some(timestamp), Some(v1_sig)) = (parts.get("t"), parts.get("v1")) {
            return hmac_hex(secret, &[timestamp.as_bytes(), b".", body])
                .is_some_and(|expected| constant_time_eq(v1_sig.as_bytes(), expected.as_bytes()));
        }
    }

    // Generic fallback: X-Signature header as raw HMAC-SHA256 hex
    if let Some(sig) = headers.get("x-signature").and_then(|v| v.to_str().ok()) {
        return hmac_hex(secret, &[body])
            .is_some_and(|expected| constant_time_eq(sig.as_bytes(), expected.as_bytes()));
    }

    // No recognized signature header found - fail closed
    false
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

#[cfg(test)]
pub(crate) fn sign_for_tests(secret: &str, body: &[u8]) -> String {
    hmac_hex(secret, &[body]).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn github_signature_is_checked_over_the_raw_body() {
        let body = br#"{"ref":"main"}"#;
        let good = format!("sha256={}", sign_for_tests("s3cret", body));
        assert!(verify_webhook_signature(
            &headers(&[("x-hub-signature-256", good.as_str())]),
            body,
            "s3cret"
        ));
        assert!(!verify_webhook_signature(
            &headers(&[("x-hub-signature-256", good.as_str())]),
            b"tampered",
            "s3cret"
        ));
    }

    #[test]
    fn stripe_signature_covers_the_timestamp() {
        let body = b"{}";
        let v1 = hmac_hex("whsec", &[b"1700000000", b".", body]).unwrap();
        let header = format!("t=1700000000,v1={v1}");
        assert!(verify_webhook_signature(
            &headers(&[("stripe-signature", header.as_str())]),
            body,
            "whsec"
        ));
        let replayed = format!("t=1700000001,v1={v1}");
        assert!(!verify_webhook_signature(
            &headers(&[("stripe-signature", replayed.as_str())]),
            body,
            "whsec"
        ));
    }

    #[test]
    fn missing_signature_fails_closed() {
        assert!(!verify_webhook_signature(&HeaderMap::new(), b"{}", "s3cret"));
    }

    #[test]
    fn shared_secret_header_must_match_exactly() {
        assert!(verify_shared_secret(&headers(&[("x-webhook-secret", "s3cret")]), "s3cret"));
        assert!(!verify_shared_secret(&headers(&[("x-webhook-secret", "s3cre")]), "s3cret"));
        assert!(!verify_shared_secret(&HeaderMap::new(), "s3cret"));
    }

    #[test]
    fn logged_bodies_are_truncated_on_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé...");
        assert_eq!(truncate("short", 10), "short");
    }
}
