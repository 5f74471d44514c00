//! Carrier webhook endpoint
//!
//! Verifies the signature over the raw body, replies immediately, and hands
//! the parsed event to the session manager on a spawned task. The carrier's
//! delivery loop never waits on our dialog machinery.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde_json::json;
use tracing::{debug, warn};

use super::AppState;
use crate::call::CarrierWebhook;
use crate::signature::{SignatureScheme, Verdict};

const HDR_SIGNATURE_ED25519: &str = "telnyx-signature-ed25519";
const HDR_SIGNATURE_HMAC: &str = "telnyx-signature";
const HDR_TIMESTAMP: &str = "telnyx-timestamp";

pub async fn handle(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };

    // Prefer Ed25519 when both headers are present
    let (scheme, signature) = {
        let ed = header(HDR_SIGNATURE_ED25519);
        if !ed.is_empty() {
            (SignatureScheme::Ed25519, ed)
        } else {
            (SignatureScheme::HmacSha256, header(HDR_SIGNATURE_HMAC))
        }
    };
    let timestamp = header(HDR_TIMESTAMP);

    let verdict = state.verifier.verify(
        &body,
        &signature,
        &timestamp,
        scheme,
        Utc::now().timestamp(),
    );
    match verdict {
        Verdict::Valid { skipped } => {
            if skipped {
                warn!("webhook accepted without signature verification (dev override)");
            }
        }
        Verdict::Invalid { reason } => {
            debug!(reason = %reason, "webhook rejected");
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "invalid_signature" })),
            );
        }
    }

    let parsed = serde_json::from_slice::<serde_json::Value>(&body)
        .ok()
        .as_ref()
        .and_then(CarrierWebhook::from_body);

    match parsed {
        Some(webhook) => {
            // Reply first; dispatch runs after this response is on the wire
            let manager = state.manager.clone();
            tokio::spawn(async move {
                manager.dispatch_webhook(webhook).await;
            });
            (StatusCode::OK, Json(json!({ "ok": true })))
        }
        None => {
            debug!("webhook body had no recognizable event envelope");
            (StatusCode::OK, Json(json!({ "ok": true })))
        }
    }
}
