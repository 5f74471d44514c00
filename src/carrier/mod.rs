//! Carrier call-control client
//!
//! Every action is a POST to `/calls/{id}/actions/{action}` with bearer
//! auth. Transient failures (429, 5xx) are retried a bounded number of
//! times with jittered exponential backoff; a 422 whose body says the call
//! already ended is success, because racing the carrier's own hangup is
//! routine. Aborted requests are never retried.

use anyhow::{anyhow, Context, Result};
use rand::Rng;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::types::StreamTrack;

const DEFAULT_BASE_URL: &str = "https://api.telnyx.com/v2";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(8);
const MAX_RETRIES: u32 = 2;
const BACKOFF_BASE_MS: u64 = 250;
const BACKOFF_CAP_MS: u64 = 1_500;
const BACKOFF_JITTER_MS: u64 = 120;

/// Client for carrier call-control actions
#[derive(Clone)]
pub struct CallControlClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl CallControlClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        Self::with_base_url(api_key, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("building call-control client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    /// Answer the call, optionally requesting a media stream in the same
    /// action. Stream bodies never carry `media_format`; the codec comes
    /// from configuration via `stream_codec`.
    pub async fn answer(
        &self,
        call_control_id: &str,
        stream: Option<&StreamParams>,
    ) -> Result<()> {
        let mut body = json!({});
        if let Some(params) = stream {
            body = json!({
                "stream_url": params.stream_url,
                "stream_track": params.track.wire_name(),
            });
            sanitize_stream_body(&mut body, &params.codec);
        }
        self.post_action(call_control_id, "answer", body).await
    }

    pub async fn playback_start(&self, call_control_id: &str, audio_url: &str) -> Result<()> {
        self.post_action(
            call_control_id,
            "playback_start",
            json!({ "audio_url": audio_url }),
        )
        .await
    }

    pub async fn playback_stop(&self, call_control_id: &str) -> Result<()> {
        self.post_action(call_control_id, "playback_stop", json!({}))
            .await
    }

    pub async fn streaming_start(
        &self,
        call_control_id: &str,
        params: &StreamParams,
    ) -> Result<()> {
        let mut body = json!({
            "stream_url": params.stream_url,
            "stream_track": params.track.wire_name(),
        });
        sanitize_stream_body(&mut body, &params.codec);
        info!(
            call_control_id,
            stream_url = %redact_token(&params.stream_url),
            track = params.track.wire_name(),
            codec = %params.codec,
            "streaming_start"
        );
        self.post_action(call_control_id, "streaming_start", body)
            .await
    }

    pub async fn streaming_stop(&self, call_control_id: &str) -> Result<()> {
        self.post_action(call_control_id, "streaming_stop", json!({}))
            .await
    }

    pub async fn hangup(&self, call_control_id: &str) -> Result<()> {
        self.post_action(call_control_id, "hangup", json!({})).await
    }

    async fn post_action(&self, call_control_id: &str, action: &str, body: Value) -> Result<()> {
        let url = format!(
            "{}/calls/{call_control_id}/actions/{action}",
            self.base_url
        );

        let mut attempt = 0u32;
        loop {
            let result = self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;

            match result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        debug!(call_control_id, action, "call-control action ok");
                        return Ok(());
                    }
                    let text = response.text().await.unwrap_or_default();

                    // Post-hangup races: the call is gone, the action is moot
                    if status.as_u16() == 422 && is_already_ended(&text) {
                        debug!(call_control_id, action, "call already ended; treating as success");
                        return Ok(());
                    }

                    let retryable = status.as_u16() == 429 || status.is_server_error();
                    if retryable && attempt < MAX_RETRIES {
                        let delay = backoff_delay(attempt);
                        warn!(
                            call_control_id,
                            action,
                            status = status.as_u16(),
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "call-control action failed; retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(anyhow!(
                        "call-control {action} failed with {status}: {text}"
                    ));
                }
                Err(e) => {
                    // Timeouts and connection drops are not retried here;
                    // the caller decides whether the action still matters
                    return Err(e).with_context(|| format!("call-control {action} request"));
                }
            }
        }
    }
}

/// Parameters for stream-carrying actions
#[derive(Debug, Clone)]
pub struct StreamParams {
    pub stream_url: String,
    pub track: StreamTrack,
    pub codec: String,
}

/// Body sent on "already ended" races matches these markers
fn is_already_ended(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("already ended") || lower.contains("no longer active")
}

/// Stream bodies must not carry `media_format`, and the codec always comes
/// from configuration
fn sanitize_stream_body(body: &mut Value, codec: &str) {
    if let Some(map) = body.as_object_mut() {
        map.remove("media_format");
        map.insert("stream_codec".to_string(), Value::String(codec.to_string()));
    }
}

/// Replace the `token` query parameter's value for logging
fn redact_token(stream_url: &str) -> String {
    match url::Url::parse(stream_url) {
        Ok(mut parsed) => {
            let had_token = parsed
                .query_pairs()
                .any(|(k, _)| k == "token");
            if had_token {
                let rewritten: Vec<(String, String)> = parsed
                    .query_pairs()
                    .map(|(k, v)| {
                        if k == "token" {
                            (k.into_owned(), "REDACTED".to_string())
                        } else {
                            (k.into_owned(), v.into_owned())
                        }
                    })
                    .collect();
                parsed
                    .query_pairs_mut()
                    .clear()
                    .extend_pairs(rewritten.iter().map(|(k, v)| (k.as_str(), v.as_str())));
            }
            parsed.to_string()
        }
        Err(_) => stream_url.to_string(),
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let base = BACKOFF_BASE_MS.saturating_mul(1 << attempt).min(BACKOFF_CAP_MS);
    let jitter = rand::rng().random_range(0..=BACKOFF_JITTER_MS);
    Duration::from_millis(base + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_strips_media_format_and_sets_codec() {
        let mut body = json!({
            "stream_url": "wss://example/media",
            "stream_track": "inbound_track",
            "media_format": {"encoding": "L16", "sample_rate": 16000}
        });
        sanitize_stream_body(&mut body, "PCMU");
        assert!(body.get("media_format").is_none());
        assert_eq!(body["stream_codec"], "PCMU");
        assert_eq!(body["stream_track"], "inbound_track");
    }

    #[test]
    fn test_redact_token_hides_value() {
        let url = "wss://host.example/v1/telnyx/media/cc1?token=super-secret&x=1";
        let redacted = redact_token(url);
        assert!(!redacted.contains("super-secret"));
        assert!(redacted.contains("token=REDACTED"));
        assert!(redacted.contains("x=1"));
    }

    #[test]
    fn test_redact_token_without_token_is_unchanged() {
        let url = "wss://host.example/v1/telnyx/media/cc1?a=b";
        assert_eq!(redact_token(url), url);
    }

    #[test]
    fn test_already_ended_markers() {
        assert!(is_already_ended(r#"{"errors":[{"detail":"Call has already ended"}]}"#));
        assert!(is_already_ended(r#"{"errors":[{"detail":"call is no longer active"}]}"#));
        assert!(!is_already_ended(r#"{"errors":[{"detail":"invalid parameter"}]}"#));
    }

    #[test]
    fn test_backoff_is_bounded() {
        for attempt in 0..5 {
            let d = backoff_delay(attempt).as_millis() as u64;
            assert!(d >= BACKOFF_BASE_MS.min(250));
            assert!(d <= BACKOFF_CAP_MS + BACKOFF_JITTER_MS, "attempt {attempt}: {d}");
        }
    }

    #[test]
    fn test_backoff_grows_then_caps() {
        // Deterministic part of the schedule: 250, 500, 1000, 1500, 1500
        let bases: Vec<u64> = (0..5)
            .map(|a| BACKOFF_BASE_MS.saturating_mul(1 << a).min(BACKOFF_CAP_MS))
            .collect();
        assert_eq!(bases, vec![250, 500, 1000, 1500, 1500]);
    }
}
