//! Session manager: webhook dispatch, admission, session lifecycle
//!
//! The manager owns the session index. Webhook handlers reply to the
//! carrier first and hand the event here; anything that needs I/O
//! (tenant resolution, capacity, call-control actions) happens after the
//! HTTP response is gone. Events for calls that no longer exist are
//! dropped with a log, never an error.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

use super::session::{media_stream_url, CallEvent, CallSession, SessionContext};
use crate::capacity::{Admission, CapacityService, TenantDirectory};
use crate::carrier::{CallControlClient, StreamParams};
use crate::config::Config;
use crate::stt::WhisperHttpProvider;
use crate::tts::TtsClient;
use crate::types::TransportMode;

/// Queue depth per call; media frames dominate
const SESSION_QUEUE_DEPTH: usize = 256;
/// How long the at-capacity message gets to play before hangup
const AT_CAPACITY_PLAY_MS: u64 = 4_000;

/// Parsed carrier webhook envelope
#[derive(Debug, Clone, Deserialize)]
pub struct CarrierWebhook {
    pub event_type: String,
    pub call_control_id: String,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub client_state: Option<String>,
}

impl CarrierWebhook {
    /// Decode the carrier's `{data:{event_type, payload:{...}}}` body
    pub fn from_body(body: &serde_json::Value) -> Option<Self> {
        let data = body.get("data")?;
        let event_type = data.get("event_type")?.as_str()?.to_string();
        let payload = data.get("payload")?;
        Some(Self {
            event_type,
            call_control_id: payload.get("call_control_id")?.as_str()?.to_string(),
            from: payload
                .get("from")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            to: payload
                .get("to")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            client_state: payload
                .get("client_state")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        })
    }
}

struct SessionHandle {
    tx: mpsc::Sender<CallEvent>,
}

/// Owns every live call session
pub struct SessionManager {
    config: Arc<Config>,
    ctx: SessionContext,
    directory: TenantDirectory,
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

impl SessionManager {
    /// Build all shared service clients and connect the store
    pub async fn new(config: Arc<Config>) -> Result<Arc<Self>> {
        let carrier = CallControlClient::new(config.telnyx.api_key.clone())
            .context("call-control client")?;
        let capacity = CapacityService::connect(config.capacity.clone())
            .await
            .context("capacity store")?;
        let directory = TenantDirectory::connect(config.capacity.clone())
            .await
            .context("tenant directory")?;
        let stt_provider = Arc::new(
            WhisperHttpProvider::new(
                config.providers.whisper_url.clone(),
                std::time::Duration::from_secs(10),
            )
            .context("stt provider")?,
        );
        let brain =
            crate::brain::BrainClient::new(config.providers.brain_url.clone()).context("brain")?;
        let tts = TtsClient::new(
            config.providers.kokoro_url.clone(),
            config.audio.storage_dir.clone(),
            config.audio.public_base_url.clone(),
            config.telnyx.target_sample_rate,
        )
        .context("tts client")?;

        let ctx = SessionContext {
            config: config.clone(),
            carrier,
            capacity,
            stt_provider,
            brain,
            tts,
        };

        Ok(Arc::new(Self {
            config,
            ctx,
            directory,
            sessions: RwLock::new(HashMap::new()),
        }))
    }

    /// Number of live sessions (health endpoint)
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Deliver an event to a call's queue. Events for unknown calls are
    /// dropped with a log.
    pub async fn enqueue(&self, call_control_id: &str, event: CallEvent) -> bool {
        let sessions = self.sessions.read().await;
        match sessions.get(call_control_id) {
            Some(handle) => {
                if handle.tx.send(event).await.is_err() {
                    debug!(call_control_id, "session queue closed; event dropped");
                    false
                } else {
                    true
                }
            }
            None => {
                debug!(call_control_id, "event for unknown call dropped");
                false
            }
        }
    }

    /// True when the call has a live session (media WS gate)
    pub async fn has_session(&self, call_control_id: &str) -> bool {
        self.sessions.read().await.contains_key(call_control_id)
    }

    /// Route one verified webhook. Called after the HTTP reply is sent.
    pub async fn dispatch_webhook(self: &Arc<Self>, webhook: CarrierWebhook) {
        let call_id = webhook.call_control_id.clone();
        match webhook.event_type.as_str() {
            "call.initiated" => {
                self.clone().on_call_initiated(webhook).await;
            }
            "call.answered" => {
                self.enqueue(&call_id, CallEvent::Answered).await;
            }
            "call.playback.started" => {
                self.enqueue(&call_id, CallEvent::PlaybackStarted).await;
            }
            "call.playback.ended" => {
                self.enqueue(&call_id, CallEvent::PlaybackEnded).await;
            }
            "call.hangup" | "call.ended" => {
                self.enqueue(
                    &call_id,
                    CallEvent::Hangup {
                        reason: webhook.event_type.clone(),
                        notify_carrier: false,
                    },
                )
                .await;
            }
            other => {
                debug!(call_control_id = %call_id, event_type = other, "unhandled webhook event");
            }
        }
    }

    async fn on_call_initiated(self: Arc<Self>, webhook: CarrierWebhook) {
        let call_id = webhook.call_control_id.clone();
        let to = webhook.to.clone().unwrap_or_default();

        // Tenant resolution is a single key lookup
        let tenant_id = match self.directory.resolve_did(&to).await {
            Ok(Some(tenant)) => tenant,
            Ok(None) => {
                warn!(call_control_id = %call_id, to = %to, "no tenant for dialed number");
                let _ = self.ctx.carrier.hangup(&call_id).await;
                return;
            }
            Err(e) => {
                error!(call_control_id = %call_id, error = %format!("{e:#}"), "tenant lookup failed");
                let _ = self.ctx.carrier.hangup(&call_id).await;
                return;
            }
        };

        let tenant_cfg = self
            .directory
            .tenant_config(&tenant_id)
            .await
            .unwrap_or_default();

        match self
            .ctx
            .capacity
            .try_acquire(&tenant_id, &call_id, Utc::now())
            .await
        {
            Ok(Admission::Admitted) => {}
            Ok(Admission::Denied(reason)) => {
                info!(
                    call_control_id = %call_id,
                    tenant_id = %tenant_id,
                    reason = reason.as_str(),
                    "capacity denied"
                );
                self.play_at_capacity_and_hangup(call_id).await;
                return;
            }
            Err(e) => {
                error!(call_control_id = %call_id, error = %format!("{e:#}"), "capacity check failed");
                let _ = self.ctx.carrier.hangup(&call_id).await;
                return;
            }
        }

        // Admitted: spin up the session, then answer with streaming
        let transport = match webhook.client_state.as_deref() {
            Some("webrtc_hd") => TransportMode::WebrtcHd,
            _ => TransportMode::Pstn,
        };
        let (tx, rx) = mpsc::channel(SESSION_QUEUE_DEPTH);
        let session = CallSession::new(
            call_id.clone(),
            tenant_id.clone(),
            tenant_cfg,
            transport,
            self.ctx.clone(),
            rx,
            tx.clone(),
        );
        self.sessions
            .write()
            .await
            .insert(call_id.clone(), SessionHandle { tx });

        let manager = self.clone();
        let spawned_id = call_id.clone();
        tokio::spawn(async move {
            session.run().await;
            manager.sessions.write().await.remove(&spawned_id);
            info!(call_control_id = %spawned_id, "session deregistered");
        });

        let params = StreamParams {
            stream_url: media_stream_url(
                &self.config.server.public_base_url,
                &call_id,
                &self.config.server.media_stream_token,
            ),
            track: self.config.telnyx.stream_track,
            codec: self.config.telnyx.stream_codec.clone(),
        };
        if let Err(e) = self.ctx.carrier.answer(&call_id, Some(&params)).await {
            error!(call_control_id = %call_id, error = %format!("{e:#}"), "answer failed");
            self.enqueue(
                &call_id,
                CallEvent::Hangup {
                    reason: "answer_failed".into(),
                    notify_carrier: true,
                },
            )
            .await;
        }
    }

    /// Capacity denied: short apology, then hang up. No session exists.
    async fn play_at_capacity_and_hangup(self: Arc<Self>, call_id: String) {
        let carrier = self.ctx.carrier.clone();
        let audio_url = format!(
            "{}/at_capacity.wav",
            self.config.audio.public_base_url.trim_end_matches('/')
        );
        tokio::spawn(async move {
            if let Err(e) = carrier.answer(&call_id, None).await {
                warn!(call_control_id = %call_id, error = %format!("{e:#}"), "answer for capacity message failed");
            }
            if let Err(e) = carrier.playback_start(&call_id, &audio_url).await {
                warn!(call_control_id = %call_id, error = %format!("{e:#}"), "at-capacity playback failed");
            }
            tokio::time::sleep(std::time::Duration::from_millis(AT_CAPACITY_PLAY_MS)).await;
            if let Err(e) = carrier.hangup(&call_id).await {
                warn!(call_control_id = %call_id, error = %format!("{e:#}"), "hangup after capacity message failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_webhook_envelope_parsing() {
        let body = serde_json::json!({
            "data": {
                "event_type": "call.initiated",
                "payload": {
                    "call_control_id": "v3:abc",
                    "from": "+15550001111",
                    "to": "+15552223333",
                    "client_state": null
                }
            }
        });
        let parsed = CarrierWebhook::from_body(&body).unwrap();
        assert_eq!(parsed.event_type, "call.initiated");
        assert_eq!(parsed.call_control_id, "v3:abc");
        assert_eq!(parsed.from.as_deref(), Some("+15550001111"));
        assert_eq!(parsed.to.as_deref(), Some("+15552223333"));
        assert!(parsed.client_state.is_none());
    }

    #[test]
    fn test_webhook_envelope_missing_fields() {
        let body = serde_json::json!({"data": {"event_type": "call.hangup"}});
        assert!(CarrierWebhook::from_body(&body).is_none());

        let body = serde_json::json!({"ping": true});
        assert!(CarrierWebhook::from_body(&body).is_none());
    }
}
