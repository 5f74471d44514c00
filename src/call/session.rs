//! Per-call session: one task, one event queue, total order
//!
//! Every event for a call (webhook, media frame, STT result, brain reply,
//! TTS completion, tick) funnels through one bounded channel into one task,
//! so barge-in vs. final vs. hangup ordering questions reduce to queue
//! order. Provider HTTP work runs in spawned subtasks that post their
//! results back into the same queue; the hot media path never awaits I/O.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::coordinator::AudioCoordinator;
use super::state::CallState;
use crate::brain::BrainClient;
use crate::capacity::CapacityService;
use crate::carrier::{CallControlClient, StreamParams};
use crate::config::{Config, TenantConfig};
use crate::media::{HealthAction, IngestConfig, IngestEvent, MediaIngest};
use crate::stt::{SttAction, SttPipeline, SttProvider, Transcription};
use crate::tts::{StagedAudio, TtsClient};
use crate::types::{ConversationTurn, TranscriptSource, TransportMode};

/// Spoken when an upstream provider fails for good
const FALLBACK_LINE: &str = "Sorry, I had a problem responding.";
/// Spoken when the caller has been quiet past the dead-air window
const REPROMPT_LINE: &str = "Are you still there?";
/// Default greeting when the tenant has not configured one
const DEFAULT_GREETING: &str = "Hello! How can I help you today?";

/// Everything that can happen to a call, in arrival order
#[derive(Debug)]
pub enum CallEvent {
    /// Media WebSocket accepted for this call
    MediaConnected,
    /// One text frame off the media WebSocket
    MediaText(String),
    MediaClosed,
    /// Carrier confirmed the call is answered
    Answered,
    PlaybackStarted,
    PlaybackEnded,
    SttResult {
        request_id: u64,
        result: Result<Transcription, String>,
    },
    BrainReply {
        result: Result<String, String>,
    },
    TtsReady {
        text: String,
        result: Result<StagedAudio, String>,
    },
    Tick,
    Hangup {
        reason: String,
        /// True when this runtime decided to end the call itself
        notify_carrier: bool,
    },
}

/// Shared service handles every session clones
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<Config>,
    pub carrier: CallControlClient,
    pub capacity: CapacityService,
    pub stt_provider: Arc<dyn SttProvider>,
    pub brain: BrainClient,
    pub tts: TtsClient,
}

/// One live call
pub struct CallSession {
    call_id: String,
    tenant_id: String,
    tenant_cfg: TenantConfig,
    ctx: SessionContext,

    coordinator: AudioCoordinator,
    ingest: MediaIngest,
    pipeline: SttPipeline,
    history: Vec<ConversationTurn>,

    rx: mpsc::Receiver<CallEvent>,
    self_tx: mpsc::Sender<CallEvent>,
    started: Instant,

    stt_tasks: HashMap<u64, JoinHandle<()>>,
    current_staged: Option<StagedAudio>,
    ws_restarts: u32,
    last_caller_activity_ms: u64,
    reprompted: bool,
    ended: bool,
}

impl CallSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        call_id: String,
        tenant_id: String,
        tenant_cfg: TenantConfig,
        transport: TransportMode,
        ctx: SessionContext,
        rx: mpsc::Receiver<CallEvent>,
        self_tx: mpsc::Sender<CallEvent>,
    ) -> Self {
        let cfg = &ctx.config;
        let coordinator = AudioCoordinator::new(
            call_id.clone(),
            cfg.stt.chunk_ms,
            cfg.stt.pre_roll_ms.min(800),
        );
        let ingest = MediaIngest::new(
            call_id.clone(),
            IngestConfig {
                track_filter: cfg.telnyx.stream_track,
                target_sample_rate: cfg.telnyx.target_sample_rate,
                chunk_ms: cfg.stt.chunk_ms,
                transport,
                accept_codecs: cfg.telnyx.accept_codecs.clone(),
                amrwb_decode: cfg.telnyx.amrwb_decode,
                g722_decode: cfg.telnyx.g722_decode,
                opus_decode: cfg.telnyx.opus_decode,
                max_restart_attempts: 1,
                amrwb_dump_dir: cfg.telnyx.amrwb_dump_dir.clone(),
            },
        );
        let detector = SttPipeline::detector_from_config(&cfg.stt);
        let pipeline = SttPipeline::new(cfg.stt.clone(), cfg.telnyx.target_sample_rate, detector);

        Self {
            call_id,
            tenant_id,
            tenant_cfg,
            ctx,
            coordinator,
            ingest,
            pipeline,
            history: Vec::new(),
            rx,
            self_tx,
            started: Instant::now(),
            stt_tasks: HashMap::new(),
            current_staged: None,
            ws_restarts: 0,
            last_caller_activity_ms: 0,
            reprompted: false,
            ended: false,
        }
    }

    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Serial event loop; returns when the call ends
    pub async fn run(mut self) {
        info!(call_id = %self.call_id, tenant_id = %self.tenant_id, "session started");
        let mut tick = tokio::time::interval(Duration::from_millis(250));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let event = tokio::select! {
                maybe = self.rx.recv() => match maybe {
                    Some(event) => event,
                    None => break,
                },
                _ = tick.tick() => CallEvent::Tick,
            };
            if self.handle_event(event).await {
                break;
            }
        }
        self.shutdown().await;
    }

    /// Returns true when the session should stop
    async fn handle_event(&mut self, event: CallEvent) -> bool {
        if self.ended {
            debug!(call_id = %self.call_id, ?event, "event after end; skipped");
            return true;
        }
        let now = self.now_ms();

        match event {
            CallEvent::MediaConnected => {
                self.coordinator.on_ws_connected(now);
            }
            CallEvent::MediaText(text) => {
                self.on_media_text(&text, now).await;
            }
            CallEvent::MediaClosed => {
                self.on_media_closed(now).await;
            }
            CallEvent::Answered => {
                self.speak(self.greeting_line(), now).await;
            }
            CallEvent::PlaybackStarted => {
                let actions = self.pipeline.on_playback_start(now);
                self.apply_stt_actions(actions, now).await;
            }
            CallEvent::PlaybackEnded => {
                self.coordinator.on_playback_ended(now);
                self.pipeline.on_playback_end(now);
                self.last_caller_activity_ms = now;
                self.reprompted = false;
                if let Some(staged) = self.current_staged.take() {
                    self.ctx.tts.discard(&staged).await;
                }
            }
            CallEvent::SttResult { request_id, result } => {
                self.stt_tasks.remove(&request_id);
                let actions = self.pipeline.on_transcribe_result(request_id, result, now);
                self.apply_stt_actions(actions, now).await;
            }
            CallEvent::BrainReply { result } => {
                self.on_brain_reply(result, now).await;
            }
            CallEvent::TtsReady { text, result } => {
                self.on_tts_ready(text, result, now).await;
            }
            CallEvent::Tick => {
                let actions = self.pipeline.tick(now);
                self.apply_stt_actions(actions, now).await;
                self.check_dead_air(now).await;
            }
            CallEvent::Hangup { reason, notify_carrier } => {
                self.on_hangup(&reason, notify_carrier, now).await;
                return true;
            }
        }
        false
    }

    // ---- media path -----------------------------------------------------

    async fn on_media_text(&mut self, text: &str, now: u64) {
        match self.ingest.handle_message(text, now) {
            IngestEvent::Connected => {
                self.coordinator.on_ws_connected(now);
            }
            IngestEvent::Started { codec, sample_rate } => {
                debug!(
                    call_id = %self.call_id,
                    ?codec,
                    sample_rate,
                    "media stream negotiated"
                );
            }
            IngestEvent::Frames(frames) => {
                for frame in &frames {
                    self.coordinator.on_frame(frame, now);
                    let actions = self.pipeline.push_frame(frame, now);
                    self.apply_stt_actions(actions, now).await;
                }
            }
            IngestEvent::Stopped => {
                self.on_media_closed(now).await;
            }
            IngestEvent::Nothing => {}
        }

        if let Some((reason, action)) = self.ingest.health_action() {
            warn!(call_id = %self.call_id, ?reason, ?action, "ingest health action");
            match action {
                HealthAction::RestartPcmu => self.restart_stream(now).await,
                HealthAction::Reprompt => self.speak(REPROMPT_LINE.to_string(), now).await,
            }
        }
    }

    async fn on_media_closed(&mut self, now: u64) {
        if self.coordinator.state().is_ending() {
            return;
        }
        self.coordinator.on_ws_disconnected(now);
        self.pipeline.on_stream_reset();

        // Losing the stream is not losing the call: ask the carrier to
        // stream again, and only reprompt once restarts are spent.
        if self.ws_restarts < 2 {
            self.ws_restarts += 1;
            info!(
                call_id = %self.call_id,
                attempt = self.ws_restarts,
                "media socket lost; requesting new stream"
            );
            self.restart_stream(now).await;
        } else {
            self.speak(REPROMPT_LINE.to_string(), now).await;
        }
    }

    async fn restart_stream(&mut self, _now: u64) {
        let carrier = self.ctx.carrier.clone();
        let call_id = self.call_id.clone();
        let params = StreamParams {
            stream_url: media_stream_url(
                &self.ctx.config.server.public_base_url,
                &self.call_id,
                &self.ctx.config.server.media_stream_token,
            ),
            track: self.ctx.config.telnyx.stream_track,
            // Restart always requests PCMU; it decodes everywhere
            codec: "PCMU".to_string(),
        };
        self.ingest.on_stream_restarted();
        self.pipeline.on_stream_reset();
        tokio::spawn(async move {
            if let Err(e) = carrier.streaming_stop(&call_id).await {
                debug!(call_id, error = %format!("{e:#}"), "streaming_stop before restart");
            }
            if let Err(e) = carrier.streaming_start(&call_id, &params).await {
                error!(call_id, error = %format!("{e:#}"), "stream restart failed");
            }
        });
    }

    // ---- STT actions ----------------------------------------------------

    async fn apply_stt_actions(&mut self, actions: Vec<SttAction>, now: u64) {
        for action in actions {
            match action {
                SttAction::SpeechStart { utterance_id, at_ms, pre_roll_ms } => {
                    debug!(
                        call_id = %self.call_id,
                        utterance_id,
                        at_ms,
                        pre_roll_ms,
                        "speech start"
                    );
                    self.coordinator.on_speech_start(now);
                    self.last_caller_activity_ms = now;
                    self.reprompted = false;
                }
                SttAction::BargeIn { at_ms } => {
                    info!(call_id = %self.call_id, at_ms, "barge-in; stopping playback");
                    let carrier = self.ctx.carrier.clone();
                    let call_id = self.call_id.clone();
                    tokio::spawn(async move {
                        if let Err(e) = carrier.playback_stop(&call_id).await {
                            warn!(call_id, error = %format!("{e:#}"), "playback_stop failed");
                        }
                    });
                }
                SttAction::Abort { request_id, reason } => {
                    if let Some(handle) = self.stt_tasks.remove(&request_id) {
                        debug!(call_id = %self.call_id, request_id, reason, "aborting stt request");
                        handle.abort();
                    }
                }
                SttAction::Transcribe(request) => {
                    self.spawn_transcribe(request);
                }
                SttAction::UtteranceEnd { metrics, .. } => {
                    self.coordinator.on_utterance_end(&metrics, now);
                }
                SttAction::Transcript { text, source, .. } => {
                    self.on_transcript(text, source, now).await;
                }
                SttAction::EmptyFinal { utterance_id } => {
                    debug!(call_id = %self.call_id, utterance_id, "empty final");
                    self.coordinator.on_empty_final(now);
                }
                SttAction::ProviderError { message } => {
                    warn!(call_id = %self.call_id, error = %message, "stt provider failed");
                    self.coordinator.on_empty_final(now);
                    self.speak(FALLBACK_LINE.to_string(), now).await;
                }
            }
        }
    }

    fn spawn_transcribe(&mut self, request: crate::stt::TranscribeRequest) {
        let provider = self.ctx.stt_provider.clone();
        let tx = self.self_tx.clone();
        let language = self.tenant_cfg.stt_language.clone();
        let request_id = request.request_id;

        let handle = tokio::spawn(async move {
            let result = provider
                .transcribe(&request.pcm16, request.sample_rate_hz, language.as_deref())
                .await
                .map_err(|e| format!("{e:#}"));
            let _ = tx
                .send(CallEvent::SttResult { request_id, result })
                .await;
        });
        self.stt_tasks.insert(request_id, handle);
    }

    // ---- dialog ---------------------------------------------------------

    async fn on_transcript(&mut self, text: String, source: TranscriptSource, now: u64) {
        match source {
            TranscriptSource::Partial => {
                debug!(call_id = %self.call_id, text = %text, "partial transcript");
            }
            TranscriptSource::Final | TranscriptSource::PartialFallback => {
                info!(call_id = %self.call_id, text = %text, ?source, "final transcript");
                self.history.push(ConversationTurn::user(text.clone()));
                self.coordinator.on_responding_start(now);

                let brain = self.ctx.brain.clone();
                let tx = self.self_tx.clone();
                let tenant_id = self.tenant_id.clone();
                let call_id = self.call_id.clone();
                let history = self.history.clone();
                tokio::spawn(async move {
                    let result = brain
                        .reply_stream(&tenant_id, &call_id, &text, &history)
                        .await
                        .map_err(|e| format!("{e:#}"));
                    let _ = tx.send(CallEvent::BrainReply { result }).await;
                });
            }
        }
    }

    async fn on_brain_reply(&mut self, result: Result<String, String>, now: u64) {
        match result {
            Ok(reply) if !reply.trim().is_empty() => {
                self.history.push(ConversationTurn::assistant(reply.clone()));
                self.speak(reply, now).await;
            }
            Ok(_) => {
                warn!(call_id = %self.call_id, "brain returned empty reply");
                self.speak(FALLBACK_LINE.to_string(), now).await;
            }
            Err(e) => {
                error!(call_id = %self.call_id, error = %e, "brain call failed");
                self.speak(FALLBACK_LINE.to_string(), now).await;
            }
        }
    }

    /// Synthesize a line and play it to the caller
    async fn speak(&mut self, text: String, _now: u64) {
        let tts = self.ctx.tts.clone();
        let voice = self.tenant_cfg.tts_voice.clone();
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            let result = tts
                .synthesize_to_file(&text, voice.as_deref())
                .await
                .map_err(|e| format!("{e:#}"));
            let _ = tx.send(CallEvent::TtsReady { text, result }).await;
        });
    }

    async fn on_tts_ready(&mut self, text: String, result: Result<StagedAudio, String>, now: u64) {
        match result {
            Ok(staged) => {
                self.coordinator.on_tts_start(now);
                let carrier = self.ctx.carrier.clone();
                let call_id = self.call_id.clone();
                let url = staged.public_url.clone();
                self.current_staged = Some(staged);
                tokio::spawn(async move {
                    if let Err(e) = carrier.playback_start(&call_id, &url).await {
                        error!(call_id, error = %format!("{e:#}"), "playback_start failed");
                    }
                });
            }
            Err(e) => {
                error!(call_id = %self.call_id, error = %e, "tts failed");
                if text != FALLBACK_LINE {
                    self.speak(FALLBACK_LINE.to_string(), now).await;
                } else {
                    // Even the fallback line cannot be spoken; end the call
                    let _ = self
                        .self_tx
                        .send(CallEvent::Hangup {
                            reason: "tts_unavailable".into(),
                            notify_carrier: true,
                        })
                        .await;
                }
            }
        }
    }

    fn greeting_line(&self) -> String {
        self.tenant_cfg
            .greeting
            .clone()
            .unwrap_or_else(|| DEFAULT_GREETING.to_string())
    }

    async fn check_dead_air(&mut self, now: u64) {
        if self.reprompted || self.coordinator.state() != CallState::Listening {
            return;
        }
        let dead_air = self.ctx.config.providers.dead_air_ms;
        if dead_air > 0 && now.saturating_sub(self.last_caller_activity_ms) >= dead_air {
            info!(call_id = %self.call_id, "dead air; reprompting");
            self.reprompted = true;
            self.speak(REPROMPT_LINE.to_string(), now).await;
        }
    }

    // ---- teardown -------------------------------------------------------

    async fn on_hangup(&mut self, reason: &str, notify_carrier: bool, now: u64) {
        info!(call_id = %self.call_id, reason, "hangup");
        self.coordinator.on_hangup(reason, now);
        self.ended = true;

        // Close out any open utterance. The resulting final STT call is NOT
        // cancelled: what the caller said before hanging up still gets
        // transcribed for the record; only the reply is discarded.
        let actions = self.pipeline.stop(now);
        let mut tail_sent = false;
        for action in actions {
            match action {
                SttAction::Transcribe(request) => {
                    tail_sent = true;
                    self.spawn_post_hangup_transcribe(
                        request.pcm16,
                        request.sample_rate_hz,
                    );
                }
                SttAction::Abort { request_id, .. } => {
                    if let Some(handle) = self.stt_tasks.remove(&request_id) {
                        handle.abort();
                    }
                }
                _ => {}
            }
        }

        // If the VAD never armed, words spoken just before the hangup may
        // only exist in the coordinator's ring; transcribe them for the
        // record too.
        if !tail_sent {
            let (pcm, buffered_ms) = self.coordinator.consume_pre_roll_for_utterance();
            if buffered_ms >= 300 {
                self.spawn_post_hangup_transcribe(
                    pcm,
                    self.ctx.config.telnyx.target_sample_rate,
                );
            }
        }

        if notify_carrier {
            let carrier = self.ctx.carrier.clone();
            let call_id = self.call_id.clone();
            tokio::spawn(async move {
                if let Err(e) = carrier.hangup(&call_id).await {
                    warn!(call_id, error = %format!("{e:#}"), "carrier hangup failed");
                }
            });
        }
    }

    /// Detached best-effort transcription of end-of-call audio; the text is
    /// only logged, never replied to
    fn spawn_post_hangup_transcribe(&self, pcm16: Vec<i16>, sample_rate_hz: u32) {
        let provider = self.ctx.stt_provider.clone();
        let language = self.tenant_cfg.stt_language.clone();
        let call_id = self.call_id.clone();
        tokio::spawn(async move {
            match provider
                .transcribe(&pcm16, sample_rate_hz, language.as_deref())
                .await
            {
                Ok(t) if !t.text.is_empty() => {
                    info!(call_id, text = %t.text, "post-hangup final transcript");
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(call_id, error = %format!("{e:#}"), "post-hangup stt failed");
                }
            }
        });
    }

    async fn shutdown(mut self) {
        // Abort whatever provider work is still in flight (the post-hangup
        // final was spawned detached and is unaffected)
        for (_, handle) in self.stt_tasks.drain() {
            handle.abort();
        }
        if let Some(staged) = self.current_staged.take() {
            self.ctx.tts.discard(&staged).await;
        }
        if let Err(e) = self
            .ctx
            .capacity
            .release(&self.tenant_id, &self.call_id)
            .await
        {
            error!(call_id = %self.call_id, error = %format!("{e:#}"), "capacity release failed");
        }

        let (skipped_inbound, skipped_outbound) = self.ingest.skip_counts();
        info!(
            call_id = %self.call_id,
            turns = self.history.len(),
            skipped_inbound,
            skipped_outbound,
            stream_restarts = self.ingest.restarts_issued(),
            "session closed"
        );
    }
}

/// Build the media WebSocket URL handed to the carrier
pub fn media_stream_url(public_base_url: &str, call_control_id: &str, token: &str) -> String {
    let ws_base = if let Some(rest) = public_base_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = public_base_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        public_base_url.to_string()
    };
    format!(
        "{}/v1/telnyx/media/{call_control_id}?token={token}",
        ws_base.trim_end_matches('/')
    )
}
