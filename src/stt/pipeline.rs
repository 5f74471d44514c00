//! Speech-endpointed STT pipeline
//!
//! A synchronous per-call state machine: PCM frames and lifecycle events go
//! in, `SttAction`s come out. The session driver executes the actions
//! (spawning provider HTTP calls, aborting them, forwarding transcripts) and
//! feeds results back through `on_transcribe_result`. Keeping the core free
//! of I/O makes the endpointing behavior fully deterministic under test.
//!
//! Per-frame order of operations:
//! playback gate → replay guard → speech detection → pre-roll / utterance
//! build → partial policy → finalize checks.

use sha1::{Digest, Sha1};
use std::collections::VecDeque;
use tracing::{debug, info, warn};

use super::gate::EnergyGate;
use super::replay::ReplayGuard;
#[cfg(feature = "vad")]
use super::silero::SileroVad;
use crate::config::SttConfig;
use crate::types::{PcmFrame, TranscriptSource};

/// How long an empty final may reach back for a partial to promote
const PARTIAL_FALLBACK_MAX_AGE_MS: u64 = 3_000;

/// Partial or final transcription request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Partial,
    Final,
}

/// Why an utterance was finalized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeReason {
    TrailingSilence,
    MaxUtterance,
    Stop,
    Watchdog,
}

/// Utterance measurements reported with finals and timing summaries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UtteranceMetrics {
    pub speech_ms: u64,
    pub trailing_silence_ms: u64,
    pub pre_roll_ms: u64,
    pub utterance_total_ms: u64,
    pub started_at_ms: u64,
}

/// One transcription request for the driver to execute
#[derive(Debug, Clone)]
pub struct TranscribeRequest {
    pub request_id: u64,
    pub utterance_id: u64,
    pub kind: RequestKind,
    pub pcm16: Vec<i16>,
    pub sample_rate_hz: u32,
}

/// Everything the pipeline can ask of its driver
#[derive(Debug, Clone)]
pub enum SttAction {
    /// Caller started speaking; pre-roll has been folded into the utterance
    SpeechStart {
        utterance_id: u64,
        at_ms: u64,
        pre_roll_ms: u64,
    },
    /// Speech detected while playback is active
    BargeIn { at_ms: u64 },
    /// Cancel the identified in-flight provider request
    Abort {
        request_id: u64,
        reason: &'static str,
    },
    Transcribe(TranscribeRequest),
    Transcript {
        utterance_id: u64,
        text: String,
        source: TranscriptSource,
        confidence: Option<f32>,
    },
    /// The utterance closed; a final request follows unless it was too short
    UtteranceEnd {
        utterance_id: u64,
        metrics: UtteranceMetrics,
        reason: FinalizeReason,
    },
    /// Final came back empty and no recent partial could stand in
    EmptyFinal { utterance_id: u64 },
    /// Provider failure on a final (partials fail silently)
    ProviderError { message: String },
}

/// Frame classifier: Silero when built and loadable, energy gate otherwise
pub enum SpeechDetector {
    Energy(EnergyGate),
    #[cfg(feature = "vad")]
    Silero(SileroVad),
    /// Gates disabled: every frame counts as speech
    Always,
}

impl SpeechDetector {
    fn is_speech(&mut self, pcm16: &[i16]) -> bool {
        match self {
            Self::Energy(gate) => gate.is_speech(pcm16),
            #[cfg(feature = "vad")]
            Self::Silero(vad) => vad.is_speech(pcm16),
            Self::Always => !pcm16.is_empty(),
        }
    }

    fn reset(&mut self) {
        #[cfg(feature = "vad")]
        if let Self::Silero(vad) = self {
            vad.reset();
        }
    }
}

struct Utterance {
    id: u64,
    pcm: Vec<i16>,
    started_at_ms: u64,
    pre_roll_ms: u64,
    speech_ms: u64,
    /// Stream-time offset of the end of the last speech frame
    last_speech_off_ms: u64,
    total_ms: u64,
}

struct InFlight {
    request_id: u64,
    kind: RequestKind,
    utterance_id: u64,
}

/// Rolling pre-roll store bounded by total milliseconds
struct RollingRing {
    frames: VecDeque<(Vec<i16>, u64)>,
    total_ms: u64,
    budget_ms: u64,
}

impl RollingRing {
    fn new(budget_ms: u64) -> Self {
        Self {
            frames: VecDeque::new(),
            total_ms: 0,
            budget_ms,
        }
    }

    fn push(&mut self, pcm: Vec<i16>, duration_ms: u64) {
        self.frames.push_back((pcm, duration_ms));
        self.total_ms += duration_ms;
        while self.total_ms > self.budget_ms {
            match self.frames.pop_front() {
                Some((_, ms)) => self.total_ms -= ms,
                None => break,
            }
        }
    }

    /// Take everything, oldest first
    fn drain(&mut self) -> (Vec<i16>, u64) {
        let ms = self.total_ms;
        let mut pcm = Vec::new();
        for (frame, _) in self.frames.drain(..) {
            pcm.extend(frame);
        }
        self.total_ms = 0;
        (pcm, ms)
    }

    fn clear(&mut self) {
        self.frames.clear();
        self.total_ms = 0;
    }
}

/// The per-call STT pipeline
pub struct SttPipeline {
    config: SttConfig,
    sample_rate_hz: u32,
    detector: SpeechDetector,
    replay: Option<ReplayGuard>,
    ring: RollingRing,
    speech_streak: u32,
    /// Streak while playback is active, for barge-in only
    playback_speech_streak: u32,
    barge_in_fired: bool,
    capturing: Option<Utterance>,
    playback_active: bool,
    playback_ended_at_ms: Option<u64>,
    in_flight: Option<InFlight>,
    next_request_id: u64,
    next_utterance_id: u64,
    last_partial_sent_at_ms: Option<u64>,
    last_partial_sent_hash: Option<[u8; 20]>,
    /// Most recent non-empty partial text, for the empty-final fallback
    last_partial: Option<(String, u64)>,
    watchdog_deadline_ms: Option<u64>,
}

impl SttPipeline {
    pub fn new(config: SttConfig, sample_rate_hz: u32, detector: SpeechDetector) -> Self {
        let replay = config
            .rx_postprocess_enabled
            .then(|| ReplayGuard::new(config.rx_dedupe_window));
        let ring = RollingRing::new(config.pre_roll_ms.min(800));
        Self {
            config,
            sample_rate_hz,
            detector,
            replay,
            ring,
            speech_streak: 0,
            playback_speech_streak: 0,
            barge_in_fired: false,
            capturing: None,
            playback_active: false,
            playback_ended_at_ms: None,
            in_flight: None,
            next_request_id: 1,
            next_utterance_id: 1,
            last_partial_sent_at_ms: None,
            last_partial_sent_hash: None,
            last_partial: None,
            watchdog_deadline_ms: None,
        }
    }

    /// Build the detector from configuration, falling back to the energy
    /// gate when the Silero model is unavailable.
    pub fn detector_from_config(config: &SttConfig) -> SpeechDetector {
        if config.disable_gates {
            return SpeechDetector::Always;
        }
        #[cfg(feature = "vad")]
        if config.vad_enabled {
            match SileroVad::from_env(config.vad_threshold) {
                Ok(vad) => return SpeechDetector::Silero(vad),
                Err(e) => {
                    warn!(error = %e, "silero vad unavailable; using energy gate");
                }
            }
        }
        SpeechDetector::Energy(EnergyGate::new(config.rms_floor, config.peak_floor))
    }

    // ---- frame path -----------------------------------------------------

    pub fn push_frame(&mut self, frame: &PcmFrame, now_ms: u64) -> Vec<SttAction> {
        let mut actions = Vec::new();
        let frame_ms = frame.duration_ms();

        // 1. Playback gate: no buffering, no transcribing. Barge-in
        //    detection still watches the energy.
        if self.playback_active {
            if self.detector.is_speech(&frame.pcm16) {
                self.playback_speech_streak += 1;
                if !self.barge_in_fired
                    && self.playback_speech_streak >= self.config.speech_frames_required
                {
                    self.barge_in_fired = true;
                    info!(at_ms = now_ms, "barge-in detected during playback");
                    actions.push(SttAction::BargeIn { at_ms: now_ms });
                }
            } else {
                self.playback_speech_streak = 0;
            }
            return actions;
        }
        if let Some(ended) = self.playback_ended_at_ms {
            if now_ms.saturating_sub(ended) < self.config.post_playback_grace_ms {
                return actions;
            }
        }

        // 2. Replay guard
        if let Some(guard) = self.replay.as_mut() {
            if guard.is_replay(&frame.pcm16) {
                debug!("dropped replayed frame");
                return actions;
            }
        }

        // 3. Classify
        let is_speech = self.detector.is_speech(&frame.pcm16);

        match self.capturing.take() {
            None => {
                self.ring.push(frame.pcm16.clone(), frame_ms);
                if is_speech {
                    self.speech_streak += 1;
                } else {
                    self.speech_streak = 0;
                }
                if self.speech_streak >= self.config.speech_frames_required {
                    self.begin_utterance(now_ms, &mut actions);
                }
            }
            Some(mut utt) => {
                utt.pcm.extend_from_slice(&frame.pcm16);
                utt.total_ms += frame_ms;
                if is_speech {
                    utt.speech_ms += frame_ms;
                    utt.last_speech_off_ms = utt.total_ms;
                }

                let trailing = utt.total_ms - utt.last_speech_off_ms;
                if trailing >= self.config.silence_end_ms {
                    self.finalize(utt, FinalizeReason::TrailingSilence, now_ms, &mut actions);
                } else if utt.total_ms >= self.config.max_utterance_ms {
                    self.finalize(utt, FinalizeReason::MaxUtterance, now_ms, &mut actions);
                } else {
                    self.maybe_send_partial(&utt, now_ms, &mut actions);
                    self.capturing = Some(utt);
                }
            }
        }
        actions
    }

    fn begin_utterance(&mut self, now_ms: u64, actions: &mut Vec<SttAction>) {
        // Barge-in on the endpointing level: a new utterance invalidates any
        // in-flight final for the previous one.
        if let Some(inflight) = self.in_flight.take() {
            if inflight.kind == RequestKind::Final {
                actions.push(SttAction::Abort {
                    request_id: inflight.request_id,
                    reason: "speech_start",
                });
            } else {
                self.in_flight = Some(inflight);
            }
        }

        let (pcm, pre_roll_ms) = self.ring.drain();
        let id = self.next_utterance_id;
        self.next_utterance_id += 1;

        let streak_ms = u64::from(self.speech_streak) * self.config.chunk_ms;
        let total_ms = pre_roll_ms;
        let utt = Utterance {
            id,
            pcm,
            started_at_ms: now_ms,
            pre_roll_ms,
            speech_ms: streak_ms.min(total_ms),
            last_speech_off_ms: total_ms,
            total_ms,
        };
        self.speech_streak = 0;
        self.watchdog_deadline_ms = Some(now_ms + self.config.late_final_watchdog_ms);

        info!(utterance_id = id, at_ms = now_ms, pre_roll_ms, "speech start");
        actions.push(SttAction::SpeechStart {
            utterance_id: id,
            at_ms: now_ms,
            pre_roll_ms,
        });
        self.capturing = Some(utt);
    }

    fn maybe_send_partial(&mut self, utt: &Utterance, now_ms: u64, actions: &mut Vec<SttAction>) {
        if utt.total_ms < self.config.partial_min_ms {
            return;
        }
        if self.in_flight.is_some() {
            return;
        }
        if let Some(last) = self.last_partial_sent_at_ms {
            if now_ms.saturating_sub(last) < self.config.partial_interval_ms {
                return;
            }
        }
        let hash = hash_pcm(&utt.pcm);
        if self.last_partial_sent_hash == Some(hash) {
            return;
        }

        let request_id = self.next_request_id;
        self.next_request_id += 1;
        self.in_flight = Some(InFlight {
            request_id,
            kind: RequestKind::Partial,
            utterance_id: utt.id,
        });
        self.last_partial_sent_at_ms = Some(now_ms);
        self.last_partial_sent_hash = Some(hash);
        actions.push(SttAction::Transcribe(TranscribeRequest {
            request_id,
            utterance_id: utt.id,
            kind: RequestKind::Partial,
            pcm16: utt.pcm.clone(),
            sample_rate_hz: self.sample_rate_hz,
        }));
    }

    fn finalize(
        &mut self,
        mut utt: Utterance,
        reason: FinalizeReason,
        now_ms: u64,
        actions: &mut Vec<SttAction>,
    ) {
        // Trim trailing silence down to the cushion
        let keep_ms = (utt.last_speech_off_ms + self.config.trailing_silence_cushion_ms)
            .min(utt.total_ms);
        let keep_samples = (keep_ms * u64::from(self.sample_rate_hz) / 1000) as usize;
        utt.pcm.truncate(keep_samples);

        let metrics = UtteranceMetrics {
            speech_ms: utt.speech_ms,
            trailing_silence_ms: keep_ms - utt.last_speech_off_ms.min(keep_ms),
            pre_roll_ms: utt.pre_roll_ms,
            utterance_total_ms: keep_ms,
            started_at_ms: utt.started_at_ms,
        };

        // A final invalidates any in-flight partial
        if let Some(inflight) = self.in_flight.take() {
            actions.push(SttAction::Abort {
                request_id: inflight.request_id,
                reason: "finalize",
            });
        }

        info!(
            utterance_id = utt.id,
            ?reason,
            speech_ms = metrics.speech_ms,
            total_ms = metrics.utterance_total_ms,
            "utterance end"
        );
        actions.push(SttAction::UtteranceEnd {
            utterance_id: utt.id,
            metrics,
            reason,
        });

        if metrics.speech_ms < self.config.min_utterance_ms {
            debug!(
                utterance_id = utt.id,
                speech_ms = metrics.speech_ms,
                "utterance below minimum; not transcribing"
            );
            self.watchdog_deadline_ms = None;
        } else {
            let request_id = self.next_request_id;
            self.next_request_id += 1;
            self.in_flight = Some(InFlight {
                request_id,
                kind: RequestKind::Final,
                utterance_id: utt.id,
            });
            actions.push(SttAction::Transcribe(TranscribeRequest {
                request_id,
                utterance_id: utt.id,
                kind: RequestKind::Final,
                pcm16: std::mem::take(&mut utt.pcm),
                sample_rate_hz: self.sample_rate_hz,
            }));
            // Watchdog keeps running until the final's result lands
            self.watchdog_deadline_ms =
                Some(now_ms + self.config.late_final_watchdog_ms);
        }

        self.capturing = None;
        self.speech_streak = 0;
        self.last_partial_sent_hash = None;
        self.last_partial_sent_at_ms = None;
    }

    // ---- lifecycle events ----------------------------------------------

    /// Assistant playback started: abort in-flight work, drop any partial
    /// utterance, reset the replay window.
    pub fn on_playback_start(&mut self, _now_ms: u64) -> Vec<SttAction> {
        let mut actions = Vec::new();
        self.playback_active = true;
        self.playback_ended_at_ms = None;
        self.playback_speech_streak = 0;
        self.barge_in_fired = false;

        if let Some(inflight) = self.in_flight.take() {
            actions.push(SttAction::Abort {
                request_id: inflight.request_id,
                reason: "playback_start",
            });
        }
        if let Some(utt) = self.capturing.take() {
            debug!(utterance_id = utt.id, "utterance discarded at playback start");
        }
        self.watchdog_deadline_ms = None;
        self.speech_streak = 0;
        self.ring.clear();
        self.detector.reset();
        if let Some(guard) = self.replay.as_mut() {
            guard.reset();
        }
        actions
    }

    /// Assistant playback ended: start the post-playback grace window
    pub fn on_playback_end(&mut self, now_ms: u64) {
        self.playback_active = false;
        self.playback_ended_at_ms = Some(now_ms);
        self.playback_speech_streak = 0;
        self.speech_streak = 0;
        self.ring.clear();
        if let Some(guard) = self.replay.as_mut() {
            guard.reset();
        }
    }

    /// Media socket dropped: pre-roll must not survive the gap
    pub fn on_stream_reset(&mut self) {
        self.ring.clear();
        self.speech_streak = 0;
        self.detector.reset();
    }

    /// Explicit stop (hangup): finalize any open utterance
    pub fn stop(&mut self, now_ms: u64) -> Vec<SttAction> {
        let mut actions = Vec::new();
        if let Some(utt) = self.capturing.take() {
            self.finalize(utt, FinalizeReason::Stop, now_ms, &mut actions);
        }
        actions
    }

    /// Periodic tick for the late-final watchdog
    pub fn tick(&mut self, now_ms: u64) -> Vec<SttAction> {
        let mut actions = Vec::new();
        let Some(deadline) = self.watchdog_deadline_ms else {
            return actions;
        };
        if now_ms < deadline {
            return actions;
        }

        warn!(at_ms = now_ms, "late-final watchdog fired");
        self.watchdog_deadline_ms = None;

        if let Some(utt) = self.capturing.take() {
            self.finalize(utt, FinalizeReason::Watchdog, now_ms, &mut actions);
        } else if let Some(inflight) = self.in_flight.take() {
            // The final itself is stuck; give the caller whatever we have
            actions.push(SttAction::Abort {
                request_id: inflight.request_id,
                reason: "watchdog",
            });
            if let Some((text, at)) = self.last_partial.clone() {
                if now_ms.saturating_sub(at) <= PARTIAL_FALLBACK_MAX_AGE_MS {
                    actions.push(SttAction::Transcript {
                        utterance_id: inflight.utterance_id,
                        text,
                        source: TranscriptSource::PartialFallback,
                        confidence: None,
                    });
                    return actions;
                }
            }
            actions.push(SttAction::EmptyFinal {
                utterance_id: inflight.utterance_id,
            });
        }
        actions
    }

    // ---- provider results ----------------------------------------------

    /// Feed back the outcome of a previously issued `Transcribe` action
    pub fn on_transcribe_result(
        &mut self,
        request_id: u64,
        result: Result<super::provider::Transcription, String>,
        now_ms: u64,
    ) -> Vec<SttAction> {
        let mut actions = Vec::new();

        let Some(inflight) = self.in_flight.take() else {
            debug!(request_id, "stale transcribe result (nothing in flight)");
            return actions;
        };
        if inflight.request_id != request_id {
            debug!(request_id, "stale transcribe result (superseded)");
            self.in_flight = Some(inflight);
            return actions;
        }

        match (inflight.kind, result) {
            (RequestKind::Partial, Ok(t)) => {
                if !t.text.is_empty() {
                    self.last_partial = Some((t.text.clone(), now_ms));
                    actions.push(SttAction::Transcript {
                        utterance_id: inflight.utterance_id,
                        text: t.text,
                        source: TranscriptSource::Partial,
                        confidence: t.confidence,
                    });
                }
            }
            (RequestKind::Partial, Err(e)) => {
                // Partials are best-effort
                debug!(error = %e, "partial transcription failed");
            }
            (RequestKind::Final, Ok(t)) => {
                self.watchdog_deadline_ms = None;
                if !t.text.is_empty() {
                    actions.push(SttAction::Transcript {
                        utterance_id: inflight.utterance_id,
                        text: t.text,
                        source: TranscriptSource::Final,
                        confidence: t.confidence,
                    });
                } else if let Some((text, at)) = self.last_partial.clone() {
                    if now_ms.saturating_sub(at) <= PARTIAL_FALLBACK_MAX_AGE_MS {
                        info!("empty final; promoting recent partial");
                        actions.push(SttAction::Transcript {
                            utterance_id: inflight.utterance_id,
                            text,
                            source: TranscriptSource::PartialFallback,
                            confidence: None,
                        });
                    } else {
                        actions.push(SttAction::EmptyFinal {
                            utterance_id: inflight.utterance_id,
                        });
                    }
                } else {
                    actions.push(SttAction::EmptyFinal {
                        utterance_id: inflight.utterance_id,
                    });
                }
            }
            (RequestKind::Final, Err(e)) => {
                self.watchdog_deadline_ms = None;
                warn!(error = %e, "final transcription failed");
                actions.push(SttAction::ProviderError { message: e });
            }
        }
        actions
    }

    /// True while a provider request is outstanding
    pub fn request_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// True while an utterance is being captured
    pub fn capturing(&self) -> bool {
        self.capturing.is_some()
    }
}

fn hash_pcm(pcm: &[i16]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    for s in pcm {
        hasher.update(s.to_le_bytes());
    }
    hasher.finalize().into()
}
