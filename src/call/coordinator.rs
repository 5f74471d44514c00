//! Per-call audio coordinator
//!
//! Owns the call's state machine and the pre-roll ring, decides when the STT
//! pipeline may arm, and emits a structured timing summary at each utterance
//! end. All timestamps are millisecond readings of the session's monotonic
//! clock, passed in by the caller.

use serde::Serialize;
use tracing::{info, warn};

use super::preroll::PreRollRing;
use super::state::CallState;
use crate::stt::UtteranceMetrics;
use crate::types::PcmFrame;

/// Media must flow this long uninterrupted before LISTENING arms
const MIN_CONSECUTIVE_FRAME_MS: u64 = 200;
/// Floor of the inter-frame gap that breaks a consecutive run
const MIN_GAP_BREAK_MS: u64 = 300;

/// Structured record logged at each utterance end
#[derive(Debug, Clone, Serialize)]
pub struct TimingSummary {
    pub call_id: String,
    pub utterance_id: u64,
    pub state: CallState,
    pub playback_ended_at_ms: Option<u64>,
    pub first_frame_at_ms: Option<u64>,
    pub armed_at_ms: Option<u64>,
    pub speech_start_at_ms: Option<u64>,
    pub utterance_end_at_ms: u64,
    /// Derived deltas; None when the earlier mark never happened
    pub playback_to_first_frame_ms: Option<u64>,
    pub first_frame_to_armed_ms: Option<u64>,
    pub armed_to_speech_start_ms: Option<u64>,
    pub speech_ms: u64,
    pub pre_roll_ms: u64,
    pub utterance_total_ms: u64,
    pub trailing_silence_ms: u64,
}

/// The per-call coordinator
pub struct AudioCoordinator {
    call_id: String,
    state: CallState,
    frame_ms: u64,

    ws_connected: bool,
    first_frame_at_ms: Option<u64>,
    last_frame_at_ms: Option<u64>,
    /// Start of the current uninterrupted frame run
    consecutive_since_ms: Option<u64>,

    playback_active: bool,
    playback_ended_at_ms: Option<u64>,
    /// External gate (admission, dialog policy)
    can_arm_listening: bool,

    preroll: PreRollRing,

    armed_at_ms: Option<u64>,
    speech_start_at_ms: Option<u64>,
    utterance_counter: u64,
}

impl AudioCoordinator {
    pub fn new(call_id: impl Into<String>, frame_ms: u64, pre_roll_budget_ms: u64) -> Self {
        Self {
            call_id: call_id.into(),
            state: CallState::Idle,
            frame_ms,
            ws_connected: false,
            first_frame_at_ms: None,
            last_frame_at_ms: None,
            consecutive_since_ms: None,
            playback_active: false,
            playback_ended_at_ms: None,
            can_arm_listening: true,
            preroll: PreRollRing::new(pre_roll_budget_ms),
            armed_at_ms: None,
            speech_start_at_ms: None,
            utterance_counter: 0,
        }
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    fn transition(&mut self, to: CallState, reason: &str, now_ms: u64) -> bool {
        if self.state == to {
            return false;
        }
        if self.state.is_ending() {
            // Absorbing: everything after ENDING is a no-op
            return false;
        }
        if !self.state.can_transition_to(to) {
            warn!(
                call_id = %self.call_id,
                from = %self.state,
                to = %to,
                reason,
                "rejected illegal state transition"
            );
            return false;
        }
        info!(
            call_id = %self.call_id,
            from = %self.state,
            to = %to,
            reason,
            at_ms = now_ms,
            "state transition"
        );
        self.state = to;
        true
    }

    // ---- media events ---------------------------------------------------

    pub fn on_ws_connected(&mut self, now_ms: u64) {
        self.ws_connected = true;
        self.consecutive_since_ms = None;
        self.maybe_arm("ws_connected", now_ms);
    }

    /// Media socket dropped: ring and media-ready predicate reset
    pub fn on_ws_disconnected(&mut self, _now_ms: u64) {
        self.ws_connected = false;
        self.first_frame_at_ms = None;
        self.last_frame_at_ms = None;
        self.consecutive_since_ms = None;
        self.preroll.reset();
    }

    /// A decoded PCM frame arrived from the ingest
    pub fn on_frame(&mut self, frame: &PcmFrame, now_ms: u64) {
        if self.state.is_ending() {
            return;
        }
        if self.first_frame_at_ms.is_none() {
            self.first_frame_at_ms = Some(now_ms);
        }

        // Consecutive-run accounting: a large gap restarts the run
        let gap_break = MIN_GAP_BREAK_MS.max(4 * self.frame_ms);
        match self.last_frame_at_ms {
            Some(last) if now_ms.saturating_sub(last) > gap_break => {
                self.consecutive_since_ms = Some(now_ms);
            }
            None => self.consecutive_since_ms = Some(now_ms),
            _ => {
                if self.consecutive_since_ms.is_none() {
                    self.consecutive_since_ms = Some(now_ms);
                }
            }
        }
        self.last_frame_at_ms = Some(now_ms);

        self.preroll.push(frame);
        self.maybe_arm("media_ready", now_ms);
    }

    /// wsConnected ∧ firstFrameSeen ∧ consecutive ≥ 200 ms
    pub fn media_ready(&self, now_ms: u64) -> bool {
        if !self.ws_connected || self.first_frame_at_ms.is_none() {
            return false;
        }
        match self.consecutive_since_ms {
            Some(since) => now_ms.saturating_sub(since) >= MIN_CONSECUTIVE_FRAME_MS,
            None => false,
        }
    }

    fn maybe_arm(&mut self, reason: &str, now_ms: u64) {
        if self.state != CallState::Idle {
            return;
        }
        if self.playback_active || !self.can_arm_listening {
            return;
        }
        if self.media_ready(now_ms) && self.transition(CallState::Listening, reason, now_ms) {
            self.armed_at_ms = Some(now_ms);
        }
    }

    /// External arming gate (capacity hold, dialog policy)
    pub fn set_can_arm_listening(&mut self, allowed: bool, now_ms: u64) {
        self.can_arm_listening = allowed;
        if allowed {
            self.maybe_arm("arm_allowed", now_ms);
        }
    }

    // ---- dialog events --------------------------------------------------

    pub fn on_speech_start(&mut self, now_ms: u64) {
        if self.transition(CallState::Capturing, "speech_start", now_ms) {
            self.utterance_counter += 1;
            self.speech_start_at_ms = Some(now_ms);
        }
    }

    /// Utterance closed; emits and returns the timing summary
    pub fn on_utterance_end(&mut self, metrics: &UtteranceMetrics, now_ms: u64) -> TimingSummary {
        self.transition(CallState::FinalizingStt, "utterance_end", now_ms);
        let summary = self.timing_summary(metrics, now_ms);
        info!(
            call_id = %self.call_id,
            summary = %serde_json::to_string(&summary).unwrap_or_default(),
            "timing_summary"
        );
        summary
    }

    /// Brain call started
    pub fn on_responding_start(&mut self, now_ms: u64) {
        self.transition(CallState::Responding, "responding_start", now_ms);
    }

    /// Final produced nothing usable; go back to listening
    pub fn on_empty_final(&mut self, now_ms: u64) {
        self.transition(CallState::Listening, "empty_final", now_ms);
    }

    pub fn on_tts_start(&mut self, now_ms: u64) {
        self.playback_active = true;
        // Greetings and reprompts play outside a dialog turn; only a turn
        // in RESPONDING moves to PLAYING
        if self.state == CallState::Responding {
            self.transition(CallState::Playing, "tts_start", now_ms);
        }
    }

    pub fn on_playback_ended(&mut self, now_ms: u64) {
        self.playback_active = false;
        self.playback_ended_at_ms = Some(now_ms);
        if self.state == CallState::Playing {
            self.transition(CallState::Listening, "playback_ended", now_ms);
            self.armed_at_ms = Some(now_ms);
        } else {
            self.maybe_arm("playback_ended", now_ms);
        }
    }

    pub fn on_hangup(&mut self, reason: &str, now_ms: u64) {
        self.transition(CallState::Ending, reason, now_ms);
    }

    // ---- pre-roll -------------------------------------------------------

    /// Snapshot the ring for an utterance (ring is left intact)
    pub fn consume_pre_roll_for_utterance(&self) -> (Vec<i16>, u64) {
        self.preroll.consume_for_utterance()
    }

    fn timing_summary(&self, metrics: &UtteranceMetrics, now_ms: u64) -> TimingSummary {
        let delta = |a: Option<u64>, b: Option<u64>| match (a, b) {
            (Some(a), Some(b)) if b >= a => Some(b - a),
            _ => None,
        };
        TimingSummary {
            call_id: self.call_id.clone(),
            utterance_id: self.utterance_counter,
            state: self.state,
            playback_ended_at_ms: self.playback_ended_at_ms,
            first_frame_at_ms: self.first_frame_at_ms,
            armed_at_ms: self.armed_at_ms,
            speech_start_at_ms: self.speech_start_at_ms,
            utterance_end_at_ms: now_ms,
            playback_to_first_frame_ms: delta(self.playback_ended_at_ms, self.first_frame_at_ms),
            first_frame_to_armed_ms: delta(self.first_frame_at_ms, self.armed_at_ms),
            armed_to_speech_start_ms: delta(self.armed_at_ms, self.speech_start_at_ms),
            speech_ms: metrics.speech_ms,
            pre_roll_ms: metrics.pre_roll_ms,
            utterance_total_ms: metrics.utterance_total_ms,
            trailing_silence_ms: metrics.trailing_silence_ms,
        }
    }
}
