//! Ingest health monitoring
//!
//! Watches a rolling one-second window of decode outcomes and flags streams
//! that are decoding garbage: repeated decode failures, the tiny-payload
//! pathology, or a wall of near-silent frames (the classic symptom of a
//! bit-packed AMR-WB stream parsed octet-aligned). Unhealthy PSTN streams
//! get a bounded number of PCMU restarts before the dialog layer is asked
//! to reprompt.

use tracing::{info, warn};

use crate::types::TransportMode;

const WINDOW_MS: u64 = 1_000;
const MIN_FRAMES: usize = 10;
const MAX_DECODE_FAILURES: usize = 5;
const MAX_TINY_FRAMES: usize = 10;
const SILENT_RATIO: f32 = 0.8;
const SILENT_RMS: f32 = 0.001;

/// One observation in the rolling window
#[derive(Debug, Clone, Copy)]
struct Sample {
    at_ms: u64,
    outcome: Outcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    DecodeFailed,
    Tiny,
    Silent,
    Ok,
}

/// Why the window was judged unhealthy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnhealthyReason {
    DecodeFailures,
    TinyPayloads,
    MostlySilent,
}

/// What the session should do about an unhealthy stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthAction {
    /// Ask the carrier to restart streaming with PCMU
    RestartPcmu,
    /// Restarts exhausted (or transport cannot restart): reprompt the caller
    Reprompt,
}

/// Rolling-window stream health monitor
pub struct HealthMonitor {
    window: Vec<Sample>,
    transport: TransportMode,
    max_restart_attempts: u32,
    restarts_issued: u32,
    /// Set after an action fires so one bad window triggers one action
    latched: bool,
    reprompt_signaled: bool,
}

impl HealthMonitor {
    pub fn new(transport: TransportMode, max_restart_attempts: u32) -> Self {
        Self {
            window: Vec::new(),
            transport,
            max_restart_attempts,
            restarts_issued: 0,
            latched: false,
            reprompt_signaled: false,
        }
    }

    pub fn record_decode_failure(&mut self, now_ms: u64) {
        self.push(now_ms, Outcome::DecodeFailed);
    }

    /// Record a successfully decoded frame
    pub fn record_frame(&mut self, now_ms: u64, decoded_len: usize, rms: f32, tiny_floor: usize) {
        let outcome = if decoded_len < tiny_floor {
            Outcome::Tiny
        } else if rms < SILENT_RMS {
            Outcome::Silent
        } else {
            Outcome::Ok
        };
        self.push(now_ms, outcome);
    }

    fn push(&mut self, now_ms: u64, outcome: Outcome) {
        self.window.push(Sample { at_ms: now_ms, outcome });
        self.window
            .retain(|s| now_ms.saturating_sub(s.at_ms) <= WINDOW_MS);
    }

    /// Judge the current window
    pub fn assess(&self) -> Option<UnhealthyReason> {
        if self.window.len() < MIN_FRAMES {
            return None;
        }
        let failures = self.count(Outcome::DecodeFailed);
        if failures >= MAX_DECODE_FAILURES {
            return Some(UnhealthyReason::DecodeFailures);
        }
        if self.count(Outcome::Tiny) >= MAX_TINY_FRAMES {
            return Some(UnhealthyReason::TinyPayloads);
        }
        let decoded = self.window.len() - failures;
        if decoded >= MIN_FRAMES {
            let silent = self.count(Outcome::Silent);
            if silent as f32 / decoded as f32 >= SILENT_RATIO {
                return Some(UnhealthyReason::MostlySilent);
            }
        }
        None
    }

    /// Assess and, when unhealthy, pick the next action. Latches until
    /// `on_stream_restarted` clears it so one episode fires one action.
    pub fn check(&mut self) -> Option<(UnhealthyReason, HealthAction)> {
        if self.latched {
            return None;
        }
        let reason = self.assess()?;
        self.latched = true;

        let can_restart = self.transport.supports_stream_restart()
            && self.restarts_issued < self.max_restart_attempts;
        if can_restart {
            self.restarts_issued += 1;
            warn!(
                ?reason,
                attempt = self.restarts_issued,
                "media stream unhealthy; requesting pcmu restart"
            );
            Some((reason, HealthAction::RestartPcmu))
        } else if !self.reprompt_signaled {
            self.reprompt_signaled = true;
            warn!(?reason, "media stream unhealthy and restarts exhausted; reprompting");
            Some((reason, HealthAction::Reprompt))
        } else {
            None
        }
    }

    /// The stream came back after a restart; start a fresh window
    pub fn on_stream_restarted(&mut self) {
        info!("media stream restarted; health window reset");
        self.window.clear();
        self.latched = false;
    }

    pub fn restarts_issued(&self) -> u32 {
        self.restarts_issued
    }

    fn count(&self, outcome: Outcome) -> usize {
        self.window.iter().filter(|s| s.outcome == outcome).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(TransportMode::Pstn, 1)
    }

    #[test]
    fn test_healthy_stream_no_action() {
        let mut m = monitor();
        for i in 0..50 {
            m.record_frame(i * 20, 320, 0.2, 10);
        }
        assert!(m.assess().is_none());
        assert!(m.check().is_none());
    }

    #[test]
    fn test_too_few_frames_is_not_judged() {
        let mut m = monitor();
        for i in 0..5 {
            m.record_decode_failure(i * 20);
        }
        assert!(m.assess().is_none());
    }

    #[test]
    fn test_decode_failures_trigger_restart() {
        let mut m = monitor();
        for i in 0..6 {
            m.record_decode_failure(i * 20);
        }
        for i in 6..12 {
            m.record_frame(i * 20, 320, 0.2, 10);
        }
        let (reason, action) = m.check().unwrap();
        assert_eq!(reason, UnhealthyReason::DecodeFailures);
        assert_eq!(action, HealthAction::RestartPcmu);
        // Latched until restart lands
        assert!(m.check().is_none());
    }

    #[test]
    fn test_tiny_payloads_trigger() {
        let mut m = monitor();
        for i in 0..11 {
            m.record_frame(i * 20, 2, 0.2, 10);
        }
        let (reason, _) = m.check().unwrap();
        assert_eq!(reason, UnhealthyReason::TinyPayloads);
    }

    #[test]
    fn test_silent_wall_triggers() {
        let mut m = monitor();
        for i in 0..20 {
            let rms = if i % 10 == 0 { 0.2 } else { 0.0001 };
            m.record_frame(i * 20, 320, rms, 10);
        }
        let (reason, _) = m.check().unwrap();
        assert_eq!(reason, UnhealthyReason::MostlySilent);
    }

    #[test]
    fn test_restart_then_reprompt() {
        let mut m = monitor();
        for i in 0..12 {
            m.record_decode_failure(i * 20);
        }
        assert_eq!(m.check().unwrap().1, HealthAction::RestartPcmu);

        m.on_stream_restarted();
        for i in 100..112 {
            m.record_decode_failure(i * 20);
        }
        assert_eq!(m.check().unwrap().1, HealthAction::Reprompt);

        // Reprompt fires once
        m.on_stream_restarted();
        for i in 200..212 {
            m.record_decode_failure(i * 20);
        }
        assert!(m.check().is_none());
    }

    #[test]
    fn test_webrtc_never_restarts() {
        let mut m = HealthMonitor::new(TransportMode::WebrtcHd, 1);
        for i in 0..12 {
            m.record_decode_failure(i * 20);
        }
        assert_eq!(m.check().unwrap().1, HealthAction::Reprompt);
    }

    #[test]
    fn test_old_samples_age_out() {
        let mut m = monitor();
        for i in 0..11 {
            m.record_frame(i * 20, 2, 0.2, 10);
        }
        assert!(m.assess().is_some());
        // Two seconds later the bad frames are gone
        for i in 0..10 {
            m.record_frame(3_000 + i * 20, 320, 0.2, 10);
        }
        assert!(m.assess().is_none());
    }
}
