//! Call-level audio state machine states

use serde::Serialize;

/// The coordinator's per-call state. Exactly one at a time; `Ending` is
/// absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallState {
    /// Created, media not yet flowing
    Idle,
    /// Media healthy, STT armed, waiting for speech
    Listening,
    /// Caller is speaking; utterance building
    Capturing,
    /// Utterance closed; final transcription outstanding
    FinalizingStt,
    /// Brain is composing a reply
    Responding,
    /// Reply audio is playing to the caller
    Playing,
    /// Hangup observed; everything else is a no-op
    Ending,
}

impl CallState {
    pub fn is_ending(self) -> bool {
        matches!(self, CallState::Ending)
    }

    /// Legal transition table; `Ending` is reachable from anywhere
    pub fn can_transition_to(self, to: CallState) -> bool {
        use CallState::*;
        if to == Ending {
            return true;
        }
        matches!(
            (self, to),
            (Idle, Listening)
                | (Listening, Capturing)
                | (Capturing, FinalizingStt)
                | (FinalizingStt, Responding)
                | (FinalizingStt, Listening)
                | (Responding, Playing)
                | (Playing, Listening)
        )
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CallState::Idle => "IDLE",
            CallState::Listening => "LISTENING",
            CallState::Capturing => "CAPTURING",
            CallState::FinalizingStt => "FINALIZING_STT",
            CallState::Responding => "RESPONDING",
            CallState::Playing => "PLAYING",
            CallState::Ending => "ENDING",
        };
        f.write_str(name)
    }
}
