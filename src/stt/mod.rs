//! Speech-endpointed streaming STT
//!
//! ```text
//! PCM frames ─→ playback gate ─→ replay guard ─→ VAD ─→ utterance build
//!                                                          │
//!                              partials / finals ←─────────┘
//!                                     │
//!                               SttProvider (HTTP)
//! ```
//!
//! The pipeline core is synchronous and I/O-free; provider calls run in the
//! session's driver against the [`provider::SttProvider`] trait.

pub mod gate;
pub mod pipeline;
pub mod provider;
pub mod replay;
#[cfg(feature = "vad")]
pub mod silero;

pub use gate::EnergyGate;
pub use pipeline::{
    FinalizeReason, RequestKind, SpeechDetector, SttAction, SttPipeline, TranscribeRequest,
    UtteranceMetrics,
};
pub use provider::{SttProvider, Transcription, WhisperHttpProvider};
pub use replay::ReplayGuard;
#[cfg(feature = "vad")]
pub use silero::SileroVad;
