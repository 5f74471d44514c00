//! Voxline - Multi-Tenant Telephony Voice Runtime
//!
//! Accepts inbound carrier calls, streams caller audio through a
//! speech-to-text pipeline, asks a conversational brain for a reply,
//! synthesizes it, and plays it back, with tenant-aware admission control:
//!
//! - Carrier media ingest (PCMU/PCMA/L16/G722/Opus/AMR-WB → PCM16)
//! - RFC 4867 AMR-WB depacketizer with normalize-first repacking
//! - Speech-endpointed STT with VAD, pre-roll, partials, and barge-in
//! - Per-call audio coordinator state machine
//! - Atomic capacity admission over Redis
//! - Ed25519 / HMAC-SHA256 webhook verification
//! - Carrier call-control client with bounded retries

// Leaf modules first, control plane on top
pub mod types;
pub mod audio;
pub mod config;
pub mod amrwb;
pub mod media;
pub mod stt;
pub mod capacity;
pub mod signature;
pub mod carrier;
pub mod brain;
pub mod tts;
pub mod call;
pub mod server;
pub mod cli;

// Re-export the types most integrations touch
pub use call::{AudioCoordinator, CallSession, CallState, SessionManager};
pub use config::Config;
pub use media::MediaIngest;
pub use stt::{SttPipeline, SttProvider};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Get the library info
pub fn info() -> String {
    format!("{NAME} v{VERSION} - Telephony Voice Runtime")
}
