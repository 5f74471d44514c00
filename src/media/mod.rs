//! Media ingest pipeline
//!
//! Carrier WebSocket frames → payload demux → codec decode → resample →
//! fixed-window PCM frames, with stream-health supervision.
//!
//! ```text
//! ws text ─→ event demux ─→ candidate scoring ─→ decode ─→ resample ─→ reframe
//!                │                                  │
//!                └── track filter                   └── health monitor
//! ```

pub mod codec;
pub mod event;
pub mod g722;
pub mod health;
pub mod ingest;
pub mod resample;

pub use codec::{AmrWbPcmDecoder, Codec, StreamDecoder};
pub use event::{MediaWsEvent, PayloadCandidate};
pub use health::{HealthAction, HealthMonitor, UnhealthyReason};
pub use ingest::{IngestConfig, IngestEvent, MediaIngest};
pub use resample::{LinearResampler, Reframer};
