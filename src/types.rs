//! Shared types used across the runtime

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Transport assigned to a call at admission time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// Carrier PSTN leg with a media-streaming WebSocket
    Pstn,
    /// Browser WebRTC leg (HD audio, no stream restarts)
    WebrtcHd,
}

impl TransportMode {
    /// Stream restarts are only meaningful on the PSTN leg
    pub fn supports_stream_restart(self) -> bool {
        matches!(self, TransportMode::Pstn)
    }
}

/// Which carrier media track(s) the ingest accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamTrack {
    InboundTrack,
    OutboundTrack,
    BothTracks,
}

impl StreamTrack {
    /// Parse the carrier's wire name ("inbound_track" etc.)
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inbound_track" | "inbound" => Some(Self::InboundTrack),
            "outbound_track" | "outbound" => Some(Self::OutboundTrack),
            "both_tracks" | "both" => Some(Self::BothTracks),
            _ => None,
        }
    }

    /// Wire name sent in `streaming_start` bodies
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::InboundTrack => "inbound_track",
            Self::OutboundTrack => "outbound_track",
            Self::BothTracks => "both_tracks",
        }
    }

    /// Does a frame tagged with `track` pass this filter?
    pub fn accepts(self, track: &str) -> bool {
        match self {
            Self::BothTracks => true,
            Self::InboundTrack => track == "inbound",
            Self::OutboundTrack => track == "outbound",
        }
    }
}

/// One fixed window of canonical PCM16 mono audio
#[derive(Debug, Clone)]
pub struct PcmFrame {
    /// Little-endian samples, one channel
    pub pcm16: Vec<i16>,
    pub sample_rate_hz: u32,
    pub channels: u16,
    /// Millisecond timestamp relative to ingest start, when known
    pub timestamp_ms: Option<u64>,
    /// Carrier sequence number, when the media event carried one
    pub seq: Option<u64>,
}

impl PcmFrame {
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate_hz == 0 {
            return 0;
        }
        (self.pcm16.len() as u64 * 1000) / self.sample_rate_hz as u64
    }
}

/// Where a transcript came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptSource {
    Partial,
    Final,
    /// Final came back empty; a recent partial was promoted instead
    PartialFallback,
}

/// Role of a conversation turn sent to the brain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
}

/// One entry of the per-call conversation history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: TurnRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}
