//! AMR-WB RTP payload handling (RFC 4867)
//!
//! The carrier's AMR-WB streams arrive in either of two packings, and the
//! sender does not say which. An octet-aligned parse of a bit-packed stream
//! frequently *succeeds* by coincidence and yields garbage speech bytes, so
//! the transcoder always tries the bandwidth-efficient packings first and
//! re-emits everything as canonical octet-aligned frames ("normalize-first").
//!
//! ```text
//! raw buffer → strip RTP header/padding → BE(nibble) → BE(no CMR) →
//!   BE(CMR byte) → octet(CMR) → octet(no CMR) → invalid
//! ```
//!
//! Every successful bandwidth-efficient parse is validated by repacking to
//! octet-aligned and re-parsing before it is trusted.

pub mod bits;
pub mod depacketizer;
pub mod rtp;
pub mod storage;

pub use depacketizer::{
    pack_bandwidth_efficient, parse_bandwidth_efficient, parse_octet_aligned,
    repack_octet_aligned, BeCmr, ParsedPayload,
};
pub use rtp::{detect_and_strip_rtp_header, RtpStrip};

use thiserror::Error;

/// Byte sizes of AMR-WB speech frames, indexed by FT 0..=8
pub const SPEECH_FRAME_BYTES: [usize; 9] = [17, 23, 32, 36, 40, 46, 50, 58, 60];

/// Bit sizes of AMR-WB speech frames, indexed by FT 0..=8
pub const SPEECH_FRAME_BITS: [usize; 9] = [132, 177, 253, 285, 317, 365, 397, 461, 477];

/// Comfort-noise descriptor
pub const FT_SID: u8 = 9;
pub const FT_SPEECH_LOST: u8 = 14;
pub const FT_NO_DATA: u8 = 15;

/// CMR value meaning "no mode preference"
pub const CMR_NO_PREFERENCE: u8 = 15;

/// Payload byte size for a frame type; None for the reserved range 10..=13
pub fn frame_bytes(ft: u8) -> Option<usize> {
    match ft {
        0..=8 => Some(SPEECH_FRAME_BYTES[ft as usize]),
        9 => Some(5),
        14 | 15 => Some(0),
        _ => None,
    }
}

/// Payload bit size for a frame type; None for the reserved range 10..=13
pub fn frame_bits(ft: u8) -> Option<usize> {
    match ft {
        0..=8 => Some(SPEECH_FRAME_BITS[ft as usize]),
        9 => Some(40),
        14 | 15 => Some(0),
        _ => None,
    }
}

/// One decoded AMR-WB frame in canonical octet-aligned form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmrFrame {
    /// Frame type, 0..=15 excluding the reserved 10..=13
    pub ft: u8,
    /// Quality bit (0 = damaged)
    pub q: u8,
    /// Frame payload, zero-padded in the final byte's unused bits
    pub data: Vec<u8>,
}

impl AmrFrame {
    pub fn is_speech(&self) -> bool {
        self.ft <= 8
    }

    pub fn is_sid(&self) -> bool {
        self.ft == FT_SID
    }

    pub fn is_no_data(&self) -> bool {
        self.ft == FT_NO_DATA || self.ft == FT_SPEECH_LOST
    }

    pub fn size_bytes(&self) -> usize {
        frame_bytes(self.ft).unwrap_or(0)
    }

    pub fn bit_len(&self) -> usize {
        frame_bits(self.ft).unwrap_or(0)
    }
}

/// Tagged parse failures. `Display` renders the wire-diagnostic tags that
/// appear in logs and in `TranscodeResult::error`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AmrError {
    #[error("invalid_ft_{0}")]
    InvalidFt(u8),
    #[error("toc_truncated")]
    TocTruncated,
    #[error("frame_truncated_ft_{0}")]
    FrameTruncated(u8),
    #[error("data_len_mismatch_expected_{expected}_got_{got}")]
    DataLenMismatch { expected: usize, got: usize },
    #[error("trailing_bits_nonzero")]
    TrailingBitsNonzero,
    #[error("missing_toc")]
    MissingToc,
    #[error("payload_too_short")]
    PayloadTooShort,
}

/// Which packing the transcoder settled on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packing {
    /// Bandwidth-efficient input, normalized to octet-aligned output
    Be,
    /// Octet-aligned input passed through (CMR stripped if present)
    Octet,
    Invalid,
}

/// Outcome of the normalize-first transcode
#[derive(Debug, Clone)]
pub struct TranscodeResult {
    pub ok: bool,
    pub packing: Packing,
    /// Canonical octet-aligned payload without a CMR byte
    pub output: Vec<u8>,
    pub frames: Vec<AmrFrame>,
    /// CMR carried by the input, when one was present
    pub cmr: Option<u8>,
    /// Output never carries a CMR byte
    pub cmr_stripped: bool,
    pub toc_count: usize,
    /// Concatenated diagnostics of every failed attempt (invalid only)
    pub error: Option<String>,
    /// True when an RTP header was removed ahead of parsing
    pub rtp_stripped: bool,
}

impl TranscodeResult {
    fn ok(
        packing: Packing,
        output: Vec<u8>,
        parsed: ParsedPayload,
        rtp_stripped: bool,
    ) -> Self {
        let toc_count = parsed.frames.len();
        Self {
            ok: true,
            packing,
            output,
            frames: parsed.frames,
            cmr: parsed.cmr,
            cmr_stripped: true,
            toc_count,
            error: None,
            rtp_stripped,
        }
    }
}

/// Normalize one inbound AMR-WB buffer to octet-aligned frames.
///
/// The attempt order matters: bit-packed parses are preferred and validated
/// by a repack→re-parse round trip, and only then are the octet-aligned
/// interpretations considered.
pub fn transcode(raw: &[u8]) -> TranscodeResult {
    let strip = detect_and_strip_rtp_header(raw);
    let payload = strip.payload.as_slice();
    let mut failures: Vec<String> = Vec::new();

    for mode in [BeCmr::Nibble, BeCmr::Absent, BeCmr::ExplicitByte] {
        match parse_bandwidth_efficient(payload, mode) {
            Ok(parsed) => {
                let repacked = repack_octet_aligned(parsed.cmr, &parsed.frames, false);
                match parse_octet_aligned(&repacked, false) {
                    Ok(validated) if validated.frames == parsed.frames => {
                        return TranscodeResult::ok(Packing::Be, repacked, parsed, strip.stripped);
                    }
                    Ok(_) => failures.push(format!("{}:repack_mismatch", mode.tag())),
                    Err(e) => failures.push(format!("{}:repack_{e}", mode.tag())),
                }
            }
            Err(e) => failures.push(format!("{}:{e}", mode.tag())),
        }
    }

    match parse_octet_aligned(payload, true) {
        Ok(parsed) => {
            // Passthrough minus the CMR byte
            let output = payload[1..].to_vec();
            return TranscodeResult::ok(Packing::Octet, output, parsed, strip.stripped);
        }
        Err(e) => failures.push(format!("octet_cmr:{e}")),
    }

    match parse_octet_aligned(payload, false) {
        Ok(parsed) => {
            return TranscodeResult::ok(Packing::Octet, payload.to_vec(), parsed, strip.stripped);
        }
        Err(e) => failures.push(format!("octet:{e}")),
    }

    TranscodeResult {
        ok: false,
        packing: Packing::Invalid,
        output: Vec::new(),
        frames: Vec::new(),
        cmr: None,
        cmr_stripped: false,
        toc_count: 0,
        error: Some(failures.join("; ")),
        rtp_stripped: strip.stripped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size_tables() {
        assert_eq!(frame_bytes(0), Some(17));
        assert_eq!(frame_bytes(8), Some(60));
        assert_eq!(frame_bytes(9), Some(5));
        assert_eq!(frame_bytes(13), None);
        assert_eq!(frame_bytes(15), Some(0));
        assert_eq!(frame_bits(0), Some(132));
        assert_eq!(frame_bits(9), Some(40));
        assert_eq!(frame_bits(11), None);
    }

    #[test]
    fn test_error_tags_render() {
        assert_eq!(AmrError::InvalidFt(13).to_string(), "invalid_ft_13");
        assert_eq!(
            AmrError::DataLenMismatch { expected: 33, got: 34 }.to_string(),
            "data_len_mismatch_expected_33_got_34"
        );
        assert_eq!(AmrError::FrameTruncated(2).to_string(), "frame_truncated_ft_2");
    }

    #[test]
    fn test_frame_kind_helpers() {
        let f = AmrFrame { ft: 9, q: 1, data: vec![0; 5] };
        assert!(f.is_sid());
        assert!(!f.is_speech());
        assert_eq!(f.bit_len(), 40);
        let nd = AmrFrame { ft: 15, q: 1, data: vec![] };
        assert!(nd.is_no_data());
    }
}
