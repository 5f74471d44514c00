//! RFC 4867 AMR-WB payload parsing for both packings
//!
//! Octet-aligned: [CMR byte]? then TOC bytes `F|FT(4)|Q|00`, then each
//! frame's payload at its defined byte size.
//!
//! Bandwidth-efficient: [CMR]? then 6-bit TOC entries `F|FT(4)|Q`, then each
//! frame's speech bits tightly packed, zero-padded to the byte boundary.
//!
//! Both parsers are strict. Nonzero reserved/padding bits fail the parse;
//! the transcoder relies on that strictness to keep bit-packed streams from
//! false-positive parsing as octet-aligned.

use super::bits::{BitReader, BitWriter};
use super::{frame_bits, frame_bytes, AmrError, AmrFrame, CMR_NO_PREFERENCE};

/// One successfully parsed payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPayload {
    /// Codec mode request, when the packing carried one
    pub cmr: Option<u8>,
    pub frames: Vec<AmrFrame>,
}

/// How a bandwidth-efficient payload encodes its CMR
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeCmr {
    /// Leading 4-bit CMR (the RFC layout)
    Nibble,
    /// No CMR at all
    Absent,
    /// A full leading CMR octet ahead of the packed TOCs (seen in the wild)
    ExplicitByte,
}

impl BeCmr {
    pub fn tag(self) -> &'static str {
        match self {
            BeCmr::Nibble => "be_cmr",
            BeCmr::Absent => "be_nocmr",
            BeCmr::ExplicitByte => "be_cmr8",
        }
    }
}

fn check_ft(ft: u8) -> Result<(), AmrError> {
    if (10..=13).contains(&ft) {
        return Err(AmrError::InvalidFt(ft));
    }
    Ok(())
}

/// Strict octet-aligned parse
pub fn parse_octet_aligned(payload: &[u8], cmr_present: bool) -> Result<ParsedPayload, AmrError> {
    if payload.is_empty() {
        return Err(AmrError::PayloadTooShort);
    }

    let mut idx = 0usize;
    let cmr = if cmr_present {
        let byte = payload[idx];
        idx += 1;
        // Reserved low nibble is ignored on receive per the RFC
        Some(byte >> 4)
    } else {
        None
    };

    if idx >= payload.len() {
        return Err(AmrError::MissingToc);
    }

    // TOC section
    let mut entries: Vec<(u8, u8)> = Vec::new();
    loop {
        if idx >= payload.len() {
            return Err(AmrError::TocTruncated);
        }
        let toc = payload[idx];
        idx += 1;

        let follow = toc >> 7;
        let ft = (toc >> 3) & 0x0f;
        let q = (toc >> 2) & 1;
        check_ft(ft)?;
        if toc & 0x03 != 0 {
            return Err(AmrError::TrailingBitsNonzero);
        }
        entries.push((ft, q));
        if follow == 0 {
            break;
        }
    }

    // Frame data section
    let mut frames = Vec::with_capacity(entries.len());
    for (ft, q) in entries {
        let size = frame_bytes(ft).expect("TOC already validated");
        if payload.len() - idx < size {
            return Err(AmrError::FrameTruncated(ft));
        }
        let data = payload[idx..idx + size].to_vec();
        idx += size;
        frames.push(AmrFrame { ft, q, data });
    }

    if idx != payload.len() {
        return Err(AmrError::DataLenMismatch {
            expected: idx,
            got: payload.len(),
        });
    }

    Ok(ParsedPayload { cmr, frames })
}

/// Strict bandwidth-efficient parse
pub fn parse_bandwidth_efficient(payload: &[u8], cmr_mode: BeCmr) -> Result<ParsedPayload, AmrError> {
    if payload.is_empty() {
        return Err(AmrError::PayloadTooShort);
    }

    let mut reader = BitReader::new(payload);
    let cmr = match cmr_mode {
        BeCmr::Nibble => Some(reader.read_bits(4).ok_or(AmrError::PayloadTooShort)? as u8),
        BeCmr::ExplicitByte => {
            let byte = reader.read_bits(8).ok_or(AmrError::PayloadTooShort)? as u8;
            Some(byte >> 4)
        }
        BeCmr::Absent => None,
    };

    // Packed 6-bit TOC entries
    let mut entries: Vec<(u8, u8)> = Vec::new();
    loop {
        let toc = reader.read_bits(6).ok_or(AmrError::TocTruncated)?;
        let follow = (toc >> 5) & 1;
        let ft = ((toc >> 1) & 0x0f) as u8;
        let q = (toc & 1) as u8;
        check_ft(ft)?;
        entries.push((ft, q));
        if follow == 0 {
            break;
        }
    }

    // Tightly packed frame bits
    let mut frames = Vec::with_capacity(entries.len());
    for (ft, q) in entries {
        let bits = frame_bits(ft).expect("TOC already validated");
        let data = reader
            .read_bytes(bits)
            .ok_or(AmrError::FrameTruncated(ft))?;
        frames.push(AmrFrame { ft, q, data });
    }

    // Only padding to the byte boundary may remain, and it must be zero
    let consumed_bytes = reader.bit_position().div_ceil(8);
    if reader.remaining_bits() >= 8 {
        return Err(AmrError::DataLenMismatch {
            expected: consumed_bytes,
            got: payload.len(),
        });
    }
    if !reader.rest_is_zero() {
        return Err(AmrError::TrailingBitsNonzero);
    }

    Ok(ParsedPayload { cmr, frames })
}

/// Re-emit a frame list as a canonical octet-aligned payload
pub fn repack_octet_aligned(cmr: Option<u8>, frames: &[AmrFrame], include_cmr: bool) -> Vec<u8> {
    let mut out = Vec::new();
    if include_cmr {
        out.push(cmr.unwrap_or(CMR_NO_PREFERENCE) << 4);
    }
    for (i, frame) in frames.iter().enumerate() {
        let follow = if i + 1 < frames.len() { 1u8 } else { 0 };
        out.push((follow << 7) | (frame.ft << 3) | (frame.q << 2));
    }
    for frame in frames {
        out.extend_from_slice(&frame.data);
    }
    out
}

/// Build a bandwidth-efficient payload from a frame list (test vectors and
/// loopback diagnostics)
pub fn pack_bandwidth_efficient(cmr: Option<u8>, frames: &[AmrFrame]) -> Vec<u8> {
    let mut writer = BitWriter::new();
    if let Some(cmr) = cmr {
        writer.write_bits(u32::from(cmr & 0x0f), 4);
    }
    for (i, frame) in frames.iter().enumerate() {
        let follow = if i + 1 < frames.len() { 1u32 } else { 0 };
        writer.write_bits(follow, 1);
        writer.write_bits(u32::from(frame.ft), 4);
        writer.write_bits(u32::from(frame.q), 1);
    }
    for frame in frames {
        let bits = frame_bits(frame.ft).unwrap_or(0);
        writer.write_bytes(&frame.data, bits);
    }
    writer.into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn speech_frame(ft: u8, q: u8, fill: u8) -> AmrFrame {
        let size = frame_bytes(ft).unwrap();
        let bits = frame_bits(ft).unwrap();
        let mut data = vec![fill; size];
        // Clear the pad bits of the final byte so the frame is canonical
        let pad = size * 8 - bits;
        if pad > 0 {
            let mask = !((1u16 << pad) - 1) as u8;
            data[size - 1] &= mask;
        }
        AmrFrame { ft, q, data }
    }

    #[test]
    fn test_octet_aligned_single_frame() {
        // TOC 0x14: F=0, FT=2, Q=1; FT=2 carries 32 bytes
        let mut payload = vec![0x14];
        payload.extend_from_slice(&[0x55; 32]);
        let parsed = parse_octet_aligned(&payload, false).unwrap();
        assert_eq!(parsed.cmr, None);
        assert_eq!(parsed.frames.len(), 1);
        assert_eq!(parsed.frames[0].ft, 2);
        assert_eq!(parsed.frames[0].q, 1);
        assert_eq!(parsed.frames[0].data.len(), 32);
    }

    #[test]
    fn test_octet_aligned_cmr_stripping() {
        let mut payload = vec![0xf0, 0x14];
        payload.extend_from_slice(&[0x33; 32]);
        let parsed = parse_octet_aligned(&payload, true).unwrap();
        assert_eq!(parsed.cmr, Some(15));
        assert_eq!(parsed.frames.len(), 1);
    }

    #[test]
    fn test_octet_aligned_multi_frame() {
        // Two frames: F=1 on the first TOC
        let mut payload = vec![0x94, 0x14];
        payload.extend_from_slice(&[0x11; 32]);
        payload.extend_from_slice(&[0x22; 32]);
        let parsed = parse_octet_aligned(&payload, false).unwrap();
        assert_eq!(parsed.frames.len(), 2);
        assert_eq!(parsed.frames[0].data[0], 0x11);
        assert_eq!(parsed.frames[1].data[0], 0x22);
    }

    #[test]
    fn test_octet_aligned_invalid_ft() {
        // TOC with FT=13
        let payload = vec![(13u8 << 3) | 0x04];
        assert_eq!(
            parse_octet_aligned(&payload, false),
            Err(AmrError::InvalidFt(13))
        );
    }

    #[test]
    fn test_octet_aligned_truncated_frame() {
        let mut payload = vec![0x14];
        payload.extend_from_slice(&[0x55; 10]); // 32 expected
        assert_eq!(
            parse_octet_aligned(&payload, false),
            Err(AmrError::FrameTruncated(2))
        );
    }

    #[test]
    fn test_octet_aligned_extra_bytes_rejected() {
        let mut payload = vec![0x14];
        payload.extend_from_slice(&[0x55; 33]);
        assert_eq!(
            parse_octet_aligned(&payload, false),
            Err(AmrError::DataLenMismatch { expected: 33, got: 34 })
        );
    }

    #[test]
    fn test_octet_aligned_cmr_only_is_missing_toc() {
        assert_eq!(
            parse_octet_aligned(&[0xf0], true),
            Err(AmrError::MissingToc)
        );
    }

    #[test]
    fn test_octet_aligned_toc_padding_must_be_zero() {
        let payload = vec![0x15]; // low bits 01
        assert_eq!(
            parse_octet_aligned(&payload, false),
            Err(AmrError::TrailingBitsNonzero)
        );
    }

    #[test]
    fn test_be_roundtrip_single() {
        let frame = speech_frame(0, 1, 0xa5);
        let payload = pack_bandwidth_efficient(Some(15), &[frame.clone()]);
        // 4 + 6 + 132 bits = 142 -> 18 bytes
        assert_eq!(payload.len(), 18);
        let parsed = parse_bandwidth_efficient(&payload, BeCmr::Nibble).unwrap();
        assert_eq!(parsed.cmr, Some(15));
        assert_eq!(parsed.frames, vec![frame]);
    }

    #[test]
    fn test_be_roundtrip_multi_no_cmr() {
        let frames = vec![speech_frame(2, 1, 0x5a), speech_frame(9, 0, 0xff)];
        let payload = pack_bandwidth_efficient(None, &frames);
        let parsed = parse_bandwidth_efficient(&payload, BeCmr::Absent).unwrap();
        assert_eq!(parsed.cmr, None);
        assert_eq!(parsed.frames, frames);
    }

    #[test]
    fn test_be_nonzero_trailing_bits_rejected() {
        let frame = speech_frame(0, 1, 0xa5);
        let mut payload = pack_bandwidth_efficient(Some(15), &[frame]);
        let last = payload.len() - 1;
        payload[last] |= 0x01; // dirty a pad bit
        assert_eq!(
            parse_bandwidth_efficient(&payload, BeCmr::Nibble),
            Err(AmrError::TrailingBitsNonzero)
        );
    }

    #[test]
    fn test_be_extra_whole_byte_rejected() {
        let frame = speech_frame(0, 1, 0xa5);
        let mut payload = pack_bandwidth_efficient(Some(15), &[frame]);
        payload.push(0x00);
        assert!(matches!(
            parse_bandwidth_efficient(&payload, BeCmr::Nibble),
            Err(AmrError::DataLenMismatch { .. })
        ));
    }

    #[test]
    fn test_be_truncated_speech_bits() {
        let frame = speech_frame(8, 1, 0x77);
        let mut payload = pack_bandwidth_efficient(None, &[frame]);
        payload.truncate(payload.len() / 2);
        assert_eq!(
            parse_bandwidth_efficient(&payload, BeCmr::Absent),
            Err(AmrError::FrameTruncated(8))
        );
    }

    #[test]
    fn test_repack_matches_be_parse() {
        let frames = vec![speech_frame(1, 1, 0x3c), speech_frame(1, 0, 0xc3)];
        let be = pack_bandwidth_efficient(Some(1), &frames);
        let parsed = parse_bandwidth_efficient(&be, BeCmr::Nibble).unwrap();
        let octet = repack_octet_aligned(parsed.cmr, &parsed.frames, false);
        let reparsed = parse_octet_aligned(&octet, false).unwrap();
        assert_eq!(reparsed.frames, frames);
    }

    #[test]
    fn test_repack_with_cmr_prefix() {
        let frames = vec![speech_frame(0, 1, 0x01)];
        let octet = repack_octet_aligned(Some(2), &frames, true);
        assert_eq!(octet[0], 2 << 4);
        let parsed = parse_octet_aligned(&octet, true).unwrap();
        assert_eq!(parsed.cmr, Some(2));
    }

    #[test]
    fn test_no_data_frames_have_no_payload() {
        // FT=15 No Data: TOC only
        let payload = vec![(15u8 << 3) | 0x04];
        let parsed = parse_octet_aligned(&payload, false).unwrap();
        assert_eq!(parsed.frames[0].ft, 15);
        assert!(parsed.frames[0].data.is_empty());
    }
}
