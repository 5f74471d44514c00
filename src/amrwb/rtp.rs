//! RTP header detection and stripping
//!
//! Carrier media frames occasionally arrive with the raw RTP packet intact
//! rather than just the codec payload. The depacketizer must see only the
//! payload, so the header (fixed part, CSRC list, extension) and any padding
//! are stripped first when the buffer plausibly starts with an RTP header.

const RTP_FIXED_HEADER_LEN: usize = 12;

/// Result of RTP detection on an inbound media buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpStrip {
    /// True when a version-2 RTP header was found and removed
    pub stripped: bool,
    /// The codec payload (the whole input when nothing was stripped)
    pub payload: Vec<u8>,
    /// Payload type from the header, when one was parsed
    pub payload_type: Option<u8>,
    pub sequence: Option<u16>,
    pub ssrc: Option<u32>,
}

impl RtpStrip {
    fn passthrough(buf: &[u8]) -> Self {
        Self {
            stripped: false,
            payload: buf.to_vec(),
            payload_type: None,
            sequence: None,
            ssrc: None,
        }
    }
}

/// Detect a version-2 RTP header and return the bare payload.
///
/// Conservative: any inconsistency (short header, extension running past the
/// end, padding count larger than the body) means the buffer is treated as a
/// raw codec payload and returned unchanged.
pub fn detect_and_strip_rtp_header(buf: &[u8]) -> RtpStrip {
    if buf.len() < RTP_FIXED_HEADER_LEN {
        return RtpStrip::passthrough(buf);
    }

    let b0 = buf[0];
    let version = b0 >> 6;
    if version != 2 {
        return RtpStrip::passthrough(buf);
    }

    let padding = (b0 >> 5) & 1 == 1;
    let extension = (b0 >> 4) & 1 == 1;
    let csrc_count = (b0 & 0x0f) as usize;

    let mut header_len = RTP_FIXED_HEADER_LEN + 4 * csrc_count;
    if buf.len() < header_len {
        return RtpStrip::passthrough(buf);
    }

    if extension {
        // Extension header: 16-bit profile, 16-bit length in 32-bit words
        if buf.len() < header_len + 4 {
            return RtpStrip::passthrough(buf);
        }
        let ext_words =
            u16::from_be_bytes([buf[header_len + 2], buf[header_len + 3]]) as usize;
        header_len += 4 + 4 * ext_words;
        if buf.len() < header_len {
            return RtpStrip::passthrough(buf);
        }
    }

    let mut end = buf.len();
    if padding {
        let pad = buf[end - 1] as usize;
        if pad == 0 || header_len + pad > end {
            return RtpStrip::passthrough(buf);
        }
        end -= pad;
    }

    RtpStrip {
        stripped: true,
        payload: buf[header_len..end].to_vec(),
        payload_type: Some(buf[1] & 0x7f),
        sequence: Some(u16::from_be_bytes([buf[2], buf[3]])),
        ssrc: Some(u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]])),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_header(b0: u8) -> Vec<u8> {
        let mut h = vec![b0, 96, 0x00, 0x2a]; // PT=96, seq=42
        h.extend_from_slice(&[0, 0, 0, 1]); // timestamp
        h.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]); // ssrc
        h
    }

    #[test]
    fn test_plain_header_stripped() {
        let mut pkt = fixed_header(0x80);
        pkt.extend_from_slice(&[0x11, 0x22]);
        let out = detect_and_strip_rtp_header(&pkt);
        assert!(out.stripped);
        assert_eq!(out.payload, vec![0x11, 0x22]);
        assert_eq!(out.payload_type, Some(96));
        assert_eq!(out.sequence, Some(42));
        assert_eq!(out.ssrc, Some(0xdead_beef));
    }

    #[test]
    fn test_extension_and_payload() {
        // V=2, X=1; extension profile 0x1234, one 32-bit word of data
        let mut pkt = fixed_header(0x90);
        pkt.extend_from_slice(&[0x12, 0x34, 0x00, 0x01]);
        pkt.extend_from_slice(&[0, 0, 0, 0]); // extension word
        pkt.extend_from_slice(&[0xaa, 0xbb, 0xcc]);
        let out = detect_and_strip_rtp_header(&pkt);
        assert!(out.stripped);
        assert_eq!(out.payload, vec![0xaa, 0xbb, 0xcc]);
    }

    #[test]
    fn test_padding_removed() {
        // V=2, P=1; 3 padding bytes, count in the final byte
        let mut pkt = fixed_header(0xa0);
        pkt.extend_from_slice(&[0x77, 0x00, 0x00, 0x03]);
        let out = detect_and_strip_rtp_header(&pkt);
        assert!(out.stripped);
        assert_eq!(out.payload, vec![0x77]);
    }

    #[test]
    fn test_extension_with_padding() {
        let mut pkt = fixed_header(0xb0); // P=1, X=1
        pkt.extend_from_slice(&[0x12, 0x34, 0x00, 0x01]);
        pkt.extend_from_slice(&[1, 2, 3, 4]);
        pkt.extend_from_slice(&[0x55, 0x00, 0x02]);
        let out = detect_and_strip_rtp_header(&pkt);
        assert!(out.stripped);
        assert_eq!(out.payload, vec![0x55]);
    }

    #[test]
    fn test_non_rtp_passthrough() {
        // Version bits 0b00: raw AMR-WB BE payload, must pass through
        let payload = vec![0x3c; 20];
        let out = detect_and_strip_rtp_header(&payload);
        assert!(!out.stripped);
        assert_eq!(out.payload, payload);
    }

    #[test]
    fn test_truncated_extension_passthrough() {
        let mut pkt = fixed_header(0x90);
        pkt.extend_from_slice(&[0x12, 0x34, 0x00, 0x09]); // claims 9 words
        pkt.push(0xaa);
        let out = detect_and_strip_rtp_header(&pkt);
        assert!(!out.stripped);
        assert_eq!(out.payload, pkt);
    }

    #[test]
    fn test_bogus_padding_passthrough() {
        let mut pkt = fixed_header(0xa0);
        pkt.extend_from_slice(&[0x77, 0xff]); // pad count 255 > body
        let out = detect_and_strip_rtp_header(&pkt);
        assert!(!out.stripped);
    }

    #[test]
    fn test_short_buffer_passthrough() {
        let out = detect_and_strip_rtp_header(&[0x80, 0x60]);
        assert!(!out.stripped);
    }
}
