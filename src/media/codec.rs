//! Codec decode stage: carrier payload bytes → PCM16 mono at a known rate

use anyhow::{anyhow, Result};
use tracing::debug;

use super::g722::G722Decoder;
use crate::amrwb::{self, Packing};

/// Codecs the carrier can negotiate on the media stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Pcmu,
    Pcma,
    L16,
    G722,
    Opus,
    AmrWb,
}

impl Codec {
    /// Parse the media_format encoding name from the start event
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "PCMU" | "ULAW" | "MULAW" | "G711U" => Some(Self::Pcmu),
            "PCMA" | "ALAW" | "G711A" => Some(Self::Pcma),
            "L16" | "PCM16" | "LINEAR16" => Some(Self::L16),
            "G722" => Some(Self::G722),
            "OPUS" => Some(Self::Opus),
            "AMR-WB" | "AMRWB" | "AMR_WB" => Some(Self::AmrWb),
            _ => None,
        }
    }

    pub fn wire_name(self) -> &'static str {
        match self {
            Self::Pcmu => "PCMU",
            Self::Pcma => "PCMA",
            Self::L16 => "L16",
            Self::G722 => "G722",
            Self::Opus => "OPUS",
            Self::AmrWb => "AMR-WB",
        }
    }

    /// Decoded payloads smaller than this are counted as "tiny" pathology
    pub fn min_expected_payload(self) -> usize {
        match self {
            Self::AmrWb => 20,
            _ => 10,
        }
    }
}

/// Seam for an external AMR-WB speech decoder.
///
/// The depacketizer produces canonical octet-aligned frames; turning those
/// into PCM requires a full ACELP decoder, which this runtime does not embed.
/// Deployments that carry one plug it in here; otherwise AMR-WB frames are
/// reported as unsupported and the health monitor drives a PCMU restart.
pub trait AmrWbPcmDecoder: Send {
    /// Decode octet-aligned frames to 16 kHz PCM16 mono
    fn decode(&mut self, frames: &[amrwb::AmrFrame]) -> Result<Vec<i16>>;
}

/// One decoded buffer with the rate the codec produced it at
#[derive(Debug, Clone)]
pub struct Decoded {
    pub pcm16: Vec<i16>,
    pub sample_rate_hz: u32,
}

/// Stateful decoder bound to one media stream
pub struct StreamDecoder {
    codec: Codec,
    /// Rate announced by the start event (G.711/L16 streams)
    input_rate_hz: u32,
    g722: G722Decoder,
    #[cfg(feature = "opus")]
    opus: Option<audiopus::coder::Decoder>,
    amrwb_pcm: Option<Box<dyn AmrWbPcmDecoder>>,
}

impl StreamDecoder {
    pub fn new(codec: Codec, input_rate_hz: u32) -> Self {
        Self {
            codec,
            input_rate_hz,
            g722: G722Decoder::new(),
            #[cfg(feature = "opus")]
            opus: None,
            amrwb_pcm: None,
        }
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Install an external AMR-WB speech decoder backend
    pub fn set_amrwb_backend(&mut self, backend: Box<dyn AmrWbPcmDecoder>) {
        self.amrwb_pcm = Some(backend);
    }

    /// Decode one payload. Err means the frame is dropped and counted as a
    /// decode failure by the health monitor.
    pub fn decode(&mut self, payload: &[u8]) -> Result<Decoded> {
        match self.codec {
            Codec::Pcmu => Ok(Decoded {
                pcm16: payload.iter().map(|&b| ulaw_to_linear(b)).collect(),
                sample_rate_hz: self.input_rate_hz,
            }),
            Codec::Pcma => Ok(Decoded {
                pcm16: payload.iter().map(|&b| alaw_to_linear(b)).collect(),
                sample_rate_hz: self.input_rate_hz,
            }),
            Codec::L16 => Ok(Decoded {
                pcm16: crate::audio::bytes_to_pcm16(payload),
                sample_rate_hz: self.input_rate_hz,
            }),
            Codec::G722 => Ok(Decoded {
                pcm16: self.g722.decode(payload),
                sample_rate_hz: G722Decoder::OUTPUT_RATE_HZ,
            }),
            Codec::Opus => self.decode_opus(payload),
            Codec::AmrWb => self.decode_amrwb(payload),
        }
    }

    #[cfg(feature = "opus")]
    fn decode_opus(&mut self, payload: &[u8]) -> Result<Decoded> {
        use audiopus::{coder::Decoder, Channels, SampleRate};

        if self.opus.is_none() {
            self.opus = Some(
                Decoder::new(SampleRate::Hz16000, Channels::Mono)
                    .map_err(|e| anyhow!("opus decoder init: {e}"))?,
            );
        }
        let decoder = self.opus.as_mut().expect("just initialized");

        // 120 ms at 16 kHz is the largest legal opus frame
        let mut pcm = vec![0i16; 1920];
        let n = decoder
            .decode(Some(payload), &mut pcm, false)
            .map_err(|e| anyhow!("opus decode: {e}"))?;
        pcm.truncate(n);
        Ok(Decoded {
            pcm16: pcm,
            sample_rate_hz: 16_000,
        })
    }

    #[cfg(not(feature = "opus"))]
    fn decode_opus(&mut self, _payload: &[u8]) -> Result<Decoded> {
        Err(anyhow!("opus support not built in"))
    }

    fn decode_amrwb(&mut self, payload: &[u8]) -> Result<Decoded> {
        let result = amrwb::transcode(payload);
        if !result.ok {
            return Err(anyhow!(
                "amrwb depacketize failed: {}",
                result.error.unwrap_or_default()
            ));
        }
        if result.packing == Packing::Be {
            debug!(toc_count = result.toc_count, "normalized bandwidth-efficient amrwb payload");
        }
        match self.amrwb_pcm.as_mut() {
            Some(backend) => Ok(Decoded {
                pcm16: backend.decode(&result.frames)?,
                sample_rate_hz: 16_000,
            }),
            None => Err(anyhow!("amrwb pcm decode unsupported (no backend)")),
        }
    }
}

/// µ-law expansion (G.711)
pub fn ulaw_to_linear(ulaw: u8) -> i16 {
    let u = !ulaw;
    let t = ((i32::from(u & 0x0f) << 3) + 0x84) << ((u >> 4) & 0x07);
    let v = if u & 0x80 != 0 { 0x84 - t } else { t - 0x84 };
    v as i16
}

/// A-law expansion (G.711)
pub fn alaw_to_linear(alaw: u8) -> i16 {
    let a = alaw ^ 0x55;
    let seg = (a >> 4) & 0x07;
    let mut v = i32::from(a & 0x0f) << 4;
    if seg > 0 {
        v = (v + 0x108) << (seg - 1);
    } else {
        v += 8;
    }
    let v = if a & 0x80 != 0 { v } else { -v };
    v as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_parse_aliases() {
        assert_eq!(Codec::parse("pcmu"), Some(Codec::Pcmu));
        assert_eq!(Codec::parse("MULAW"), Some(Codec::Pcmu));
        assert_eq!(Codec::parse("AMR-WB"), Some(Codec::AmrWb));
        assert_eq!(Codec::parse("amr_wb"), Some(Codec::AmrWb));
        assert_eq!(Codec::parse("vorbis"), None);
    }

    #[test]
    fn test_ulaw_silence_decodes_to_zero() {
        assert_eq!(ulaw_to_linear(0xff), 0);
    }

    #[test]
    fn test_ulaw_sign_symmetry() {
        // Clearing the sign bit flips the sample's polarity
        let pos = ulaw_to_linear(0x0f);
        let neg = ulaw_to_linear(0x8f);
        assert_eq!(pos, -neg);
    }

    #[test]
    fn test_alaw_silence_is_small() {
        assert!(alaw_to_linear(0xd5).abs() <= 8);
    }

    #[test]
    fn test_alaw_extremes_are_loud() {
        // Code 0x2a maps to the top A-law segment
        assert!(alaw_to_linear(0x2a).abs() > 20_000);
        assert!(alaw_to_linear(0xaa).abs() > 20_000);
    }

    #[test]
    fn test_l16_passthrough() {
        let mut dec = StreamDecoder::new(Codec::L16, 8_000);
        let bytes = crate::audio::pcm16_to_bytes(&[100, -100, 0]);
        let out = dec.decode(&bytes).unwrap();
        assert_eq!(out.pcm16, vec![100, -100, 0]);
        assert_eq!(out.sample_rate_hz, 8_000);
    }

    #[test]
    fn test_g722_reports_sixteen_k() {
        let mut dec = StreamDecoder::new(Codec::G722, 8_000);
        let out = dec.decode(&[0x55; 80]).unwrap();
        assert_eq!(out.sample_rate_hz, 16_000);
        assert_eq!(out.pcm16.len(), 160);
    }

    #[test]
    fn test_amrwb_without_backend_is_unsupported() {
        let mut dec = StreamDecoder::new(Codec::AmrWb, 16_000);
        let mut payload = vec![0x14];
        payload.extend_from_slice(&[0x55; 32]);
        let err = dec.decode(&payload).unwrap_err();
        assert!(err.to_string().contains("unsupported"));
    }

    #[test]
    fn test_amrwb_garbage_reports_depacketize_failure() {
        let mut dec = StreamDecoder::new(Codec::AmrWb, 16_000);
        let err = dec.decode(&[0xf1, 0x6e, 0x00, 0x00]).unwrap_err();
        assert!(err.to_string().contains("invalid_ft_13"));
    }
}
