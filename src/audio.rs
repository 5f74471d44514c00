//! PCM16 helpers shared by the ingest and STT paths

/// Convert little-endian PCM16 bytes to samples. Odd trailing byte is dropped.
pub fn bytes_to_pcm16(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}

/// Convert samples back to little-endian bytes
pub fn pcm16_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// Convert i16 PCM samples to f32 normalized [-1.0, 1.0]
pub fn i16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

/// Convert f32 normalized samples to i16 PCM
pub fn f32_to_i16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s * 32767.0).clamp(-32768.0, 32767.0) as i16)
        .collect()
}

/// RMS of a PCM16 frame, normalized to [0.0, 1.0]
pub fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples
        .iter()
        .map(|&s| {
            let f = s as f64 / 32768.0;
            f * f
        })
        .sum();
    (sum_sq / samples.len() as f64).sqrt() as f32
}

/// Peak absolute amplitude, normalized to [0.0, 1.0]
pub fn peak(samples: &[i16]) -> f32 {
    samples
        .iter()
        .map(|&s| (s as f32 / 32768.0).abs())
        .fold(0.0f32, f32::max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_roundtrip() {
        let samples = vec![0i16, 1000, -1000, i16::MAX, i16::MIN];
        let bytes = pcm16_to_bytes(&samples);
        assert_eq!(bytes_to_pcm16(&bytes), samples);
    }

    #[test]
    fn test_odd_trailing_byte_dropped() {
        assert_eq!(bytes_to_pcm16(&[0x01, 0x00, 0xff]), vec![1]);
    }

    #[test]
    fn test_f32_conversion() {
        let converted = i16_to_f32(&[0, 32767, -32768]);
        assert!((converted[0]).abs() < 0.001);
        assert!((converted[1] - 1.0).abs() < 0.001);
        assert!((converted[2] + 1.0).abs() < 0.001);

        let back = f32_to_i16(&[0.0, 1.0, -1.0]);
        assert_eq!(back[0], 0);
        assert_eq!(back[1], 32767);
        assert_eq!(back[2], -32767);
    }

    #[test]
    fn test_rms_and_peak() {
        let silence = vec![0i16; 160];
        assert_eq!(rms(&silence), 0.0);
        assert_eq!(peak(&silence), 0.0);

        let tone = vec![16384i16; 160];
        let r = rms(&tone);
        assert!((r - 0.5).abs() < 0.01, "rms was {r}");
        assert!((peak(&tone) - 0.5).abs() < 0.01);
    }
}
