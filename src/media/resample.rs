//! Linear resampling and fixed-window re-framing
//!
//! Carrier streams arrive at 8 or 16 kHz in odd-sized chunks; everything
//! downstream wants one rate and one frame size. Both stages are streaming:
//! the resampler keeps its fractional phase and last sample across calls,
//! the reframer carries its remainder.

use crate::types::PcmFrame;

/// Streaming linear-interpolation resampler
pub struct LinearResampler {
    src_rate: u32,
    dst_rate: u32,
    /// Source-sample advance per output sample
    step: f64,
    /// Position in source samples, relative to `prev`
    pos: f64,
    prev: i16,
    primed: bool,
}

impl LinearResampler {
    pub fn new(src_rate: u32, dst_rate: u32) -> Self {
        Self {
            src_rate,
            dst_rate,
            step: f64::from(src_rate) / f64::from(dst_rate),
            pos: 0.0,
            prev: 0,
            primed: false,
        }
    }

    pub fn src_rate(&self) -> u32 {
        self.src_rate
    }

    pub fn resample(&mut self, input: &[i16]) -> Vec<i16> {
        if self.src_rate == self.dst_rate {
            return input.to_vec();
        }
        if input.is_empty() {
            return Vec::new();
        }

        // Work over [prev, input...] so interpolation spans chunk edges
        let mut buf: Vec<i16> = Vec::with_capacity(input.len() + 1);
        if self.primed {
            buf.push(self.prev);
        }
        buf.extend_from_slice(input);
        if !self.primed {
            self.primed = true;
            self.pos = 0.0;
        }

        let mut out = Vec::with_capacity(
            (input.len() as f64 / self.step).ceil() as usize + 1,
        );
        let last = (buf.len() - 1) as f64;
        while self.pos < last {
            let idx = self.pos as usize;
            let frac = self.pos - idx as f64;
            let a = f64::from(buf[idx]);
            let b = f64::from(buf[idx + 1]);
            out.push((a + (b - a) * frac).round() as i16);
            self.pos += self.step;
        }

        // Keep the final sample and re-anchor the phase to it
        self.prev = *buf.last().expect("non-empty");
        self.pos -= last;
        out
    }

    pub fn reset(&mut self) {
        self.pos = 0.0;
        self.prev = 0;
        self.primed = false;
    }
}

/// Cuts a PCM stream into fixed-duration frames, carrying the remainder
pub struct Reframer {
    sample_rate_hz: u32,
    frame_len: usize,
    buffer: Vec<i16>,
    /// Running count of emitted samples, for frame timestamps
    emitted_samples: u64,
}

impl Reframer {
    pub fn new(sample_rate_hz: u32, frame_ms: u64) -> Self {
        let frame_len = (sample_rate_hz as u64 * frame_ms / 1000).max(1) as usize;
        Self {
            sample_rate_hz,
            frame_len,
            buffer: Vec::with_capacity(frame_len * 2),
            emitted_samples: 0,
        }
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Push samples; pop every complete frame
    pub fn push(&mut self, samples: &[i16], seq: Option<u64>) -> Vec<PcmFrame> {
        self.buffer.extend_from_slice(samples);
        let mut frames = Vec::new();
        while self.buffer.len() >= self.frame_len {
            let pcm16: Vec<i16> = self.buffer.drain(..self.frame_len).collect();
            let timestamp_ms = self.emitted_samples * 1000 / u64::from(self.sample_rate_hz);
            self.emitted_samples += self.frame_len as u64;
            frames.push(PcmFrame {
                pcm16,
                sample_rate_hz: self.sample_rate_hz,
                channels: 1,
                timestamp_ms: Some(timestamp_ms),
                seq,
            });
        }
        frames
    }

    /// Drop any buffered remainder (stream restart)
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.emitted_samples = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough_same_rate() {
        let mut r = LinearResampler::new(16_000, 16_000);
        assert_eq!(r.resample(&[1, 2, 3]), vec![1, 2, 3]);
    }

    #[test]
    fn test_upsample_doubles_count() {
        let mut r = LinearResampler::new(8_000, 16_000);
        let out = r.resample(&vec![1000i16; 800]);
        // First chunk has no prev sample to span, so one output short of 2x
        assert!((out.len() as i64 - 1600).abs() <= 2, "len {}", out.len());
        // A constant signal stays constant through interpolation
        assert!(out.iter().all(|&s| s == 1000));
    }

    #[test]
    fn test_upsample_interpolates_midpoints() {
        let mut r = LinearResampler::new(8_000, 16_000);
        let out = r.resample(&[0, 100]);
        // Positions 0.0 and 0.5 of the first chunk
        assert_eq!(out, vec![0, 50]);
    }

    #[test]
    fn test_downsample_halves_count() {
        let mut r = LinearResampler::new(16_000, 8_000);
        let out = r.resample(&vec![500i16; 1600]);
        assert!((out.len() as i64 - 800).abs() <= 2, "len {}", out.len());
    }

    #[test]
    fn test_streaming_matches_one_shot() {
        let signal: Vec<i16> = (0..1600).map(|i| ((i * 37) % 2000 - 1000) as i16).collect();

        let mut whole = LinearResampler::new(8_000, 16_000);
        let expected = whole.resample(&signal);

        let mut chunked = LinearResampler::new(8_000, 16_000);
        let mut got = Vec::new();
        for chunk in signal.chunks(160) {
            got.extend(chunked.resample(chunk));
        }
        assert_eq!(got, expected);
    }

    #[test]
    fn test_reframer_cuts_and_carries() {
        let mut f = Reframer::new(16_000, 20);
        assert_eq!(f.frame_len(), 320);

        let frames = f.push(&vec![1i16; 500], Some(7));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].pcm16.len(), 320);
        assert_eq!(frames[0].timestamp_ms, Some(0));
        assert_eq!(frames[0].seq, Some(7));

        // 180 remainder + 140 = one more frame exactly
        let frames = f.push(&vec![2i16; 140], None);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].timestamp_ms, Some(20));
    }

    #[test]
    fn test_reframer_reset_drops_remainder() {
        let mut f = Reframer::new(16_000, 20);
        f.push(&vec![1i16; 100], None);
        f.reset();
        let frames = f.push(&vec![1i16; 319], None);
        assert!(frames.is_empty());
    }
}
