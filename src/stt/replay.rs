//! Frame replay guard
//!
//! Defends against upstream lag-k replay bugs: some media relays have been
//! seen re-delivering a recent frame verbatim a few positions later, which
//! doubles syllables in the transcript. Each frame's PCM bytes are hashed
//! with SHA-1 and dropped when the hash appears in the recent window. The
//! window resets across playback boundaries because identical prompt audio
//! legitimately repeats there.

use sha1::{Digest, Sha1};
use std::collections::VecDeque;

type FrameHash = [u8; 20];

/// Sliding-window duplicate detector over PCM16 frames
pub struct ReplayGuard {
    window: VecDeque<FrameHash>,
    capacity: usize,
}

impl ReplayGuard {
    pub fn new(capacity: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    fn hash(pcm16: &[i16]) -> FrameHash {
        let mut hasher = Sha1::new();
        for s in pcm16 {
            hasher.update(s.to_le_bytes());
        }
        hasher.finalize().into()
    }

    /// Returns true when the frame is a replay of a recent one
    pub fn is_replay(&mut self, pcm16: &[i16]) -> bool {
        let hash = Self::hash(pcm16);
        if self.window.contains(&hash) {
            return true;
        }
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(hash);
        false
    }

    /// Forget everything (playback boundary)
    pub fn reset(&mut self) {
        self.window.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_within_window_is_caught() {
        let mut g = ReplayGuard::new(4);
        let frame: Vec<i16> = (0..320).map(|i| i as i16).collect();
        assert!(!g.is_replay(&frame));
        assert!(!g.is_replay(&vec![7i16; 320]));
        assert!(g.is_replay(&frame));
    }

    #[test]
    fn test_duplicate_outside_window_passes() {
        let mut g = ReplayGuard::new(2);
        let frame = vec![1i16; 320];
        assert!(!g.is_replay(&frame));
        assert!(!g.is_replay(&vec![2i16; 320]));
        assert!(!g.is_replay(&vec![3i16; 320]));
        // The original hash has been evicted
        assert!(!g.is_replay(&frame));
    }

    #[test]
    fn test_reset_forgets_hashes() {
        let mut g = ReplayGuard::new(8);
        let frame = vec![5i16; 320];
        assert!(!g.is_replay(&frame));
        g.reset();
        assert!(!g.is_replay(&frame));
    }

    #[test]
    fn test_distinct_frames_never_collide() {
        let mut g = ReplayGuard::new(32);
        for i in 0..100i16 {
            assert!(!g.is_replay(&vec![i; 320]));
        }
    }
}
