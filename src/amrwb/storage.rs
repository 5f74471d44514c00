//! `.awb` storage-format debug artifacts
//!
//! The storage format (RFC 4867 §5.3) is self-describing and plays in any
//! AMR-WB-aware player, which makes it the right shape for offline triage of
//! suspect payloads: header `"#!AMR-WB\n"`, then per frame one storage TOC
//! byte `(FT<<3)|(Q<<2)` followed by the frame's payload bytes.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, warn};

use super::{frame_bytes, AmrError, AmrFrame};

/// Magic header for single-channel AMR-WB storage files
pub const STORAGE_HEADER: &[u8] = b"#!AMR-WB\n";

/// Files written without spacing before the rate limit kicks in
const INITIAL_BURST: u32 = 30;
/// Minimum spacing after the burst
const MIN_SPACING_SECS: u64 = 1;

/// Encode a frame list into storage-format bytes
pub fn encode_storage(frames: &[AmrFrame]) -> Vec<u8> {
    let mut out = Vec::with_capacity(
        STORAGE_HEADER.len() + frames.iter().map(|f| 1 + f.data.len()).sum::<usize>(),
    );
    out.extend_from_slice(STORAGE_HEADER);
    for frame in frames {
        out.push((frame.ft << 3) | (frame.q << 2));
        out.extend_from_slice(&frame.data);
    }
    out
}

/// Decode storage-format bytes back into frames
pub fn decode_storage(bytes: &[u8]) -> Result<Vec<AmrFrame>, AmrError> {
    let body = bytes
        .strip_prefix(STORAGE_HEADER)
        .ok_or(AmrError::PayloadTooShort)?;

    let mut frames = Vec::new();
    let mut idx = 0usize;
    while idx < body.len() {
        let toc = body[idx];
        idx += 1;
        let ft = (toc >> 3) & 0x0f;
        let q = (toc >> 2) & 1;
        let size = frame_bytes(ft).ok_or(AmrError::InvalidFt(ft))?;
        if body.len() - idx < size {
            return Err(AmrError::FrameTruncated(ft));
        }
        frames.push(AmrFrame {
            ft,
            q,
            data: body[idx..idx + size].to_vec(),
        });
        idx += size;
    }
    Ok(frames)
}

/// Rate-limited writer of `.awb` artifacts for one process lifetime
pub struct AwbDumpWriter {
    dir: PathBuf,
    files_written: u32,
    last_write: Option<Instant>,
}

impl AwbDumpWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            files_written: 0,
            last_write: None,
        }
    }

    /// Write one artifact unless rate-limited. Returns the path when a file
    /// was written.
    pub fn maybe_dump(&mut self, call_id: &str, frames: &[AmrFrame]) -> Result<Option<PathBuf>> {
        if self.files_written >= INITIAL_BURST {
            if let Some(last) = self.last_write {
                if last.elapsed().as_secs() < MIN_SPACING_SECS {
                    return Ok(None);
                }
            }
        }

        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating awb dump dir {}", self.dir.display()))?;

        let name = format!("{}_{:05}.awb", sanitize(call_id), self.files_written);
        let path = self.dir.join(name);
        match std::fs::write(&path, encode_storage(frames)) {
            Ok(()) => {
                self.files_written += 1;
                self.last_write = Some(Instant::now());
                debug!(path = %path.display(), frames = frames.len(), "wrote awb artifact");
                Ok(Some(path))
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "awb artifact write failed");
                Err(e).context("writing awb artifact")
            }
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .take(48)
        .collect()
}
