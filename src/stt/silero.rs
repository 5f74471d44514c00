//! Silero VAD inference over ONNX Runtime
//!
//! ML speech detection for the STT pipeline. The model consumes 512-sample
//! windows of 16 kHz f32 audio plus a recurrent state tensor and returns a
//! speech probability; the pipeline applies its own hysteresis on top. PCM
//! frames of other sizes are windowed internally and the last probability is
//! held between windows.

use anyhow::{Context, Result};
use ort::session::Session;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const SAMPLE_RATE: i64 = 16_000;
const WINDOW_SIZE: usize = 512;
const DEFAULT_MODEL_PATH: &str = "models/silero_vad.onnx";

/// Silero VAD wrapper holding the ONNX session and recurrent state
pub struct SileroVad {
    session: Session,
    /// Hidden state tensor (2, 1, 128), persists across windows
    state: Vec<f32>,
    threshold: f32,
    window: Vec<f32>,
    last_probability: f32,
}

impl SileroVad {
    /// Load the model from `SILERO_VAD_MODEL_PATH` or the default location
    pub fn from_env(threshold: f32) -> Result<Self> {
        let path = std::env::var("SILERO_VAD_MODEL_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_MODEL_PATH));
        Self::load(&path, threshold)
    }

    pub fn load(model_path: &Path, threshold: f32) -> Result<Self> {
        let session = Session::builder()?
            .with_intra_threads(1)?
            .commit_from_file(model_path)
            .with_context(|| format!("loading silero vad model {}", model_path.display()))?;

        info!(path = %model_path.display(), threshold, "silero vad loaded");

        Ok(Self {
            session,
            state: vec![0.0f32; 2 * 128],
            threshold,
            window: Vec::with_capacity(WINDOW_SIZE),
            last_probability: 0.0,
        })
    }

    /// Feed one PCM16 frame at 16 kHz; returns the speech decision.
    ///
    /// Inference runs once per completed 512-sample window; between windows
    /// the previous probability is held.
    pub fn is_speech(&mut self, pcm16: &[i16]) -> bool {
        self.window
            .extend(pcm16.iter().map(|&s| s as f32 / 32768.0));

        while self.window.len() >= WINDOW_SIZE {
            let chunk: Vec<f32> = self.window.drain(..WINDOW_SIZE).collect();
            match self.run_inference(&chunk) {
                Ok(p) => self.last_probability = p,
                Err(e) => {
                    debug!(error = %e, "silero inference failed; holding last probability");
                }
            }
        }
        self.last_probability >= self.threshold
    }

    fn run_inference(&mut self, audio: &[f32]) -> Result<f32> {
        use ort::value::Value;

        let input = Value::from_array(([1usize, audio.len()], audio.to_vec()))?;
        let state = Value::from_array(([2usize, 1usize, 128usize], self.state.clone()))?;
        let sr = Value::from_array(([1usize], vec![SAMPLE_RATE]))?;

        let outputs = self.session.run(ort::inputs![input, state, sr])?;

        let (_shape, prob) = outputs[0].try_extract_tensor::<f32>()?;
        let probability = prob.first().copied().unwrap_or(0.0);

        let (_shape, new_state) = outputs[1].try_extract_tensor::<f32>()?;
        if new_state.len() == self.state.len() {
            self.state.copy_from_slice(new_state);
        }

        Ok(probability)
    }

    /// Clear recurrent state and windowing (stream restart)
    pub fn reset(&mut self) {
        self.state.fill(0.0);
        self.window.clear();
        self.last_probability = 0.0;
    }
}
