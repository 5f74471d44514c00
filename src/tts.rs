//! Text-to-speech client
//!
//! Kokoro-style HTTP endpoint: POST `{text, voice, format, sampleRate}`,
//! audio bytes back. Synthesized replies are staged as files under the
//! audio storage directory and served to the carrier from the public audio
//! base URL, since carrier playback takes a URL, not bytes.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
const DEFAULT_VOICE: &str = "af_heart";
const DEFAULT_FORMAT: &str = "wav";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SynthesisRequest<'a> {
    text: &'a str,
    voice: &'a str,
    format: &'a str,
    sample_rate: u32,
}

/// One synthesized utterance staged on disk
#[derive(Debug, Clone)]
pub struct StagedAudio {
    pub path: PathBuf,
    /// URL the carrier can fetch
    pub public_url: String,
    pub content_type: String,
}

/// HTTP TTS client plus the local staging directory
#[derive(Clone)]
pub struct TtsClient {
    client: reqwest::Client,
    url: String,
    storage_dir: PathBuf,
    public_base_url: String,
    sample_rate: u32,
}

impl TtsClient {
    pub fn new(
        url: impl Into<String>,
        storage_dir: impl Into<PathBuf>,
        public_base_url: impl Into<String>,
        sample_rate: u32,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("building tts client")?;
        Ok(Self {
            client,
            url: url.into(),
            storage_dir: storage_dir.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
            sample_rate,
        })
    }

    /// Synthesize `text` and stage the audio for carrier playback
    pub async fn synthesize_to_file(&self, text: &str, voice: Option<&str>) -> Result<StagedAudio> {
        let body = SynthesisRequest {
            text,
            voice: voice.unwrap_or(DEFAULT_VOICE),
            format: DEFAULT_FORMAT,
            sample_rate: self.sample_rate,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .context("tts request")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("tts endpoint returned {status}: {text}");
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("audio/wav")
            .to_string();
        let bytes = response.bytes().await.context("reading tts audio")?;
        if bytes.is_empty() {
            bail!("tts endpoint returned no audio");
        }

        tokio::fs::create_dir_all(&self.storage_dir)
            .await
            .context("creating audio storage dir")?;
        let filename = format!("{}.{}", Uuid::new_v4(), extension_for(&content_type));
        let path = self.storage_dir.join(&filename);
        tokio::fs::write(&path, &bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;

        let staged = StagedAudio {
            public_url: format!("{}/{filename}", self.public_base_url),
            path,
            content_type,
        };
        debug!(
            bytes = bytes.len(),
            path = %staged.path.display(),
            "tts audio staged"
        );
        Ok(staged)
    }

    /// Remove a staged file after playback; failures are only logged
    pub async fn discard(&self, staged: &StagedAudio) {
        if let Err(e) = tokio::fs::remove_file(&staged.path).await {
            info!(path = %staged.path.display(), error = %e, "staged audio cleanup failed");
        }
    }
}

fn extension_for(content_type: &str) -> &'static str {
    match content_type.split(';').next().unwrap_or_default().trim() {
        "audio/mpeg" | "audio/mp3" => "mp3",
        "audio/ogg" => "ogg",
        "audio/L16" | "audio/pcm" => "pcm",
        _ => "wav",
    }
}
