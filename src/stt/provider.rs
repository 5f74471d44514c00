//! Pluggable transcription providers
//!
//! The pipeline is provider-agnostic: it hands over PCM16 and a sample rate
//! and gets text back. The Whisper-style HTTP provider wraps the audio in a
//! WAV container and POSTs it; endpoint quirks (plain-text responses,
//! optional confidence, language query) live here, not in the pipeline.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::io::Cursor;
use std::time::Duration;
use tracing::debug;

/// A transcription result from any provider
#[derive(Debug, Clone, PartialEq)]
pub struct Transcription {
    pub text: String,
    pub confidence: Option<f32>,
}

/// Anything that can turn PCM16 into text
#[async_trait]
pub trait SttProvider: Send + Sync {
    async fn transcribe(
        &self,
        pcm16: &[i16],
        sample_rate_hz: u32,
        language: Option<&str>,
    ) -> Result<Transcription>;
}

/// Whisper-style HTTP endpoint: POST WAV bytes, JSON or plain text back
pub struct WhisperHttpProvider {
    client: reqwest::Client,
    url: String,
}

#[derive(Debug, Deserialize)]
struct WhisperResponse {
    #[serde(default)]
    text: String,
    #[serde(default)]
    confidence: Option<f32>,
}

impl WhisperHttpProvider {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building whisper http client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl SttProvider for WhisperHttpProvider {
    async fn transcribe(
        &self,
        pcm16: &[i16],
        sample_rate_hz: u32,
        language: Option<&str>,
    ) -> Result<Transcription> {
        let wav = wrap_wav(pcm16, sample_rate_hz)?;
        let mut url = self.url.clone();
        if let Some(lang) = language {
            let sep = if url.contains('?') { '&' } else { '?' };
            url = format!("{url}{sep}language={lang}");
        }

        let response = self
            .client
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "audio/wav")
            .body(wav)
            .send()
            .await
            .context("stt request failed")?;

        let status = response.status();
        let body = response.text().await.context("reading stt response")?;
        if !status.is_success() {
            return Err(anyhow!("stt endpoint returned {status}: {body}"));
        }

        // JSON when the endpoint speaks it, otherwise the body is the text
        let parsed = match serde_json::from_str::<WhisperResponse>(&body) {
            Ok(json) => Transcription {
                text: json.text.trim().to_string(),
                confidence: json.confidence,
            },
            Err(_) => Transcription {
                text: body.trim().to_string(),
                confidence: None,
            },
        };
        debug!(chars = parsed.text.len(), "stt transcription received");
        Ok(parsed)
    }
}

/// Wrap PCM16 mono in a WAV container in memory
pub fn wrap_wav(pcm16: &[i16], sample_rate_hz: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: sample_rate_hz,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).context("creating wav writer")?;
        for &s in pcm16 {
            writer.write_sample(s).context("writing wav sample")?;
        }
        writer.finalize().context("finalizing wav")?;
    }
    Ok(cursor.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wav_header_and_length() {
        let pcm: Vec<i16> = vec![0, 1000, -1000, 32767];
        let wav = wrap_wav(&pcm, 16_000).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        // 44-byte canonical header + 2 bytes per sample
        assert_eq!(wav.len(), 44 + pcm.len() * 2);
    }

    #[test]
    fn test_wav_roundtrip_via_hound() {
        let pcm: Vec<i16> = (0..320).map(|i| (i * 50) as i16).collect();
        let wav = wrap_wav(&pcm, 8_000).unwrap();
        let mut reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        assert_eq!(reader.spec().sample_rate, 8_000);
        assert_eq!(reader.spec().channels, 1);
        let back: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(back, pcm);
    }

    #[test]
    fn test_json_response_shape() {
        let parsed: WhisperResponse =
            serde_json::from_str(r#"{"text":" hello there ","confidence":0.91}"#).unwrap();
        assert_eq!(parsed.text, " hello there ");
        assert_eq!(parsed.confidence, Some(0.91));

        let bare: WhisperResponse = serde_json::from_str(r#"{"text":"hi"}"#).unwrap();
        assert!(bare.confidence.is_none());
    }
}
