//! Dialog brain client
//!
//! The brain answers transcripts. Two endpoints: a plain `/reply` POST and a
//! `/reply/stream` SSE variant emitting `token`, `done`, `error`, `ping`,
//! and `meta` events. SSE is parsed by hand from the byte stream; the
//! streaming call still resolves to the complete reply text, preferring the
//! `done` event's text over the token concatenation when both exist.

use anyhow::{anyhow, bail, Context, Result};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::types::ConversationTurn;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Request body for both reply endpoints
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReplyRequest<'a> {
    tenant_id: &'a str,
    call_control_id: &'a str,
    transcript: &'a str,
    history: &'a [ConversationTurn],
}

#[derive(Debug, Deserialize)]
struct ReplyResponse {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct TokenEvent {
    #[serde(default)]
    t: String,
}

#[derive(Debug, Deserialize)]
struct DoneEvent {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEvent {
    #[serde(default)]
    message: String,
}

/// HTTP client for the conversational brain
#[derive(Clone)]
pub struct BrainClient {
    client: reqwest::Client,
    base_url: String,
}

impl BrainClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("building brain client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Plain reply: one POST, one JSON body back
    pub async fn reply(
        &self,
        tenant_id: &str,
        call_control_id: &str,
        transcript: &str,
        history: &[ConversationTurn],
    ) -> Result<String> {
        let body = ReplyRequest {
            tenant_id,
            call_control_id,
            transcript,
            history,
        };
        let response = self
            .client
            .post(format!("{}/reply", self.base_url))
            .json(&body)
            .send()
            .await
            .context("brain reply request")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("brain returned {status}: {text}");
        }
        let parsed: ReplyResponse = response.json().await.context("brain reply body")?;
        Ok(parsed.text)
    }

    /// Streaming reply over SSE, resolved to the final text
    pub async fn reply_stream(
        &self,
        tenant_id: &str,
        call_control_id: &str,
        transcript: &str,
        history: &[ConversationTurn],
    ) -> Result<String> {
        let body = ReplyRequest {
            tenant_id,
            call_control_id,
            transcript,
            history,
        };
        let response = self
            .client
            .post(format!("{}/reply/stream", self.base_url))
            .json(&body)
            .send()
            .await
            .context("brain stream request")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("brain stream returned {status}: {text}");
        }

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut tokens = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("reading brain stream")?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            // SSE events are separated by a blank line
            while let Some(pos) = buffer.find("\n\n") {
                let event_block = buffer[..pos].to_string();
                buffer.drain(..pos + 2);

                match parse_sse_event(&event_block) {
                    SseEvent::Token(t) => tokens.push_str(&t),
                    SseEvent::Done(text) => {
                        let final_text = text.unwrap_or_else(|| tokens.clone());
                        debug!(chars = final_text.len(), "brain stream done");
                        return Ok(final_text);
                    }
                    SseEvent::Error(message) => {
                        return Err(anyhow!("brain stream error: {message}"));
                    }
                    SseEvent::Ignored => {}
                }
            }
        }

        // Stream ended without a done event; tokens are the best we have
        if tokens.is_empty() {
            warn!("brain stream closed without done event or tokens");
        }
        Ok(tokens)
    }
}

enum SseEvent {
    Token(String),
    Done(Option<String>),
    Error(String),
    /// ping, meta, comments
    Ignored,
}

fn parse_sse_event(block: &str) -> SseEvent {
    let mut event_name = "message";
    let mut data_lines: Vec<&str> = Vec::new();
    for line in block.lines() {
        if let Some(name) = line.strip_prefix("event:") {
            event_name = name.trim();
        } else if let Some(data) = line.strip_prefix("data:") {
            data_lines.push(data.trim_start());
        }
    }
    let data = data_lines.join("\n");

    match event_name {
        "token" => match serde_json::from_str::<TokenEvent>(&data) {
            Ok(ev) => SseEvent::Token(ev.t),
            Err(_) => SseEvent::Token(data),
        },
        "done" => match serde_json::from_str::<DoneEvent>(&data) {
            Ok(ev) => SseEvent::Done(ev.text),
            Err(_) => SseEvent::Done(None),
        },
        "error" => match serde_json::from_str::<ErrorEvent>(&data) {
            Ok(ev) => SseEvent::Error(ev.message),
            Err(_) => SseEvent::Error(data),
        },
        _ => SseEvent::Ignored,
    }
}
