//! Carrier media WebSocket frame schema
//!
//! Events arrive as loosely typed JSON. The envelope is decoded into tagged
//! variants; the audio payload is pulled out separately because real carrier
//! traffic has been seen with the base64 under several different paths, and
//! occasionally with short garbage strings in the documented one. Candidates
//! from every known path are scored and the best decode wins; taking the
//! first non-empty string is exactly the bug that produces the
//! `payload_len=4 decoded_len=2` pathology.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Deserialize;
use serde_json::Value;

/// Media format advertised in the start event
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct MediaFormat {
    #[serde(default)]
    pub encoding: String,
    #[serde(default)]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
}

fn default_channels() -> u16 {
    1
}

/// Start-event body
#[derive(Debug, Clone, Deserialize)]
pub struct StartInfo {
    #[serde(default)]
    pub call_control_id: Option<String>,
    #[serde(default)]
    pub media_format: Option<MediaFormat>,
    #[serde(default)]
    pub track: Option<String>,
}

/// One inbound media-WS event, after envelope decode
#[derive(Debug, Clone)]
pub enum MediaWsEvent {
    Connected,
    Start(StartInfo),
    Media(MediaEventBody),
    Stop,
    /// Unknown event kinds pass through for logging, never fail the stream
    Unknown(String),
}

/// Media-event fields the ingest needs
#[derive(Debug, Clone)]
pub struct MediaEventBody {
    pub track: Option<String>,
    pub seq: Option<u64>,
    pub timestamp_ms: Option<u64>,
    /// Winning payload candidate, when any path decoded acceptably
    pub payload: Option<PayloadCandidate>,
}

/// A scored base64 payload candidate
#[derive(Debug, Clone)]
pub struct PayloadCandidate {
    /// Dotted path the payload was found under
    pub path: &'static str,
    pub encoded_len: usize,
    pub bytes: Vec<u8>,
}

/// Field paths checked for the base64 audio, in preference order for ties
const PAYLOAD_PATHS: [&str; 6] = [
    "media.payload",
    "payload",
    "media.data",
    "data",
    "media.audio",
    "audio",
];

impl MediaWsEvent {
    /// Decode one text frame from the media WebSocket.
    ///
    /// `amrwb_hint` raises the minimum acceptable decoded size from 10 to 20
    /// bytes, since even a single-frame AMR-WB payload cannot be smaller.
    pub fn parse(text: &str, amrwb_hint: bool) -> Result<Self> {
        let value: Value = serde_json::from_str(text).context("media ws frame is not JSON")?;
        let event = value
            .get("event")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        Ok(match event.as_str() {
            "connected" => Self::Connected,
            "start" => {
                let info = value
                    .get("start")
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()
                    .context("start event body")?
                    .unwrap_or(StartInfo {
                        call_control_id: None,
                        media_format: None,
                        track: None,
                    });
                Self::Start(info)
            }
            "media" => Self::Media(parse_media_body(&value, amrwb_hint)),
            "stop" => Self::Stop,
            other => Self::Unknown(other.to_string()),
        })
    }
}

fn parse_media_body(value: &Value, amrwb_hint: bool) -> MediaEventBody {
    let media = value.get("media");
    let track = media
        .and_then(|m| m.get("track"))
        .or_else(|| value.get("track"))
        .and_then(Value::as_str)
        .map(str::to_string);
    let seq = lenient_u64(
        media
            .and_then(|m| m.get("chunk"))
            .or_else(|| value.get("sequence_number")),
    );
    let timestamp_ms = lenient_u64(media.and_then(|m| m.get("timestamp")));

    MediaEventBody {
        track,
        seq,
        timestamp_ms,
        payload: best_payload_candidate(value, amrwb_hint),
    }
}

/// Numbers in these frames show up both as JSON numbers and as strings
fn lenient_u64(value: Option<&Value>) -> Option<u64> {
    match value? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = value;
    for part in path.split('.') {
        cur = cur.get(part)?;
    }
    Some(cur)
}

/// Collect every candidate, decode, and keep the best-scoring one.
pub fn best_payload_candidate(value: &Value, amrwb_hint: bool) -> Option<PayloadCandidate> {
    let min_len = if amrwb_hint { 20 } else { 10 };
    let mut best: Option<(i64, PayloadCandidate)> = None;

    for path in PAYLOAD_PATHS {
        let Some(raw) = lookup(value, path).and_then(Value::as_str) else {
            continue;
        };
        let Ok(bytes) = BASE64.decode(raw.trim()) else {
            continue;
        };
        if bytes.is_empty() {
            continue;
        }
        // Candidates that meet the size floor outrank any that do not,
        // then longer decodes win; path order only breaks exact ties.
        let score = if bytes.len() >= min_len {
            1_000_000 + bytes.len() as i64
        } else {
            bytes.len() as i64
        };
        if best.as_ref().map_or(true, |(s, _)| score > *s) {
            best = Some((
                score,
                PayloadCandidate {
                    path,
                    encoded_len: raw.len(),
                    bytes,
                },
            ));
        }
    }

    best.map(|(_, c)| c)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b64(bytes: &[u8]) -> String {
        BASE64.encode(bytes)
    }

    #[test]
    fn test_parse_connected_and_stop() {
        assert!(matches!(
            MediaWsEvent::parse(r#"{"event":"connected","version":"1.0"}"#, false).unwrap(),
            MediaWsEvent::Connected
        ));
        assert!(matches!(
            MediaWsEvent::parse(r#"{"event":"stop","stop":{}}"#, false).unwrap(),
            MediaWsEvent::Stop
        ));
    }

    #[test]
    fn test_parse_start_event() {
        let text = r#"{"event":"start","start":{"call_control_id":"cc1",
            "media_format":{"encoding":"PCMU","sample_rate":8000,"channels":1},
            "track":"inbound"}}"#;
        let MediaWsEvent::Start(info) = MediaWsEvent::parse(text, false).unwrap() else {
            panic!("expected start");
        };
        assert_eq!(info.call_control_id.as_deref(), Some("cc1"));
        let fmt = info.media_format.unwrap();
        assert_eq!(fmt.encoding, "PCMU");
        assert_eq!(fmt.sample_rate, 8000);
    }

    #[test]
    fn test_media_standard_path() {
        let payload = vec![0x7fu8; 160];
        let text = format!(
            r#"{{"event":"media","media":{{"track":"inbound","chunk":"3","timestamp":"60","payload":"{}"}}}}"#,
            b64(&payload)
        );
        let MediaWsEvent::Media(body) = MediaWsEvent::parse(&text, false).unwrap() else {
            panic!("expected media");
        };
        assert_eq!(body.track.as_deref(), Some("inbound"));
        assert_eq!(body.seq, Some(3));
        assert_eq!(body.timestamp_ms, Some(60));
        let candidate = body.payload.unwrap();
        assert_eq!(candidate.path, "media.payload");
        assert_eq!(candidate.bytes, payload);
    }

    #[test]
    fn test_tiny_documented_payload_loses_to_real_one() {
        // The documented path holds 2 decoded bytes of junk while the real
        // audio sits under "data". First-non-empty picking would take the
        // junk; scoring must not.
        let real = vec![0x11u8; 160];
        let text = format!(
            r#"{{"event":"media","media":{{"payload":"{}"}},"data":"{}"}}"#,
            b64(&[0xde, 0xad]),
            b64(&real)
        );
        let MediaWsEvent::Media(body) = MediaWsEvent::parse(&text, false).unwrap() else {
            panic!("expected media");
        };
        let candidate = body.payload.unwrap();
        assert_eq!(candidate.path, "data");
        assert_eq!(candidate.bytes, real);
    }

    #[test]
    fn test_amrwb_hint_raises_floor() {
        // 12 bytes is fine for PCMU but below the AMR-WB floor; a 24-byte
        // alternative must win under the hint.
        let small = vec![1u8; 12];
        let large = vec![2u8; 24];
        let text = format!(
            r#"{{"event":"media","media":{{"payload":"{}"}},"audio":"{}"}}"#,
            b64(&small),
            b64(&large)
        );
        let MediaWsEvent::Media(body) = MediaWsEvent::parse(&text, true).unwrap() else {
            panic!("expected media");
        };
        assert_eq!(body.payload.unwrap().path, "audio");

        // Without the hint the documented path's 12 bytes qualify and,
        // being shorter, still lose on length. A 12 vs 12 tie keeps
        // the documented path.
        let text = format!(
            r#"{{"event":"media","media":{{"payload":"{}"}},"audio":"{}"}}"#,
            b64(&small),
            b64(&small)
        );
        let MediaWsEvent::Media(body) = MediaWsEvent::parse(&text, false).unwrap() else {
            panic!("expected media");
        };
        assert_eq!(body.payload.unwrap().path, "media.payload");
    }

    #[test]
    fn test_invalid_base64_candidate_skipped() {
        let real = vec![0x33u8; 80];
        let text = format!(
            r#"{{"event":"media","media":{{"payload":"!!!not-base64!!!"}},"data":"{}"}}"#,
            b64(&real)
        );
        let MediaWsEvent::Media(body) = MediaWsEvent::parse(&text, false).unwrap() else {
            panic!("expected media");
        };
        assert_eq!(body.payload.unwrap().path, "data");
    }

    #[test]
    fn test_no_payload_anywhere() {
        let MediaWsEvent::Media(body) =
            MediaWsEvent::parse(r#"{"event":"media","media":{"track":"inbound"}}"#, false).unwrap()
        else {
            panic!("expected media");
        };
        assert!(body.payload.is_none());
    }

    #[test]
    fn test_unknown_event_passes_through() {
        assert!(matches!(
            MediaWsEvent::parse(r#"{"event":"mark"}"#, false).unwrap(),
            MediaWsEvent::Unknown(k) if k == "mark"
        ));
    }
}
