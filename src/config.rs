//! Runtime configuration
//!
//! All settings come from the environment. `Config::from_env()` collects
//! parse failures instead of stopping at the first one so startup can log
//! every bad key before exiting.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

use crate::types::StreamTrack;

/// Top-level configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub telnyx: TelnyxConfig,
    pub providers: ProviderConfig,
    pub stt: SttConfig,
    pub capacity: CapacityConfig,
    pub audio: AudioConfig,
}

/// HTTP server settings
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to bind (PORT)
    pub port: u16,
    /// Externally reachable base URL used to build stream/webhook URLs
    pub public_base_url: String,
    /// Shared secret the media WebSocket upgrade must present exactly
    pub media_stream_token: String,
}

/// Carrier (Telnyx-style) settings
#[derive(Debug, Clone)]
pub struct TelnyxConfig {
    /// Bearer token for call-control actions
    pub api_key: String,
    /// Ed25519 public key for webhook verification (PEM/DER/base64/hex)
    pub public_key: Option<String>,
    /// Shared secret for HMAC-SHA256 webhook verification
    pub webhook_secret: Option<String>,
    /// Explicitly skip webhook signature verification (dev only)
    pub skip_signature: bool,
    /// Track selector requested at streaming_start
    pub stream_track: StreamTrack,
    /// Codec requested at streaming_start / answer
    pub stream_codec: String,
    /// Canonical PCM rate frames are resampled to
    pub target_sample_rate: u32,
    /// Codecs the ingest will attempt to decode
    pub accept_codecs: HashSet<String>,
    pub amrwb_decode: bool,
    pub g722_decode: bool,
    pub opus_decode: bool,
    /// Optional directory for `.awb` debug artifacts
    pub amrwb_dump_dir: Option<PathBuf>,
}

/// External provider endpoints
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Whisper-style HTTP STT endpoint
    pub whisper_url: String,
    /// Kokoro-style HTTP TTS endpoint
    pub kokoro_url: String,
    /// Dialog brain base URL (`/reply`, `/reply/stream`)
    pub brain_url: String,
    /// Reprompt after this much dead air, milliseconds
    pub dead_air_ms: u64,
}

/// Speech-endpointing knobs (the `STT_*` family)
#[derive(Debug, Clone)]
pub struct SttConfig {
    /// Ingest frame size in ms (re-framing window)
    pub chunk_ms: u64,
    /// Consecutive silence frames required to leave speech
    pub silence_ms: u64,
    /// Trailing silence that finalizes an utterance
    pub silence_end_ms: u64,
    /// Pre-roll retained ahead of speech start (clamped to 800)
    pub pre_roll_ms: u64,
    /// Minimum speech before a partial is worth sending
    pub min_utterance_ms: u64,
    /// Hard cap on a single utterance
    pub max_utterance_ms: u64,
    /// Energy gate floors (canonical names)
    pub rms_floor: f32,
    pub peak_floor: f32,
    /// Consecutive speech frames required to arm an utterance
    pub speech_frames_required: u32,
    /// Minimum gap between partial transcribes
    pub partial_interval_ms: u64,
    /// Minimum utterance length before partials start
    pub partial_min_ms: u64,
    /// Disable energy/VAD gating entirely (test rigs)
    pub disable_gates: bool,
    /// Quiet window after playback ends before STT re-arms
    pub post_playback_grace_ms: u64,
    /// Force a finalize if speech was seen but no final arrived
    pub late_final_watchdog_ms: u64,
    /// Use Silero VAD when the build carries it
    pub vad_enabled: bool,
    pub vad_threshold: f32,
    /// Replay-guard (frame de-dup) switch and window
    pub rx_postprocess_enabled: bool,
    pub rx_dedupe_window: usize,
    /// Silence trimmed down to this cushion past the last speech frame
    pub trailing_silence_cushion_ms: u64,
}

/// Capacity admission and K/V store settings
#[derive(Debug, Clone)]
pub struct CapacityConfig {
    pub redis_url: String,
    pub global_concurrency_cap: u32,
    pub tenant_concurrency_cap_default: u32,
    pub tenant_calls_per_min_cap_default: u32,
    pub capacity_ttl_seconds: u64,
    pub tenantmap_prefix: String,
    pub tenantcfg_prefix: String,
    pub cap_prefix: String,
}

/// Synthesized-audio staging
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Base URL the carrier fetches playback files from
    pub public_base_url: String,
    /// Local directory those files are written to
    pub storage_dir: PathBuf,
}

/// Per-tenant cap overrides stored in the K/V tenant config JSON
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TenantCaps {
    #[serde(default)]
    pub max_concurrent_calls_tenant: Option<u32>,
    #[serde(default)]
    pub max_calls_per_minute_tenant: Option<u32>,
    #[serde(default)]
    pub max_concurrent_calls_global: Option<u32>,
}

/// Tenant configuration JSON stored under `{TENANTCFG_PREFIX}:{tid}`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TenantConfig {
    #[serde(default)]
    pub caps: TenantCaps,
    #[serde(default)]
    pub stt_language: Option<String>,
    #[serde(default)]
    pub tts_voice: Option<String>,
    #[serde(default)]
    pub greeting: Option<String>,
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T, errors: &mut Vec<String>) -> T {
    match env_str(key) {
        None => default,
        Some(raw) => match raw.parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                errors.push(format!("{key}: cannot parse {raw:?}"));
                default
            }
        },
    }
}

fn env_bool(key: &str, default: bool, errors: &mut Vec<String>) -> bool {
    match env_str(key) {
        None => default,
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => {
                errors.push(format!("{key}: cannot parse {raw:?} as bool"));
                default
            }
        },
    }
}

impl Config {
    /// Build the configuration from the process environment.
    ///
    /// Returns Err with one line per failing key; the caller logs them all
    /// and exits non-zero.
    pub fn from_env() -> Result<Self> {
        let mut errors = Vec::new();

        let stream_track_raw =
            env_str("TELNYX_STREAM_TRACK").unwrap_or_else(|| "inbound_track".to_string());
        let stream_track = match StreamTrack::parse(&stream_track_raw) {
            Some(t) => t,
            None => {
                errors.push(format!("TELNYX_STREAM_TRACK: unknown track {stream_track_raw:?}"));
                StreamTrack::InboundTrack
            }
        };

        let accept_codecs: HashSet<String> = env_str("TELNYX_ACCEPT_CODECS")
            .unwrap_or_else(|| "PCMU,PCMA,L16,G722,OPUS,AMR-WB".to_string())
            .split(',')
            .map(|c| c.trim().to_ascii_uppercase())
            .filter(|c| !c.is_empty())
            .collect();

        let server = ServerConfig {
            port: env_parse("PORT", 8080u16, &mut errors),
            public_base_url: env_str("PUBLIC_BASE_URL").unwrap_or_default(),
            media_stream_token: env_str("MEDIA_STREAM_TOKEN").unwrap_or_default(),
        };

        let telnyx = TelnyxConfig {
            api_key: env_str("TELNYX_API_KEY").unwrap_or_default(),
            public_key: env_str("TELNYX_PUBLIC_KEY"),
            webhook_secret: env_str("TELNYX_WEBHOOK_SECRET"),
            skip_signature: env_bool("TELNYX_SKIP_SIGNATURE", false, &mut errors),
            stream_track,
            stream_codec: env_str("TELNYX_STREAM_CODEC").unwrap_or_else(|| "PCMU".to_string()),
            target_sample_rate: env_parse("TELNYX_TARGET_SAMPLE_RATE", 16_000u32, &mut errors),
            accept_codecs,
            amrwb_decode: env_bool("TELNYX_AMRWB_DECODE", true, &mut errors),
            g722_decode: env_bool("TELNYX_G722_DECODE", true, &mut errors),
            opus_decode: env_bool("TELNYX_OPUS_DECODE", true, &mut errors),
            amrwb_dump_dir: env_str("AMRWB_DUMP_DIR").map(PathBuf::from),
        };

        let providers = ProviderConfig {
            whisper_url: env_str("WHISPER_URL").unwrap_or_default(),
            kokoro_url: env_str("KOKORO_URL").unwrap_or_default(),
            brain_url: env_str("BRAIN_URL").unwrap_or_default(),
            dead_air_ms: env_parse("DEAD_AIR_MS", 12_000u64, &mut errors),
        };

        let stt = SttConfig {
            chunk_ms: env_parse("STT_CHUNK_MS", 20u64, &mut errors),
            silence_ms: env_parse("STT_SILENCE_MS", 300u64, &mut errors),
            silence_end_ms: env_parse("STT_SILENCE_END_MS", 900u64, &mut errors),
            pre_roll_ms: env_parse("STT_PRE_ROLL_MS", 300u64, &mut errors).min(800),
            min_utterance_ms: env_parse("STT_MIN_UTTERANCE_MS", 250u64, &mut errors),
            max_utterance_ms: env_parse("STT_MAX_UTTERANCE_MS", 6_000u64, &mut errors),
            rms_floor: env_parse("STT_RMS_FLOOR", 0.012f32, &mut errors),
            peak_floor: env_parse("STT_PEAK_FLOOR", 0.035f32, &mut errors),
            speech_frames_required: env_parse("STT_SPEECH_FRAMES_REQUIRED", 3u32, &mut errors),
            partial_interval_ms: env_parse("STT_PARTIAL_INTERVAL_MS", 250u64, &mut errors),
            partial_min_ms: env_parse("STT_PARTIAL_MIN_MS", 350u64, &mut errors),
            disable_gates: env_bool("STT_DISABLE_GATES", false, &mut errors),
            post_playback_grace_ms: env_parse("STT_POST_PLAYBACK_GRACE_MS", 650u64, &mut errors),
            late_final_watchdog_ms: env_parse("STT_LATE_FINAL_WATCHDOG_MS", 8_000u64, &mut errors),
            vad_enabled: env_bool("STT_VAD_ENABLED", true, &mut errors),
            vad_threshold: env_parse("STT_VAD_THRESHOLD", 0.5f32, &mut errors),
            rx_postprocess_enabled: env_bool("STT_RX_POSTPROCESS_ENABLED", true, &mut errors),
            rx_dedupe_window: env_parse("STT_RX_DEDUPE_WINDOW", 32usize, &mut errors),
            trailing_silence_cushion_ms: env_parse("STT_TRAILING_CUSHION_MS", 120u64, &mut errors),
        };

        let capacity = CapacityConfig {
            redis_url: env_str("REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1:6379".to_string()),
            global_concurrency_cap: env_parse("GLOBAL_CONCURRENCY_CAP", 50u32, &mut errors),
            tenant_concurrency_cap_default: env_parse(
                "TENANT_CONCURRENCY_CAP_DEFAULT",
                5u32,
                &mut errors,
            ),
            tenant_calls_per_min_cap_default: env_parse(
                "TENANT_CALLS_PER_MIN_CAP_DEFAULT",
                30u32,
                &mut errors,
            ),
            capacity_ttl_seconds: env_parse("CAPACITY_TTL_SECONDS", 7_200u64, &mut errors),
            tenantmap_prefix: env_str("TENANTMAP_PREFIX").unwrap_or_else(|| "vx:map".to_string()),
            tenantcfg_prefix: env_str("TENANTCFG_PREFIX").unwrap_or_else(|| "vx:cfg".to_string()),
            cap_prefix: env_str("CAP_PREFIX").unwrap_or_else(|| "vx:cap".to_string()),
        };

        let audio = AudioConfig {
            public_base_url: env_str("AUDIO_PUBLIC_BASE_URL")
                .or_else(|| env_str("PUBLIC_BASE_URL").map(|b| format!("{b}/audio")))
                .unwrap_or_default(),
            storage_dir: env_str("AUDIO_STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/tmp/voxline-audio")),
        };

        if !errors.is_empty() {
            bail!("invalid configuration:\n  {}", errors.join("\n  "));
        }

        Ok(Self {
            server,
            telnyx,
            providers,
            stt,
            capacity,
            audio,
        })
    }

    /// Check required keys. Returns one message per missing/invalid setting.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.telnyx.api_key.is_empty() {
            problems.push("TELNYX_API_KEY is required".to_string());
        }
        if self.server.media_stream_token.is_empty() {
            problems.push("MEDIA_STREAM_TOKEN is required".to_string());
        }
        if self.server.public_base_url.is_empty() {
            problems.push("PUBLIC_BASE_URL is required".to_string());
        }
        if !self.telnyx.skip_signature
            && self.telnyx.public_key.is_none()
            && self.telnyx.webhook_secret.is_none()
        {
            problems.push(
                "TELNYX_PUBLIC_KEY or TELNYX_WEBHOOK_SECRET is required unless \
                 TELNYX_SKIP_SIGNATURE=true"
                    .to_string(),
            );
        }
        for (key, value) in [
            ("WHISPER_URL", &self.providers.whisper_url),
            ("KOKORO_URL", &self.providers.kokoro_url),
            ("BRAIN_URL", &self.providers.brain_url),
        ] {
            if value.is_empty() {
                problems.push(format!("{key} is required"));
            }
        }
        if self.telnyx.target_sample_rate < 8_000 || self.telnyx.target_sample_rate > 48_000 {
            problems.push(format!(
                "TELNYX_TARGET_SAMPLE_RATE out of range: {}",
                self.telnyx.target_sample_rate
            ));
        }
        if self.stt.chunk_ms == 0 || self.stt.chunk_ms > 200 {
            problems.push(format!("STT_CHUNK_MS out of range: {}", self.stt.chunk_ms));
        }

        problems
    }

    /// Resolved settings for `voxline check`, secrets masked.
    pub fn describe(&self) -> String {
        let mask = |s: &str| {
            if s.is_empty() {
                "(unset)".to_string()
            } else {
                format!("{}…({} chars)", &s[..s.len().min(4)], s.len())
            }
        };
        format!(
            "port={} public_base_url={} media_stream_token={} api_key={} \
             stream_track={} stream_codec={} target_rate={} whisper={} kokoro={} brain={} \
             redis={} global_cap={} tenant_cap={} rpm_cap={}",
            self.server.port,
            self.server.public_base_url,
            mask(&self.server.media_stream_token),
            mask(&self.telnyx.api_key),
            self.telnyx.stream_track.wire_name(),
            self.telnyx.stream_codec,
            self.telnyx.target_sample_rate,
            self.providers.whisper_url,
            self.providers.kokoro_url,
            self.providers.brain_url,
            self.capacity.redis_url,
            self.capacity.global_concurrency_cap,
            self.capacity.tenant_concurrency_cap_default,
            self.capacity.tenant_calls_per_min_cap_default,
        )
    }
}
