//! Media ingest: carrier WebSocket messages in, canonical PCM frames out
//!
//! Per message: envelope decode → track filter → payload candidate scoring →
//! codec decode → resample to the target rate → re-frame to fixed windows.
//! Decode outcomes feed the health monitor; per-kind errors are logged once
//! per call so a bad stream cannot flood the logs.

use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use super::codec::{Codec, StreamDecoder};
use super::event::{MediaEventBody, MediaWsEvent, StartInfo};
use super::health::{HealthAction, HealthMonitor, UnhealthyReason};
use super::resample::{LinearResampler, Reframer};
use crate::amrwb::{self, storage::AwbDumpWriter};
use crate::types::{PcmFrame, StreamTrack, TransportMode};

/// Static ingest settings for one call
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub track_filter: StreamTrack,
    pub target_sample_rate: u32,
    pub chunk_ms: u64,
    pub transport: TransportMode,
    pub accept_codecs: HashSet<String>,
    pub amrwb_decode: bool,
    pub g722_decode: bool,
    pub opus_decode: bool,
    pub max_restart_attempts: u32,
    pub amrwb_dump_dir: Option<PathBuf>,
}

/// What one WebSocket message produced
#[derive(Debug)]
pub enum IngestEvent {
    Connected,
    /// Start event accepted; the stream's codec is now known
    Started { codec: Option<Codec>, sample_rate: u32 },
    Frames(Vec<PcmFrame>),
    Stopped,
    /// Filtered, unparseable, or payload-free messages
    Nothing,
}

/// Per-call media ingest state machine
pub struct MediaIngest {
    config: IngestConfig,
    call_id: String,
    decoder: Option<StreamDecoder>,
    /// Set when the start event announced a codec this build cannot decode
    unsupported_codec: Option<String>,
    resampler: Option<LinearResampler>,
    reframer: Reframer,
    health: HealthMonitor,
    skipped_inbound: u64,
    skipped_outbound: u64,
    logged_error_kinds: HashSet<String>,
    awb_dump: Option<AwbDumpWriter>,
}

impl MediaIngest {
    pub fn new(call_id: impl Into<String>, config: IngestConfig) -> Self {
        let reframer = Reframer::new(config.target_sample_rate, config.chunk_ms);
        let health = HealthMonitor::new(config.transport, config.max_restart_attempts);
        let awb_dump = config
            .amrwb_dump_dir
            .as_ref()
            .map(|dir| AwbDumpWriter::new(dir.clone()));
        Self {
            config,
            call_id: call_id.into(),
            decoder: None,
            unsupported_codec: None,
            resampler: None,
            reframer,
            health,
            skipped_inbound: 0,
            skipped_outbound: 0,
            logged_error_kinds: HashSet::new(),
            awb_dump,
        }
    }

    /// Process one text message from the media WebSocket
    pub fn handle_message(&mut self, text: &str, now_ms: u64) -> IngestEvent {
        let amrwb_hint = self
            .decoder
            .as_ref()
            .map(|d| d.codec() == Codec::AmrWb)
            .unwrap_or(false);

        let event = match MediaWsEvent::parse(text, amrwb_hint) {
            Ok(event) => event,
            Err(e) => {
                self.log_once("bad_ws_json", &format!("unparseable media ws frame: {e:#}"));
                return IngestEvent::Nothing;
            }
        };

        match event {
            MediaWsEvent::Connected => IngestEvent::Connected,
            MediaWsEvent::Start(info) => self.handle_start(info),
            MediaWsEvent::Media(body) => self.handle_media(body, now_ms),
            MediaWsEvent::Stop => IngestEvent::Stopped,
            MediaWsEvent::Unknown(kind) => {
                debug!(call_id = %self.call_id, kind, "ignoring unknown media ws event");
                IngestEvent::Nothing
            }
        }
    }

    fn handle_start(&mut self, info: StartInfo) -> IngestEvent {
        let (encoding, sample_rate) = info
            .media_format
            .as_ref()
            .map(|f| (f.encoding.clone(), f.sample_rate))
            .unwrap_or_else(|| ("PCMU".to_string(), 8_000));
        let sample_rate = if sample_rate == 0 { 8_000 } else { sample_rate };

        let codec = Codec::parse(&encoding).filter(|c| self.codec_enabled(*c));
        match codec {
            Some(codec) => {
                info!(
                    call_id = %self.call_id,
                    codec = codec.wire_name(),
                    sample_rate,
                    "media stream started"
                );
                self.unsupported_codec = None;
                self.decoder = Some(StreamDecoder::new(codec, sample_rate));
            }
            None => {
                warn!(
                    call_id = %self.call_id,
                    encoding,
                    "media stream announced an unsupported codec"
                );
                self.unsupported_codec = Some(encoding);
                self.decoder = None;
            }
        }
        self.resampler = None;
        self.reframer.reset();

        IngestEvent::Started {
            codec,
            sample_rate,
        }
    }

    fn handle_media(&mut self, body: MediaEventBody, now_ms: u64) -> IngestEvent {
        // Track filter before anything else
        if let Some(track) = body.track.as_deref() {
            if !self.config.track_filter.accepts(track) {
                match track {
                    "inbound" => self.skipped_inbound += 1,
                    _ => self.skipped_outbound += 1,
                }
                return IngestEvent::Nothing;
            }
        }

        if self.unsupported_codec.is_some() {
            // Keep feeding the health monitor so the restart path engages
            self.health.record_decode_failure(now_ms);
            return IngestEvent::Nothing;
        }

        let Some(candidate) = body.payload else {
            self.log_once("missing_payload", "media event carried no usable payload");
            self.health.record_decode_failure(now_ms);
            return IngestEvent::Nothing;
        };
        if candidate.path != "media.payload" {
            self.log_once(
                "fallback_payload_path",
                &format!(
                    "media payload found under fallback path {} (encoded_len={} decoded_len={})",
                    candidate.path,
                    candidate.encoded_len,
                    candidate.bytes.len()
                ),
            );
        }

        // Media before start: assume PCMU at 8 kHz, the carrier default
        if self.decoder.is_none() {
            self.decoder = Some(StreamDecoder::new(Codec::Pcmu, 8_000));
        }
        let codec = self.decoder.as_ref().expect("decoder set").codec();
        let tiny_floor = codec.min_expected_payload();
        if codec == Codec::AmrWb {
            self.maybe_dump_awb(&candidate.bytes);
        }

        let decoded = match self
            .decoder
            .as_mut()
            .expect("decoder set")
            .decode(&candidate.bytes)
        {
            Ok(decoded) => decoded,
            Err(e) => {
                let kind = format!("decode_{}", codec.wire_name());
                self.log_once(
                    &kind,
                    &format!(
                        "decode failed (payload_len={} decoded_len=0): {e:#}",
                        candidate.bytes.len()
                    ),
                );
                self.health.record_decode_failure(now_ms);
                return IngestEvent::Nothing;
            }
        };

        let rms = crate::audio::rms(&decoded.pcm16);
        self.health
            .record_frame(now_ms, candidate.bytes.len(), rms, tiny_floor);

        // Resample lazily: the decoded rate is only known after first decode
        let resampler = match self.resampler.as_mut() {
            Some(r) if r.src_rate() == decoded.sample_rate_hz => r,
            _ => {
                self.resampler = Some(LinearResampler::new(
                    decoded.sample_rate_hz,
                    self.config.target_sample_rate,
                ));
                self.resampler.as_mut().expect("just set")
            }
        };
        let resampled = resampler.resample(&decoded.pcm16);
        let frames = self.reframer.push(&resampled, body.seq);

        if frames.is_empty() {
            IngestEvent::Nothing
        } else {
            IngestEvent::Frames(frames)
        }
    }

    fn codec_enabled(&self, codec: Codec) -> bool {
        if !self.config.accept_codecs.is_empty()
            && !self.config.accept_codecs.contains(codec.wire_name())
        {
            return false;
        }
        match codec {
            Codec::AmrWb => self.config.amrwb_decode,
            Codec::G722 => self.config.g722_decode,
            Codec::Opus => self.config.opus_decode && cfg!(feature = "opus"),
            _ => true,
        }
    }

    fn maybe_dump_awb(&mut self, payload: &[u8]) {
        let is_amrwb = self
            .decoder
            .as_ref()
            .map(|d| d.codec() == Codec::AmrWb)
            .unwrap_or(false);
        if !is_amrwb {
            return;
        }
        if let Some(dump) = self.awb_dump.as_mut() {
            let result = amrwb::transcode(payload);
            if result.ok {
                if let Err(e) = dump.maybe_dump(&self.call_id, &result.frames) {
                    warn!(call_id = %self.call_id, error = %e, "awb dump failed");
                }
            }
        }
    }

    /// One log line per error kind per call
    fn log_once(&mut self, kind: &str, message: &str) {
        if self.logged_error_kinds.insert(kind.to_string()) {
            warn!(call_id = %self.call_id, kind, "{message}");
        }
    }

    /// Poll the health monitor for a pending action
    pub fn health_action(&mut self) -> Option<(UnhealthyReason, HealthAction)> {
        self.health.check()
    }

    /// The carrier accepted a restart; the next stream will be PCMU
    pub fn on_stream_restarted(&mut self) {
        self.decoder = None;
        self.unsupported_codec = None;
        self.resampler = None;
        self.reframer.reset();
        self.health.on_stream_restarted();
    }

    /// (skipped_inbound, skipped_outbound) counters for the timing summary
    pub fn skip_counts(&self) -> (u64, u64) {
        (self.skipped_inbound, self.skipped_outbound)
    }

    pub fn restarts_issued(&self) -> u32 {
        self.health.restarts_issued()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

    fn config() -> IngestConfig {
        IngestConfig {
            track_filter: StreamTrack::InboundTrack,
            target_sample_rate: 16_000,
            chunk_ms: 20,
            transport: TransportMode::Pstn,
            accept_codecs: HashSet::new(),
            amrwb_decode: true,
            g722_decode: true,
            opus_decode: true,
            max_restart_attempts: 1,
            amrwb_dump_dir: None,
        }
    }

    fn start_msg(encoding: &str, rate: u32) -> String {
        format!(
            r#"{{"event":"start","start":{{"call_control_id":"cc1",
                "media_format":{{"encoding":"{encoding}","sample_rate":{rate},"channels":1}},
                "track":"inbound"}}}}"#
        )
    }

    fn media_msg(track: &str, payload: &[u8]) -> String {
        format!(
            r#"{{"event":"media","media":{{"track":"{track}","payload":"{}"}}}}"#,
            BASE64.encode(payload)
        )
    }

    #[test]
    fn test_pcmu_stream_produces_20ms_frames() {
        let mut ingest = MediaIngest::new("cc1", config());
        assert!(matches!(
            ingest.handle_message(&start_msg("PCMU", 8000), 0),
            IngestEvent::Started { codec: Some(Codec::Pcmu), sample_rate: 8000 }
        ));

        // 160 µ-law bytes = 20 ms at 8 kHz = one 320-sample frame at 16 kHz
        let mut produced = 0usize;
        for i in 0..10u64 {
            if let IngestEvent::Frames(frames) =
                ingest.handle_message(&media_msg("inbound", &[0x23; 160]), i * 20)
            {
                for f in &frames {
                    assert_eq!(f.sample_rate_hz, 16_000);
                    assert_eq!(f.pcm16.len(), 320);
                }
                produced += frames.len();
            }
        }
        // Resampler warm-up costs at most one frame
        assert!(produced >= 9, "produced {produced}");
    }

    #[test]
    fn test_outbound_track_is_filtered() {
        let mut ingest = MediaIngest::new("cc1", config());
        ingest.handle_message(&start_msg("PCMU", 8000), 0);
        assert!(matches!(
            ingest.handle_message(&media_msg("outbound", &[0x23; 160]), 0),
            IngestEvent::Nothing
        ));
        assert_eq!(ingest.skip_counts(), (0, 1));
    }

    #[test]
    fn test_unsupported_codec_drives_restart() {
        let mut cfg = config();
        cfg.amrwb_decode = false;
        let mut ingest = MediaIngest::new("cc1", cfg);

        assert!(matches!(
            ingest.handle_message(&start_msg("AMR-WB", 16000), 0),
            IngestEvent::Started { codec: None, .. }
        ));
        for i in 0..12u64 {
            ingest.handle_message(&media_msg("inbound", &[0x44; 40]), i * 20);
        }
        let (_, action) = ingest.health_action().unwrap();
        assert_eq!(action, HealthAction::RestartPcmu);
    }

    #[test]
    fn test_media_before_start_assumes_pcmu() {
        let mut ingest = MediaIngest::new("cc1", config());
        // No start event; a full second of media must still decode
        let mut got_frames = false;
        for i in 0..50u64 {
            if let IngestEvent::Frames(_) =
                ingest.handle_message(&media_msg("inbound", &[0x23; 160]), i * 20)
            {
                got_frames = true;
            }
        }
        assert!(got_frames);
    }

    #[test]
    fn test_restart_resets_stream_state() {
        let mut ingest = MediaIngest::new("cc1", config());
        ingest.handle_message(&start_msg("AMR-WB", 16000), 0);
        // Garbage AMR-WB payloads pile up decode failures
        for i in 0..12u64 {
            ingest.handle_message(&media_msg("inbound", &[0xf1, 0x6e, 0x00, 0x00, 0x99]), i * 20);
        }
        assert!(ingest.health_action().is_some());
        ingest.on_stream_restarted();
        assert_eq!(ingest.restarts_issued(), 1);

        // New PCMU stream decodes cleanly
        ingest.handle_message(&start_msg("PCMU", 8000), 2_000);
        assert!(matches!(
            ingest.handle_message(&media_msg("inbound", &[0x23; 320]), 2_020),
            IngestEvent::Frames(_)
        ));
    }

    #[test]
    fn test_g722_stream_decodes_at_16k() {
        let mut ingest = MediaIngest::new("cc1", config());
        ingest.handle_message(&start_msg("G722", 8000), 0);
        // 160 G.722 octets = 320 samples at 16 kHz = one full frame
        let mut produced = 0usize;
        for i in 0..5u64 {
            if let IngestEvent::Frames(frames) =
                ingest.handle_message(&media_msg("inbound", &[0x5a; 160]), i * 20)
            {
                produced += frames.len();
            }
        }
        assert!(produced >= 4, "produced {produced}");
    }
}
