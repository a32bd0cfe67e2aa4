use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shared::crypto::FrameEncryptor;
use shared::error::{Error, Result};

/// Named defaults for stream and transport configuration.
pub mod defaults {
    use std::time::Duration;

    pub const AUDIO_PAYLOAD_TYPE: u8 = 127;
    pub const VIDEO_PAYLOAD_TYPE: u8 = 96;

    pub const AUDIO_TIMEBASE: u32 = 48_000;
    pub const VIDEO_TIMEBASE: u32 = 90_000;
    pub const AUDIO_CHANNELS: u32 = 2;

    pub const MAX_FRAME_RATE: f64 = 30.0;
    pub const AUDIO_FRAME_RATE: f64 = 100.0;

    pub const RTCP_REPORT_INTERVAL: Duration = Duration::from_millis(500);
    pub const TARGET_PLAYOUT_DELAY: Duration = Duration::from_millis(100);

    pub const AUDIO_BITRATE: u32 = 128_000;
    pub const MAX_VIDEO_BITRATE: u32 = 2_000_000;
    pub const MIN_VIDEO_BITRATE: u32 = 300_000;
    pub const START_VIDEO_BITRATE: u32 = MAX_VIDEO_BITRATE;

    /// 1500 bytes of Ethernet MTU minus the IP and UDP headers.
    pub const MAX_PAYLOAD_SIZE: usize = 1500 - 28;

    pub const PACER_TARGET_BURST_SIZE: usize = 10;
    pub const PACER_MAX_BURST_SIZE: usize = 20;
}

/// The longest playout delay a frame header can announce.
pub const MAX_PLAYOUT_DELAY: Duration = Duration::from_millis(u16::MAX as u64);

/// Which of the two elementary streams a sender carries.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    #[serde(rename = "audio")]
    Audio,
    #[serde(rename = "video")]
    Video,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Audio => write!(f, "audio"),
            StreamKind::Video => write!(f, "video"),
        }
    }
}

#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Codec {
    #[default]
    Unspecified,
    #[serde(rename = "opus")]
    Opus,
    #[serde(rename = "pcm16")]
    Pcm16,
    #[serde(rename = "aac")]
    Aac,
    #[serde(rename = "vp8")]
    Vp8,
    #[serde(rename = "h264")]
    H264,
    /// Synthetic frames, for testing.
    #[serde(rename = "fake")]
    Fake,
}

impl Codec {
    pub fn is_audio(self) -> bool {
        matches!(self, Codec::Opus | Codec::Pcm16 | Codec::Aac | Codec::Fake)
    }

    pub fn is_video(self) -> bool {
        matches!(self, Codec::Vp8 | Codec::H264 | Codec::Fake)
    }
}

/// Lifecycle status of one stream, reported through
/// `SenderEvent::StatusChanged`.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum OperationalStatus {
    #[default]
    Uninitialized,
    Initialized,
    InvalidConfiguration,
    UnsupportedCodec,
    InvalidCryptoConfiguration,
}

impl From<&Error> for OperationalStatus {
    fn from(err: &Error) -> Self {
        match err {
            Error::ErrUnsupportedCodec => OperationalStatus::UnsupportedCodec,
            Error::ErrInvalidCryptoConfig => OperationalStatus::InvalidCryptoConfiguration,
            _ => OperationalStatus::InvalidConfiguration,
        }
    }
}

/// Per-stream sender configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSenderConfig {
    pub sender_ssrc: u32,
    pub receiver_ssrc: u32,
    pub rtp_payload_type: u8,
    /// RTP clock rate in Hz.
    pub rtp_timebase: u32,
    pub channels: u32,
    pub codec: Codec,

    pub min_playout_delay: Duration,
    pub max_playout_delay: Duration,

    /// Bitrate bounds in bits per second.
    pub min_bitrate: u32,
    pub max_bitrate: u32,
    pub start_bitrate: u32,
    pub max_frame_rate: f64,

    /// Selects fixed-rate congestion control for encoders that cannot follow
    /// frequent bitrate changes.
    pub use_external_encoder: bool,

    /// Either both empty, or a 16 byte AES key and a 16 byte IV mask.
    pub aes_key: Vec<u8>,
    pub aes_iv_mask: Vec<u8>,

    pub max_unacked_frames: usize,
    pub max_payload_size: usize,
}

impl FrameSenderConfig {
    pub fn audio() -> Self {
        FrameSenderConfig {
            sender_ssrc: 1,
            receiver_ssrc: 2,
            rtp_payload_type: defaults::AUDIO_PAYLOAD_TYPE,
            rtp_timebase: defaults::AUDIO_TIMEBASE,
            channels: defaults::AUDIO_CHANNELS,
            codec: Codec::Opus,
            min_playout_delay: defaults::TARGET_PLAYOUT_DELAY,
            max_playout_delay: defaults::TARGET_PLAYOUT_DELAY,
            min_bitrate: defaults::AUDIO_BITRATE,
            max_bitrate: defaults::AUDIO_BITRATE,
            start_bitrate: defaults::AUDIO_BITRATE,
            max_frame_rate: defaults::AUDIO_FRAME_RATE,
            use_external_encoder: false,
            aes_key: vec![],
            aes_iv_mask: vec![],
            max_unacked_frames: rtp::packet_storage::MAX_UNACKED_FRAMES,
            max_payload_size: defaults::MAX_PAYLOAD_SIZE,
        }
    }

    pub fn video() -> Self {
        FrameSenderConfig {
            sender_ssrc: 11,
            receiver_ssrc: 12,
            rtp_payload_type: defaults::VIDEO_PAYLOAD_TYPE,
            rtp_timebase: defaults::VIDEO_TIMEBASE,
            channels: 1,
            codec: Codec::Vp8,
            min_bitrate: defaults::MIN_VIDEO_BITRATE,
            max_bitrate: defaults::MAX_VIDEO_BITRATE,
            start_bitrate: defaults::START_VIDEO_BITRATE,
            max_frame_rate: defaults::MAX_FRAME_RATE,
            ..FrameSenderConfig::audio()
        }
    }

    /// Checks the configuration for a stream of `kind`.
    pub fn validate(&self, kind: StreamKind) -> Result<()> {
        let codec_ok = match kind {
            StreamKind::Audio => self.codec.is_audio(),
            StreamKind::Video => self.codec.is_video(),
        };
        if !codec_ok {
            return Err(Error::ErrUnsupportedCodec);
        }

        FrameEncryptor::from_config(&self.aes_key, &self.aes_iv_mask)?;

        if self.min_bitrate == 0
            || self.min_bitrate > self.start_bitrate
            || self.start_bitrate > self.max_bitrate
        {
            return Err(Error::ErrInvalidBitrateBounds {
                min: self.min_bitrate,
                start: self.start_bitrate,
                max: self.max_bitrate,
            });
        }

        // The delay travels as 16-bit milliseconds in the RTP extension.
        if self.min_playout_delay.is_zero()
            || self.min_playout_delay > self.max_playout_delay
            || self.max_playout_delay > MAX_PLAYOUT_DELAY
        {
            return Err(Error::ErrInvalidPlayoutDelay);
        }

        if !(self.max_frame_rate.is_finite() && self.max_frame_rate > 0.0) {
            return Err(Error::ErrInvalidFrameRate);
        }

        if self.rtp_timebase == 0 || self.max_unacked_frames == 0 || self.max_payload_size == 0 {
            return Err(Error::Other(format!(
                "invalid {kind} stream parameters: timebase {}, max unacked frames {}, max payload {}",
                self.rtp_timebase, self.max_unacked_frames, self.max_payload_size
            )));
        }

        if self.max_unacked_frames > rtp::packet_storage::MAX_UNACKED_FRAMES {
            return Err(Error::ErrTooManyUnackedFrames {
                max: rtp::packet_storage::MAX_UNACKED_FRAMES,
            });
        }

        Ok(())
    }
}

/// Transport-wide options.
///
/// The pacer options are applied by the sender. The socket options are kept
/// for the I/O layer that owns the socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportOptions {
    pub pacer_target_burst_size: usize,
    pub pacer_max_burst_size: usize,
    pub send_buffer_min_size: Option<usize>,
    #[serde(rename = "DSCP", alias = "dscp")]
    pub dscp: bool,
    pub non_blocking_io: bool,
    pub disable_wifi_scan: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        TransportOptions {
            pacer_target_burst_size: defaults::PACER_TARGET_BURST_SIZE,
            pacer_max_burst_size: defaults::PACER_MAX_BURST_SIZE,
            send_buffer_min_size: None,
            dscp: false,
            non_blocking_io: false,
            disable_wifi_scan: false,
        }
    }
}

impl TransportOptions {
    pub fn from_json(json: &str) -> Result<Self> {
        let options: TransportOptions =
            serde_json::from_str(json).map_err(|e| Error::ErrConfigParse(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        TransportOptions::from_json(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pacer_target_burst_size == 0
            || self.pacer_target_burst_size > self.pacer_max_burst_size
        {
            return Err(Error::ErrConfigParse(format!(
                "pacer burst sizes must satisfy 0 < target ({}) <= max ({})",
                self.pacer_target_burst_size, self.pacer_max_burst_size
            )));
        }
        Ok(())
    }
}
