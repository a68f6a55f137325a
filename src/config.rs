//! Stream, video and audio configuration
//!
//! Everything here is a plain value type. The persisted [`Preferences`]
//! record bundles them and is owned by the config store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::*;
use crate::error::ConfigError;

/// Supported transport protocols
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StreamProtocol {
    /// RTMP publish to a media server
    #[default]
    Rtmp,
    /// Raw TCP socket ingest (e.g. streaming software listening on a port)
    Tcp,
    /// WebSocket based ingest
    WebSocket,
}

impl StreamProtocol {
    pub const ALL: [StreamProtocol; 3] = [
        StreamProtocol::Rtmp,
        StreamProtocol::Tcp,
        StreamProtocol::WebSocket,
    ];

    pub fn default_port(&self) -> u16 {
        match self {
            StreamProtocol::Rtmp => 1935,
            StreamProtocol::Tcp => 9000,
            StreamProtocol::WebSocket => 80,
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            StreamProtocol::Rtmp => "rtmp",
            StreamProtocol::Tcp => "tcp",
            StreamProtocol::WebSocket => "ws",
        }
    }
}

impl fmt::Display for StreamProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

impl std::str::FromStr for StreamProtocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rtmp" => Ok(StreamProtocol::Rtmp),
            "tcp" => Ok(StreamProtocol::Tcp),
            "ws" | "websocket" => Ok(StreamProtocol::WebSocket),
            _ => Err(ConfigError::UnknownProtocol(s.to_string())),
        }
    }
}

/// Protocol plus destination host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportTarget {
    pub protocol: StreamProtocol,
    pub host: String,
}

impl TransportTarget {
    pub fn new(protocol: StreamProtocol, host: impl Into<String>) -> Result<Self, ConfigError> {
        let host = host.into().trim().to_string();
        if host.is_empty() || host.contains(char::is_whitespace) || host.contains('/') {
            return Err(ConfigError::InvalidHost(host));
        }
        Ok(Self { protocol, host })
    }

    /// `host:port`, filling in the protocol default port when the host has none.
    pub fn authority(&self) -> String {
        if has_port(&self.host) {
            self.host.clone()
        } else if self.host.contains(':') {
            // bare IPv6 literal
            format!("[{}]:{}", self.host.trim_matches(|c| c == '[' || c == ']'), self.protocol.default_port())
        } else {
            format!("{}:{}", self.host, self.protocol.default_port())
        }
    }

    pub fn url(&self) -> String {
        format!("{}://{}", self.protocol.scheme(), self.authority())
    }
}

impl fmt::Display for TransportTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

fn has_port(host: &str) -> bool {
    if let Some(rest) = host.strip_prefix('[') {
        // [v6]:port
        return rest
            .split_once("]:")
            .is_some_and(|(_, port)| port.parse::<u16>().is_ok());
    }
    match host.rsplit_once(':') {
        Some((name, port)) => !name.contains(':') && port.parse::<u16>().is_ok(),
        None => false,
    }
}

/// Pixel layouts accepted by the video encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// Planar Y, U, V
    #[default]
    Yuv420p,
    /// Y plane plus interleaved UV
    Nv12,
    /// Y plane plus interleaved VU
    Nv21,
    /// Single packed RGBA plane
    Rgba,
}

impl PixelFormat {
    pub fn plane_count(&self) -> usize {
        match self {
            PixelFormat::Yuv420p => 3,
            PixelFormat::Nv12 | PixelFormat::Nv21 => 2,
            PixelFormat::Rgba => 1,
        }
    }

    pub fn is_chroma_subsampled(&self) -> bool {
        !matches!(self, PixelFormat::Rgba)
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            PixelFormat::Yuv420p => 0,
            PixelFormat::Nv12 => 1,
            PixelFormat::Nv21 => 2,
            PixelFormat::Rgba => 3,
        }
    }
}

/// Audio sample encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    /// Signed 16-bit little endian
    #[default]
    S16,
    /// 32-bit float
    F32,
}

impl SampleFormat {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::S16 => 2,
            SampleFormat::F32 => 4,
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            SampleFormat::S16 => 0,
            SampleFormat::F32 => 1,
        }
    }
}

/// Requested video encoder parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    /// Target bitrate in bits per second
    pub bitrate: u32,
    pub frame_rate: u32,
    /// Frames between keyframes
    pub keyframe_interval: u32,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            pixel_format: PixelFormat::default(),
            bitrate: DEFAULT_VIDEO_BITRATE,
            frame_rate: DEFAULT_FRAME_RATE,
            keyframe_interval: DEFAULT_FRAME_RATE * 2,
        }
    }
}

impl VideoConfig {
    pub const MAX_WIDTH: u32 = 7680;
    pub const MAX_HEIGHT: u32 = 4320;
    pub const MAX_BITRATE: u32 = 100_000_000;
    pub const MAX_FRAME_RATE: u32 = 120;

    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::InvalidVideo(msg));

        if self.width == 0 || self.width > Self::MAX_WIDTH {
            return invalid(format!("width {} out of range", self.width));
        }
        if self.height == 0 || self.height > Self::MAX_HEIGHT {
            return invalid(format!("height {} out of range", self.height));
        }
        if self.pixel_format.is_chroma_subsampled() && (self.width % 2 != 0 || self.height % 2 != 0) {
            return invalid(format!(
                "{}x{} must be even for {:?}",
                self.width, self.height, self.pixel_format
            ));
        }
        if self.bitrate == 0 || self.bitrate > Self::MAX_BITRATE {
            return invalid(format!("bitrate {} out of range", self.bitrate));
        }
        if self.frame_rate == 0 || self.frame_rate > Self::MAX_FRAME_RATE {
            return invalid(format!("frame rate {} out of range", self.frame_rate));
        }
        if self.keyframe_interval == 0 {
            return invalid("keyframe interval must be at least 1".into());
        }
        Ok(())
    }
}

/// Requested audio encoder parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
    /// Target bitrate in bits per second
    pub bitrate: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            sample_format: SampleFormat::default(),
            bitrate: DEFAULT_AUDIO_BITRATE,
        }
    }
}

impl AudioConfig {
    pub const SAMPLE_RATES: [u32; 6] = [8000, 16000, 22050, 32000, 44100, 48000];

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !Self::SAMPLE_RATES.contains(&self.sample_rate) {
            return Err(ConfigError::InvalidAudio(format!(
                "unsupported sample rate {}",
                self.sample_rate
            )));
        }
        if !(1..=2).contains(&self.channels) {
            return Err(ConfigError::InvalidAudio(format!(
                "unsupported channel count {}",
                self.channels
            )));
        }
        if self.bitrate == 0 {
            return Err(ConfigError::InvalidAudio("bitrate must be positive".into()));
        }
        Ok(())
    }

    /// Bytes occupied by one interleaved sample frame
    pub fn bytes_per_frame(&self) -> usize {
        self.sample_format.bytes_per_sample() * self.channels as usize
    }
}

/// The persisted preference record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    pub protocol: StreamProtocol,
    pub host: String,
    pub audio_enabled: bool,
    /// Time of the last successful edit
    pub updated_at: Option<DateTime<Utc>>,
    pub video: VideoConfig,
    pub audio: AudioConfig,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            protocol: StreamProtocol::default(),
            host: String::new(),
            audio_enabled: true,
            updated_at: None,
            video: VideoConfig::default(),
            audio: AudioConfig::default(),
        }
    }
}

impl Preferences {
    pub fn target(&self) -> Result<TransportTarget, ConfigError> {
        TransportTarget::new(self.protocol, self.host.clone())
    }
}
