//! # Live Relay
//!
//! Low-latency relay of live camera video and microphone audio to a remote
//! ingest endpoint (media server, streaming-software socket).
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                               DEVICE                                     │
//! │   ┌──────────────┐                                ┌──────────────┐       │
//! │   │ Config Store │──── Preferences (live feed) ──▶│  UI / Notify │       │
//! │   │  (store::)   │                                └──────▲───────┘       │
//! │   └──────┬───────┘                                       │ EndpointState │
//! │          │ protocol / host / video / audio               │               │
//! │          ▼                                               │               │
//! │   ┌─────────────────────────────────────────────────────┴────────────┐   │
//! │   │           Endpoint State Machine (endpoint::Endpoint)            │   │
//! │   │          Stopped ──▶ Connecting ──▶ Started ──▶ Stopped          │   │
//! │   └──────────────────────────────┬───────────────────────────────────┘   │
//! │                                  │ open / close                          │
//! │                                  ▼                                       │
//! │   ┌──────────────────────────────────────────────────────────────────┐   │
//! │   │              Output Session (session::OutputSession)             │   │
//! │   │   ┌─────────────────────────┐      ┌─────────────────────────┐   │   │
//! │   │   │  Frame Relay (video)    │      │  Sample Relay (audio)   │   │   │
//! │   │   │  depth-2 surface queue  │      │  synchronous send       │   │   │
//! │   │   │  dedicated worker       │      │                         │   │   │
//! │   │   └───────────┬─────────────┘      └───────────┬─────────────┘   │   │
//! │   │               ▼                                ▼                 │   │
//! │   │   ┌──────────────────────────────────────────────────────────┐   │   │
//! │   │   │        Native encoder / muxer (codec::MuxSession)        │   │   │
//! │   │   └───────────────────────────┬──────────────────────────────┘   │   │
//! │   └───────────────────────────────┼──────────────────────────────────┘   │
//! └───────────────────────────────────┼──────────────────────────────────────┘
//!                                     │ RTMP / TCP / WebSocket
//!                                     ▼
//!                              Remote ingest endpoint
//! ```

pub mod codec;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod media;
pub mod relay;
pub mod session;
pub mod store;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    use std::time::Duration;

    /// Default depth of the image queue between capture and the frame relay
    pub const DEFAULT_MAX_IMAGES: usize = 2;

    /// Maximum number of planes in a packed or planar pixel format
    pub const MAX_PLANES: usize = 3;

    /// Default video resolution
    pub const DEFAULT_WIDTH: u32 = 1280;
    pub const DEFAULT_HEIGHT: u32 = 720;

    /// Default video bitrate in bits per second
    pub const DEFAULT_VIDEO_BITRATE: u32 = 2_500_000;

    /// Default frame rate
    pub const DEFAULT_FRAME_RATE: u32 = 30;

    /// Default sample rate for audio capture
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Default channel count (stereo)
    pub const DEFAULT_CHANNELS: u16 = 2;

    /// Default audio bitrate in bits per second
    pub const DEFAULT_AUDIO_BITRATE: u32 = 128_000;

    /// Attempts made by the config store before reporting a failed write
    pub const STORE_WRITE_ATTEMPTS: u32 = 3;

    /// Base delay of the config store exponential backoff
    pub const STORE_RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

    /// Upper bound on a single config store backoff delay
    pub const STORE_RETRY_MAX_DELAY: Duration = Duration::from_secs(2);

    /// How long the preference feed stays open after its last subscriber leaves
    pub const FEED_GRACE_PERIOD: Duration = Duration::from_secs(5);

    /// Debounce window for endpoint state displayed to users
    pub const STATE_DEBOUNCE: Duration = Duration::from_secs(1);
}
