//! Error types for the media relay

use thiserror::Error;

use crate::endpoint::EndpointState;

/// Main error type for the library
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Encoder error: {0}")]
    Encoder(#[from] EncoderError),

    #[error("Connect error: {0}")]
    Connect(#[from] ConnectError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Endpoint error: {0}")]
    Endpoint(#[from] EndpointError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Rejected encoder parameters
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid video config: {0}")]
    InvalidVideo(String),

    #[error("Invalid audio config: {0}")]
    InvalidAudio(String),

    #[error("Invalid host: {0:?}")]
    InvalidHost(String),

    #[error("Unknown protocol: {0:?}")]
    UnknownProtocol(String),
}

/// Failures of the preference storage backend
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupted preference record: {0}")]
    Corrupt(String),

    #[error("Storage failure: {0}")]
    Other(String),
}

impl StorageError {
    /// I/O and corruption are survivable: readers fall back to defaults.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, StorageError::Io(_) | StorageError::Corrupt(_))
    }
}

/// Config store errors surfaced to callers
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Write failed after {attempts} attempts: {last}")]
    WriteFailed { attempts: u32, last: StorageError },

    #[error("Preference feed failed: {0}")]
    FeedFailed(String),

    #[error("Background task failed: {0}")]
    Task(String),
}

/// Native encoder / muxer failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncoderError {
    #[error("Stream creation failed: {0}")]
    StreamInit(String),

    #[error("Stream start failed: {0}")]
    StartFailed(String),

    #[error("Stream stop failed: {0}")]
    StopFailed(String),

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Stream already released")]
    Released,

    #[error("Transport not connected")]
    NotConnected,
}

/// Transport connection failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("Protocol {0} is not supported by this backend")]
    UnsupportedProtocol(String),

    #[error("Could not resolve {0}")]
    Resolve(String),

    #[error("Connection to {target} failed: {reason}")]
    ConnectionFailed { target: String, reason: String },

    #[error("Disconnect failed: {0}")]
    DisconnectFailed(String),
}

/// Output session lifecycle errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Encoder(#[from] EncoderError),

    #[error("Session is closed")]
    Closed,

    #[error("Blocking task failed: {0}")]
    Task(String),
}

/// Endpoint state machine errors
#[derive(Error, Debug)]
pub enum EndpointError {
    #[error("Endpoint already active ({0:?})")]
    AlreadyActive(EndpointState),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Start cancelled by stop request")]
    Cancelled,
}

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;
