//! Relays between capture sources and encoder streams
//!
//! A relay exclusively owns one encoder stream. The output session starts
//! and stops relays; capture sources only ever see the relay's input side
//! ([`FrameSurface`] for video, [`SampleRelay::send`] for audio).

pub mod frame;
pub mod sample;

pub use frame::{FrameRelay, FrameRelayStats, FrameSurface};
pub use sample::{SampleRelay, SampleRelayStats};

use crate::error::EncoderError;

/// Lifecycle the output session drives on every relay
pub trait Relay: Send + Sync {
    /// Index of the owned encoder stream inside its session
    fn stream_index(&self) -> usize;

    fn start(&self) -> Result<(), EncoderError>;

    fn stop(&self) -> Result<(), EncoderError>;

    /// Release the encoder stream and any worker. Idempotent.
    fn destroy(&self);
}
