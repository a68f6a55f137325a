//! Native encoder / muxer interface
//!
//! The relay pipeline drives an external codec and mux library through
//! these traits. Calls are blocking, the way a C encoder API is: session
//! connect/disconnect are run on the blocking pool by the output session,
//! while stream sends happen on the relay worker (video) or the audio
//! source's own thread.
//!
//! Two backends ship with the crate:
//! - [`RawTcpBackend`] writes raw planes and samples over a TCP socket.
//! - [`LoopbackBackend`] keeps everything in memory, for dry runs and tests.

pub mod loopback;
pub mod tcp;

pub use loopback::{LoopbackBackend, LoopbackEvent, LoopbackLog, StreamKind};
pub use tcp::RawTcpBackend;

use crate::config::{AudioConfig, TransportTarget, VideoConfig};
use crate::error::{ConnectError, EncoderError};
use crate::media::{FrameBuffer, SampleBuffer};

/// Factory for native mux sessions
pub trait MediaBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Allocate a session bound to `target`. Must not touch the network.
    fn create_session(&self, target: &TransportTarget) -> Result<Box<dyn MuxSession>, EncoderError>;
}

/// One encoder/muxer instance bound to one transport target
pub trait MuxSession: Send {
    fn add_video_stream(
        &mut self,
        config: &VideoConfig,
    ) -> Result<Box<dyn VideoEncoderStream>, EncoderError>;

    fn add_audio_stream(
        &mut self,
        config: &AudioConfig,
    ) -> Result<Box<dyn AudioEncoderStream>, EncoderError>;

    /// Open the transport connection. May block on network I/O.
    fn connect(&mut self) -> Result<(), ConnectError>;

    /// Close the transport connection. May block on network I/O.
    fn disconnect(&mut self) -> Result<(), ConnectError>;

    /// Free native resources. Called exactly once, after disconnect.
    fn release(&mut self);
}

/// Lifecycle shared by video and audio encoder tracks
pub trait EncoderStream: Send {
    /// Track index inside the owning session
    fn index(&self) -> usize;

    fn start(&mut self) -> Result<(), EncoderError>;

    fn stop(&mut self) -> Result<(), EncoderError>;

    /// Free native resources. Called at most once.
    fn release(&mut self);
}

pub trait VideoEncoderStream: EncoderStream {
    /// Consume one frame. The borrowed planes are invalid once this returns,
    /// so implementations copy whatever they keep.
    fn send_frame(&mut self, frame: &FrameBuffer<'_>) -> Result<(), EncoderError>;
}

pub trait AudioEncoderStream: EncoderStream {
    /// Consume one chunk. Same borrow rule as [`VideoEncoderStream::send_frame`].
    fn send_samples(&mut self, chunk: &SampleBuffer<'_>) -> Result<(), EncoderError>;
}
