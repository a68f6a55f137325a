//! In-memory backend
//!
//! Records every call the pipeline makes instead of encoding, so a dry run
//! can exercise the full lifecycle without a network peer. Faults can be
//! injected to rehearse connect and start failures.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use super::{AudioEncoderStream, EncoderStream, MediaBackend, MuxSession, VideoEncoderStream};
use crate::config::{AudioConfig, TransportTarget, VideoConfig};
use crate::error::{ConnectError, EncoderError};
use crate::media::{FrameBuffer, SampleBuffer};

/// Which kind of track a stream carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
}

/// One recorded backend call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopbackEvent {
    SessionCreated { target: String },
    StreamAdded { index: usize, kind: StreamKind },
    Connected,
    Disconnected,
    SessionReleased,
    StreamStarted(usize),
    StreamStopped(usize),
    StreamReleased(usize),
    Frame { index: usize, timestamp_us: i64, bytes: usize },
    Samples { index: usize, timestamp_us: i64, frames: usize },
}

/// Shared, cloneable record of backend calls
#[derive(Debug, Clone, Default)]
pub struct LoopbackLog {
    events: Arc<Mutex<Vec<LoopbackEvent>>>,
}

impl LoopbackLog {
    fn push(&self, event: LoopbackEvent) {
        self.events.lock().push(event);
    }

    pub fn events(&self) -> Vec<LoopbackEvent> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    pub fn count(&self, pred: impl Fn(&LoopbackEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }

    /// Timestamps of frames delivered to stream `index`, in delivery order
    pub fn frame_timestamps(&self, index: usize) -> Vec<i64> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                LoopbackEvent::Frame { index: i, timestamp_us, .. } if *i == index => {
                    Some(*timestamp_us)
                }
                _ => None,
            })
            .collect()
    }

    /// Lifecycle events only (frames and samples filtered out)
    pub fn lifecycle(&self) -> Vec<LoopbackEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| !matches!(e, LoopbackEvent::Frame { .. } | LoopbackEvent::Samples { .. }))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Default)]
struct Faults {
    refuse_sessions: bool,
    fail_connect: bool,
    fail_start: Option<usize>,
    fail_stop: Option<usize>,
    connect_delay: Duration,
    frame_delay: Duration,
}

/// Backend that records instead of encoding
#[derive(Debug, Clone, Default)]
pub struct LoopbackBackend {
    log: LoopbackLog,
    faults: Faults,
}

impl LoopbackBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log(&self) -> LoopbackLog {
        self.log.clone()
    }

    /// `create_session` fails
    pub fn refuse_sessions(mut self) -> Self {
        self.faults.refuse_sessions = true;
        self
    }

    /// `connect` fails
    pub fn fail_connect(mut self) -> Self {
        self.faults.fail_connect = true;
        self
    }

    /// Starting stream `index` fails
    pub fn fail_start(mut self, index: usize) -> Self {
        self.faults.fail_start = Some(index);
        self
    }

    /// Stopping stream `index` fails
    pub fn fail_stop(mut self, index: usize) -> Self {
        self.faults.fail_stop = Some(index);
        self
    }

    /// `connect` blocks for `delay` before succeeding or failing
    pub fn connect_delay(mut self, delay: Duration) -> Self {
        self.faults.connect_delay = delay;
        self
    }

    /// Each `send_frame` blocks for `delay`, simulating a saturated encoder
    pub fn frame_delay(mut self, delay: Duration) -> Self {
        self.faults.frame_delay = delay;
        self
    }
}

impl MediaBackend for LoopbackBackend {
    fn name(&self) -> &str {
        "loopback"
    }

    fn create_session(&self, target: &TransportTarget) -> Result<Box<dyn MuxSession>, EncoderError> {
        if self.faults.refuse_sessions {
            return Err(EncoderError::StreamInit("session refused".into()));
        }
        self.log.push(LoopbackEvent::SessionCreated {
            target: target.url(),
        });
        Ok(Box::new(LoopbackSession {
            log: self.log.clone(),
            faults: self.faults.clone(),
            next_index: 0,
            connected: false,
        }))
    }
}

struct LoopbackSession {
    log: LoopbackLog,
    faults: Faults,
    next_index: usize,
    connected: bool,
}

impl LoopbackSession {
    fn add_stream(&mut self, kind: StreamKind) -> LoopbackStream {
        let index = self.next_index;
        self.next_index += 1;
        self.log.push(LoopbackEvent::StreamAdded { index, kind });
        LoopbackStream {
            index,
            log: self.log.clone(),
            faults: self.faults.clone(),
            started: false,
            released: false,
        }
    }
}

impl MuxSession for LoopbackSession {
    fn add_video_stream(
        &mut self,
        _config: &VideoConfig,
    ) -> Result<Box<dyn VideoEncoderStream>, EncoderError> {
        Ok(Box::new(self.add_stream(StreamKind::Video)))
    }

    fn add_audio_stream(
        &mut self,
        _config: &AudioConfig,
    ) -> Result<Box<dyn AudioEncoderStream>, EncoderError> {
        Ok(Box::new(self.add_stream(StreamKind::Audio)))
    }

    fn connect(&mut self) -> Result<(), ConnectError> {
        if !self.faults.connect_delay.is_zero() {
            std::thread::sleep(self.faults.connect_delay);
        }
        if self.faults.fail_connect {
            return Err(ConnectError::ConnectionFailed {
                target: "loopback".into(),
                reason: "injected failure".into(),
            });
        }
        self.connected = true;
        self.log.push(LoopbackEvent::Connected);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), ConnectError> {
        if self.connected {
            self.connected = false;
            self.log.push(LoopbackEvent::Disconnected);
        }
        Ok(())
    }

    fn release(&mut self) {
        self.log.push(LoopbackEvent::SessionReleased);
    }
}

struct LoopbackStream {
    index: usize,
    log: LoopbackLog,
    faults: Faults,
    started: bool,
    released: bool,
}

impl LoopbackStream {
    fn check_live(&self) -> Result<(), EncoderError> {
        if self.released {
            Err(EncoderError::Released)
        } else if !self.started {
            Err(EncoderError::EncodingFailed("stream not started".into()))
        } else {
            Ok(())
        }
    }
}

impl EncoderStream for LoopbackStream {
    fn index(&self) -> usize {
        self.index
    }

    fn start(&mut self) -> Result<(), EncoderError> {
        if self.released {
            return Err(EncoderError::Released);
        }
        if self.faults.fail_start == Some(self.index) {
            return Err(EncoderError::StartFailed(format!("stream {}", self.index)));
        }
        self.started = true;
        self.log.push(LoopbackEvent::StreamStarted(self.index));
        Ok(())
    }

    fn stop(&mut self) -> Result<(), EncoderError> {
        self.started = false;
        if self.faults.fail_stop == Some(self.index) {
            return Err(EncoderError::StopFailed(format!("stream {}", self.index)));
        }
        self.log.push(LoopbackEvent::StreamStopped(self.index));
        Ok(())
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.log.push(LoopbackEvent::StreamReleased(self.index));
        }
    }
}

impl VideoEncoderStream for LoopbackStream {
    fn send_frame(&mut self, frame: &FrameBuffer<'_>) -> Result<(), EncoderError> {
        self.check_live()?;
        if !self.faults.frame_delay.is_zero() {
            std::thread::sleep(self.faults.frame_delay);
        }
        self.log.push(LoopbackEvent::Frame {
            index: self.index,
            timestamp_us: frame.timestamp_us,
            bytes: frame.byte_len(),
        });
        Ok(())
    }
}

impl AudioEncoderStream for LoopbackStream {
    fn send_samples(&mut self, chunk: &SampleBuffer<'_>) -> Result<(), EncoderError> {
        self.check_live()?;
        self.log.push(LoopbackEvent::Samples {
            index: self.index,
            timestamp_us: chunk.timestamp_us,
            frames: chunk.frame_count,
        });
        Ok(())
    }
}
