//! Audio sample relay
//!
//! A thin synchronous adapter: the audio source calls [`SampleRelay::send`]
//! from its own thread and the chunk is handed straight to the encoder.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::Relay;
use crate::codec::AudioEncoderStream;
use crate::error::EncoderError;
use crate::media::SampleBuffer;

/// Snapshot of sample relay counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleRelayStats {
    pub forwarded: u64,
    pub skipped: u64,
    pub invalid: u64,
    pub failed: u64,
}

/// Forwards audio chunks to one audio encoder stream
pub struct SampleRelay {
    index: usize,
    stream: Mutex<Option<Box<dyn AudioEncoderStream>>>,
    started: AtomicBool,
    forwarded: AtomicU64,
    skipped: AtomicU64,
    invalid: AtomicU64,
    failed: AtomicU64,
}

impl SampleRelay {
    pub fn new(stream: Box<dyn AudioEncoderStream>) -> Self {
        Self {
            index: stream.index(),
            stream: Mutex::new(Some(stream)),
            started: AtomicBool::new(false),
            forwarded: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            invalid: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Forward one chunk.
    ///
    /// Returns `Ok(false)` when the chunk was not forwarded because the relay
    /// is stopped or the chunk layout is inconsistent. Encoder failures are
    /// returned to the caller.
    pub fn send(&self, chunk: &SampleBuffer<'_>) -> Result<bool, EncoderError> {
        if !self.started.load(Ordering::Acquire) {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }
        if !chunk.is_consistent() {
            self.invalid.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Relay {} skipping inconsistent audio chunk", self.index);
            return Ok(false);
        }

        let mut guard = self.stream.lock();
        let Some(stream) = guard.as_mut() else {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        };
        match stream.send_samples(chunk) {
            Ok(()) => {
                self.forwarded.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> SampleRelayStats {
        SampleRelayStats {
            forwarded: self.forwarded.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

impl Relay for SampleRelay {
    fn stream_index(&self) -> usize {
        self.index
    }

    fn start(&self) -> Result<(), EncoderError> {
        let mut guard = self.stream.lock();
        let stream = guard.as_mut().ok_or(EncoderError::Released)?;
        stream.start()?;
        self.started.store(true, Ordering::Release);
        tracing::debug!("Sample relay {} started", self.index);
        Ok(())
    }

    fn stop(&self) -> Result<(), EncoderError> {
        self.started.store(false, Ordering::Release);
        match self.stream.lock().as_mut() {
            Some(stream) => stream.stop(),
            None => Ok(()),
        }
    }

    fn destroy(&self) {
        self.started.store(false, Ordering::Release);
        if let Some(mut stream) = self.stream.lock().take() {
            stream.release();
            tracing::debug!("Sample relay {} released its stream", self.index);
        }
    }
}

impl Drop for SampleRelay {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{LoopbackBackend, LoopbackEvent, MediaBackend};
    use crate::config::{AudioConfig, StreamProtocol, TransportTarget};

    fn relay(backend: &LoopbackBackend) -> SampleRelay {
        let target = TransportTarget::new(StreamProtocol::Tcp, "127.0.0.1").unwrap();
        let mut session = backend.create_session(&target).unwrap();
        SampleRelay::new(session.add_audio_stream(&AudioConfig::default()).unwrap())
    }

    #[test]
    fn test_send_requires_start() {
        let backend = LoopbackBackend::new();
        let relay = relay(&backend);
        let data = vec![0u8; 480 * 4];
        let chunk = SampleBuffer::for_config(&data, 10, &AudioConfig::default());

        assert!(!relay.send(&chunk).unwrap());
        relay.start().unwrap();
        assert!(relay.send(&chunk).unwrap());
        relay.stop().unwrap();
        assert!(!relay.send(&chunk).unwrap());

        let stats = relay.stats();
        assert_eq!(stats.forwarded, 1);
        assert_eq!(stats.skipped, 2);
        assert_eq!(
            backend.log().count(|e| matches!(e, LoopbackEvent::Samples { frames: 480, .. })),
            1
        );
    }

    #[test]
    fn test_inconsistent_chunk_skipped() {
        let backend = LoopbackBackend::new();
        let relay = relay(&backend);
        relay.start().unwrap();
        let data = vec![0u8; 5];
        let chunk = SampleBuffer {
            frame_count: 4,
            ..SampleBuffer::for_config(&data, 0, &AudioConfig::default())
        };
        assert!(!relay.send(&chunk).unwrap());
        assert_eq!(relay.stats().invalid, 1);
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let backend = LoopbackBackend::new();
        let relay = relay(&backend);
        relay.destroy();
        relay.destroy();
        drop(relay);
        assert_eq!(
            backend.log().count(|e| matches!(e, LoopbackEvent::StreamReleased(_))),
            1
        );
    }
}
