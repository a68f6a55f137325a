//! Output session: one native mux session bound to one transport target
//!
//! The session owns its relays in creation order. `open` connects the
//! transport and starts relays front to back; `close` stops them back to
//! front, disconnects, and releases every encoder stream. Network and
//! worker teardown run on the blocking pool so the caller's task is never
//! parked on I/O.

use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

use crate::codec::{MediaBackend, MuxSession};
use crate::config::{AudioConfig, StreamProtocol, TransportTarget, VideoConfig};
use crate::constants::DEFAULT_MAX_IMAGES;
use crate::error::{ConnectError, SessionError};
use crate::relay::{FrameRelay, Relay, SampleRelay};

type SharedMux = Arc<Mutex<Box<dyn MuxSession>>>;

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Allocated, streams may be added, transport not connected
    Created,
    /// Transport connected and every relay started
    Open,
    /// Torn down; streams released
    Closed,
}

pub struct OutputSession {
    id: Uuid,
    target: TransportTarget,
    native: SharedMux,
    relays: Vec<Arc<dyn Relay>>,
    state: SessionState,
    max_images: usize,
    released: bool,
}

impl OutputSession {
    /// Allocate a session for `protocol`/`host`. No network activity.
    pub fn create(
        backend: &dyn MediaBackend,
        protocol: StreamProtocol,
        host: &str,
    ) -> Result<Self, SessionError> {
        let target = TransportTarget::new(protocol, host)?;
        let native = backend.create_session(&target)?;
        let id = Uuid::new_v4();
        tracing::info!(session = %id, "Created {} session for {}", backend.name(), target);

        Ok(Self {
            id,
            target,
            native: Arc::new(Mutex::new(native)),
            relays: Vec::new(),
            state: SessionState::Created,
            max_images: DEFAULT_MAX_IMAGES,
            released: false,
        })
    }

    /// Depth of the image queue given to video relays created afterwards
    pub fn with_max_images(mut self, max_images: usize) -> Self {
        self.max_images = max_images.max(1);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn target(&self) -> &TransportTarget {
        &self.target
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    /// Encoder streams currently owned through relays
    pub fn stream_count(&self) -> usize {
        self.relays.len()
    }

    /// Create a video stream for `config` and a relay bound to it.
    ///
    /// Returns `None`, leaving the session untouched, when the config is
    /// invalid, the backend refuses the stream, or the session was already
    /// opened or closed.
    pub fn make_video_relay(&mut self, config: &VideoConfig) -> Option<Arc<FrameRelay>> {
        if !self.accepts_streams() {
            return None;
        }
        if let Err(e) = config.validate() {
            tracing::warn!(session = %self.id, "Rejecting video relay: {}", e);
            return None;
        }

        let stream = match self.native.lock().add_video_stream(config) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(session = %self.id, "Video stream creation failed: {}", e);
                return None;
            }
        };
        let relay = match FrameRelay::new(stream, self.max_images) {
            Ok(relay) => Arc::new(relay),
            Err(e) => {
                tracing::warn!(session = %self.id, "Frame relay creation failed: {}", e);
                return None;
            }
        };

        tracing::info!(
            session = %self.id,
            "Video relay {} ready: {}x{} {:?} @ {} bps",
            relay.stream_index(),
            config.width,
            config.height,
            config.pixel_format,
            config.bitrate
        );
        self.relays.push(relay.clone());
        Some(relay)
    }

    /// Create an audio stream for `config` and a relay bound to it.
    ///
    /// Same rejection rules as [`OutputSession::make_video_relay`].
    pub fn make_audio_relay(&mut self, config: &AudioConfig) -> Option<Arc<SampleRelay>> {
        if !self.accepts_streams() {
            return None;
        }
        if let Err(e) = config.validate() {
            tracing::warn!(session = %self.id, "Rejecting audio relay: {}", e);
            return None;
        }

        let stream = match self.native.lock().add_audio_stream(config) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(session = %self.id, "Audio stream creation failed: {}", e);
                return None;
            }
        };
        let relay = Arc::new(SampleRelay::new(stream));

        tracing::info!(
            session = %self.id,
            "Audio relay {} ready: {} Hz x{} {:?}",
            relay.stream_index(),
            config.sample_rate,
            config.channels,
            config.sample_format
        );
        self.relays.push(relay.clone());
        Some(relay)
    }

    fn accepts_streams(&self) -> bool {
        if self.state != SessionState::Created {
            tracing::warn!(session = %self.id, "Cannot add streams to a {:?} session", self.state);
            return false;
        }
        true
    }

    /// Connect the transport, then start every relay in creation order.
    ///
    /// If a relay fails to start, relays already started are stopped in
    /// reverse order, the transport is disconnected, and the error is
    /// returned. The session stays `Created` so the caller may retry or close.
    pub async fn open(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Open => return Ok(()),
            SessionState::Closed => return Err(SessionError::Closed),
            SessionState::Created => {}
        }

        tracing::info!(session = %self.id, "Connecting to {}", self.target);
        let native = self.native.clone();
        tokio::task::spawn_blocking(move || native.lock().connect())
            .await
            .map_err(|e| SessionError::Task(e.to_string()))??;

        for (position, relay) in self.relays.iter().enumerate() {
            if let Err(e) = relay.start() {
                tracing::warn!(
                    session = %self.id,
                    "Relay {} failed to start, aborting open: {}",
                    relay.stream_index(),
                    e
                );
                let id = self.id;
                let started = self.relays[..position].to_vec();
                let native = self.native.clone();
                let rollback = tokio::task::spawn_blocking(move || {
                    for relay in started.iter().rev() {
                        if let Err(stop_err) = relay.stop() {
                            tracing::warn!(
                                session = %id,
                                "Relay {} failed to stop during rollback: {}",
                                relay.stream_index(),
                                stop_err
                            );
                        }
                    }
                    native.lock().disconnect()
                })
                .await;
                match rollback {
                    Ok(Ok(())) => {}
                    Ok(Err(disconnect_err)) => {
                        tracing::warn!(session = %self.id, "Rollback disconnect failed: {}", disconnect_err)
                    }
                    Err(join_err) => tracing::warn!(session = %self.id, "Rollback task failed: {}", join_err),
                }
                return Err(e.into());
            }
        }

        self.state = SessionState::Open;
        tracing::info!(session = %self.id, "Session open with {} streams", self.relays.len());
        Ok(())
    }

    /// Stop relays in reverse order, disconnect, and release every stream.
    ///
    /// Closing a closed session is a no-op. Teardown runs to completion even
    /// when a step fails; the first failure is returned.
    pub async fn close(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Closed {
            tracing::debug!(session = %self.id, "Session already closed");
            return Ok(());
        }

        let was_open = self.state == SessionState::Open;
        // No longer open, whatever the rest of teardown reports
        self.state = SessionState::Closed;

        // Stopping waits for any frame mid-write, so it runs off the async task too
        let id = self.id;
        let native = self.native.clone();
        let relays = std::mem::take(&mut self.relays);
        let teardown = tokio::task::spawn_blocking(move || {
            let mut first_error: Option<SessionError> = None;
            if was_open {
                for relay in relays.iter().rev() {
                    if let Err(e) = relay.stop() {
                        tracing::warn!(session = %id, "Relay {} failed to stop: {}", relay.stream_index(), e);
                        first_error.get_or_insert(e.into());
                    }
                }
            }
            if let Err(e) = native.lock().disconnect() {
                tracing::warn!(session = %id, "Disconnect failed: {}", e);
                first_error.get_or_insert(e.into());
            }
            for relay in relays.iter().rev() {
                relay.destroy();
            }
            first_error
        })
        .await;

        let first_error = match teardown {
            Ok(first_error) => first_error,
            Err(e) => Some(SessionError::Task(e.to_string())),
        };

        tracing::info!(session = %self.id, "Session closed");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Release every native resource. Normally called after [`close`];
    /// a session still open is torn down forcibly.
    ///
    /// [`close`]: OutputSession::close
    pub fn destroy(mut self) {
        self.release_native();
    }

    fn release_native(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if self.state != SessionState::Closed {
            tracing::warn!(session = %self.id, "Releasing a {:?} session without close", self.state);
            for relay in self.relays.iter().rev() {
                if let Err(e) = relay.stop() {
                    tracing::debug!("Relay {} stop during release: {}", relay.stream_index(), e);
                }
            }
            for relay in self.relays.drain(..).rev() {
                relay.destroy();
            }
            let disconnected: Result<(), ConnectError> = self.native.lock().disconnect();
            if let Err(e) = disconnected {
                tracing::debug!("Disconnect during release: {}", e);
            }
            self.state = SessionState::Closed;
        }

        self.native.lock().release();
        tracing::debug!(session = %self.id, "Native session released");
    }
}

impl Drop for OutputSession {
    fn drop(&mut self) {
        self.release_native();
    }
}
