//! Endpoint state machine
//!
//! One configured streaming destination. `start` builds an output session
//! with its relays, binds the capture sources, and opens it; `stop` tears
//! everything down. Only one transition is in flight at a time, and every
//! path converges back to `Stopped` without leaking the native session.

pub mod debounce;

pub use debounce::StateDebouncer;

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;

use crate::codec::MediaBackend;
use crate::config::{AudioConfig, Preferences, StreamProtocol, TransportTarget, VideoConfig};
use crate::constants::DEFAULT_MAX_IMAGES;
use crate::error::{EncoderError, EndpointError, SessionError};
use crate::relay::{FrameSurface, SampleRelay};
use crate::session::OutputSession;

/// Externally visible endpoint state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EndpointState {
    #[default]
    Stopped,
    Connecting,
    Started,
}

impl std::fmt::Display for EndpointState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EndpointState::Stopped => "stopped",
            EndpointState::Connecting => "connecting",
            EndpointState::Started => "started",
        };
        f.write_str(name)
    }
}

/// Capture collaborator that pushes images into a frame surface
pub trait VideoSource: Send + Sync {
    fn bind(&self, surface: FrameSurface);

    fn unbind(&self);
}

/// Audio collaborator that pushes chunks into a sample relay
pub trait AudioSource: Send + Sync {
    fn bind(&self, relay: Arc<SampleRelay>);

    fn unbind(&self);
}

/// Sources bound to the session's relays while the endpoint runs
#[derive(Clone, Default)]
pub struct StreamTargets {
    pub video: Option<Arc<dyn VideoSource>>,
    pub audio: Option<Arc<dyn AudioSource>>,
}

impl StreamTargets {
    fn unbind(&self) {
        if let Some(video) = &self.video {
            video.unbind();
        }
        if let Some(audio) = &self.audio {
            audio.unbind();
        }
    }
}

/// Parameters of one start attempt
#[derive(Debug, Clone, PartialEq)]
pub struct StartRequest {
    pub protocol: StreamProtocol,
    pub host: String,
    pub video: Option<VideoConfig>,
    pub audio: Option<AudioConfig>,
}

impl StartRequest {
    pub fn new(protocol: StreamProtocol, host: impl Into<String>) -> Self {
        Self {
            protocol,
            host: host.into(),
            video: None,
            audio: None,
        }
    }

    pub fn with_video(mut self, config: VideoConfig) -> Self {
        self.video = Some(config);
        self
    }

    pub fn with_audio(mut self, config: AudioConfig) -> Self {
        self.audio = Some(config);
        self
    }

    /// Video always, audio when enabled in the record
    pub fn from_preferences(prefs: &Preferences) -> Self {
        Self {
            protocol: prefs.protocol,
            host: prefs.host.clone(),
            video: Some(prefs.video.clone()),
            audio: prefs.audio_enabled.then(|| prefs.audio.clone()),
        }
    }

    /// Reject bad parameters before anything is allocated
    pub fn validate(&self) -> Result<TransportTarget, EndpointError> {
        let target = TransportTarget::new(self.protocol, self.host.clone())?;
        if let Some(video) = &self.video {
            video.validate()?;
        }
        if let Some(audio) = &self.audio {
            audio.validate()?;
        }
        Ok(target)
    }
}

struct Active {
    session: OutputSession,
    targets: StreamTargets,
}

#[derive(Default)]
struct Control {
    active: Option<Active>,
    cancel_requested: bool,
    last_error: Option<String>,
}

pub struct Endpoint {
    backend: Arc<dyn MediaBackend>,
    max_images: usize,
    state_tx: watch::Sender<EndpointState>,
    control: Mutex<Control>,
}

impl Endpoint {
    pub fn new(backend: Arc<dyn MediaBackend>) -> Self {
        let (state_tx, _) = watch::channel(EndpointState::Stopped);
        Self {
            backend,
            max_images: DEFAULT_MAX_IMAGES,
            state_tx,
            control: Mutex::new(Control::default()),
        }
    }

    /// Image queue depth for sessions created by this endpoint
    pub fn with_max_images(mut self, max_images: usize) -> Self {
        self.max_images = max_images;
        self
    }

    pub fn state(&self) -> EndpointState {
        *self.state_tx.borrow()
    }

    /// Live state updates. The receiver starts at the current state.
    pub fn subscribe(&self) -> watch::Receiver<EndpointState> {
        self.state_tx.subscribe()
    }

    /// Cause of the most recent failed start
    pub fn last_error(&self) -> Option<String> {
        self.control.lock().last_error.clone()
    }

    pub async fn start_from_preferences(
        &self,
        prefs: &Preferences,
        targets: StreamTargets,
    ) -> Result<(), EndpointError> {
        self.start(StartRequest::from_preferences(prefs), targets).await
    }

    /// Start streaming. Valid only from `Stopped`.
    ///
    /// On failure the endpoint is back in `Stopped`, the cause is kept in
    /// [`last_error`](Self::last_error), and the error is returned. If
    /// [`stop`](Self::stop) is called while connecting, the attempt finishes,
    /// its session is torn down, and `Cancelled` is returned.
    pub async fn start(
        &self,
        request: StartRequest,
        targets: StreamTargets,
    ) -> Result<(), EndpointError> {
        let current = self.state();
        if current != EndpointState::Stopped {
            return Err(EndpointError::AlreadyActive(current));
        }
        let target = request.validate()?;

        {
            let mut control = self.control.lock();
            let state = *self.state_tx.borrow();
            if state != EndpointState::Stopped {
                return Err(EndpointError::AlreadyActive(state));
            }
            control.cancel_requested = false;
            control.last_error = None;
            self.state_tx.send_replace(EndpointState::Connecting);
        }
        tracing::info!("Endpoint connecting to {}", target);

        // Dropping this future mid-connect still lands in Stopped
        let mut guard = ConnectGuard {
            endpoint: self,
            targets: &targets,
            armed: true,
        };

        let outcome = self.connect(&request, &targets).await;
        guard.armed = false;
        drop(guard);

        let active = match outcome {
            Ok(session) => Active { session, targets },
            Err(e) => {
                tracing::warn!("Endpoint start failed: {}", e);
                let mut control = self.control.lock();
                control.cancel_requested = false;
                control.last_error = Some(e.to_string());
                self.state_tx.send_replace(EndpointState::Stopped);
                return Err(e);
            }
        };

        let cancelled = {
            let mut control = self.control.lock();
            if control.cancel_requested {
                control.cancel_requested = false;
                Some(active)
            } else {
                control.active = Some(active);
                self.state_tx.send_replace(EndpointState::Started);
                None
            }
        };

        match cancelled {
            None => {
                tracing::info!("Endpoint started");
                Ok(())
            }
            Some(active) => {
                tracing::info!("Start cancelled, tearing down session");
                self.teardown(active).await;
                let mut control = self.control.lock();
                control.last_error = Some(EndpointError::Cancelled.to_string());
                self.state_tx.send_replace(EndpointState::Stopped);
                Err(EndpointError::Cancelled)
            }
        }
    }

    /// Stop streaming and converge to `Stopped`. A no-op when stopped.
    pub async fn stop(&self) {
        let active = {
            let mut control = self.control.lock();
            let state = *self.state_tx.borrow();
            match state {
                EndpointState::Stopped => return,
                EndpointState::Connecting => {
                    control.cancel_requested = true;
                    None
                }
                EndpointState::Started => control.active.take(),
            }
        };

        match active {
            Some(active) => {
                tracing::info!("Endpoint stopping");
                self.teardown(active).await;
                let _control = self.control.lock();
                self.state_tx.send_replace(EndpointState::Stopped);
                tracing::info!("Endpoint stopped");
            }
            None => {
                // Another task owns the transition; wait for it to land.
                let mut rx = self.state_tx.subscribe();
                let _ = rx.wait_for(|state| *state == EndpointState::Stopped).await;
            }
        }
    }

    /// Build the session, bind sources, and open. On failure everything
    /// created here is released before returning.
    async fn connect(
        &self,
        request: &StartRequest,
        targets: &StreamTargets,
    ) -> Result<OutputSession, EndpointError> {
        let mut session = OutputSession::create(&*self.backend, request.protocol, &request.host)?
            .with_max_images(self.max_images);

        if let Some(config) = &request.video {
            let relay = session
                .make_video_relay(config)
                .ok_or_else(|| stream_refused("video"))?;
            if let Some(source) = &targets.video {
                source.bind(relay.surface());
            }
        }
        if let Some(config) = &request.audio {
            let relay = match session.make_audio_relay(config) {
                Some(relay) => relay,
                None => {
                    targets.unbind();
                    return Err(stream_refused("audio"));
                }
            };
            if let Some(source) = &targets.audio {
                source.bind(relay);
            }
        }

        if let Err(e) = session.open().await {
            targets.unbind();
            if let Err(close_err) = session.close().await {
                tracing::debug!("Close after failed open: {}", close_err);
            }
            session.destroy();
            return Err(e.into());
        }
        Ok(session)
    }

    async fn teardown(&self, active: Active) {
        let Active {
            mut session,
            targets,
        } = active;
        targets.unbind();
        if let Err(e) = session.close().await {
            tracing::warn!(session = %session.id(), "Session close reported: {}", e);
        }
        session.destroy();
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if let Some(active) = self.control.get_mut().active.take() {
            active.targets.unbind();
            // Dropping the session forces native teardown
            drop(active.session);
        }
    }
}

fn stream_refused(kind: &str) -> EndpointError {
    SessionError::Encoder(EncoderError::StreamInit(format!("{} stream refused by backend", kind)))
        .into()
}

/// Undoes a start whose future was dropped mid-connect: sources bound to
/// the abandoned session are detached and the state returns to `Stopped`.
struct ConnectGuard<'a> {
    endpoint: &'a Endpoint,
    targets: &'a StreamTargets,
    armed: bool,
}

impl Drop for ConnectGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.targets.unbind();
            let mut control = self.endpoint.control.lock();
            control.cancel_requested = false;
            self.endpoint.state_tx.send_replace(EndpointState::Stopped);
        }
    }
}
