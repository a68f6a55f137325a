//! Video frame relay
//!
//! Capture sources push [`CapturedImage`]s into a [`FrameSurface`]. The
//! relay holds at most `max_images` images at once, counting the one being
//! encoded, so the queue itself is one shorter. Submitting never blocks the
//! capture thread: when the queue is full the oldest queued image is evicted
//! and released. A dedicated worker thread takes images in arrival order,
//! hands a borrowed [`FrameBuffer`] to the encoder stream, and releases the
//! image as soon as the encoder call returns.

use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::Relay;
use crate::codec::VideoEncoderStream;
use crate::error::EncoderError;
use crate::media::CapturedImage;

type SharedStream = Arc<Mutex<Option<Box<dyn VideoEncoderStream>>>>;

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    forwarded: AtomicU64,
    dropped: AtomicU64,
    skipped: AtomicU64,
    invalid: AtomicU64,
    failed: AtomicU64,
}

/// Snapshot of frame relay counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameRelayStats {
    /// Images accepted by the surface
    pub submitted: u64,
    /// Frames handed to the encoder successfully
    pub forwarded: u64,
    /// Images evicted from a full queue
    pub dropped: u64,
    /// Images released unprocessed because the relay was stopped
    pub skipped: u64,
    /// Images whose plane layout did not match their format
    pub invalid: u64,
    /// Encoder calls that returned an error
    pub failed: u64,
}

/// Input side of a [`FrameRelay`], bound by the capture source
#[derive(Clone)]
pub struct FrameSurface {
    tx: Sender<CapturedImage>,
    /// Held only to evict the oldest image when the queue is full
    evict_rx: Receiver<CapturedImage>,
    closed: Arc<AtomicBool>,
    counters: Arc<Counters>,
    max_images: usize,
}

impl FrameSurface {
    /// Queue an image for encoding. Never blocks.
    ///
    /// Returns `false` when the relay has been destroyed; the image is
    /// released immediately in that case.
    pub fn submit(&self, image: CapturedImage) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);

        let mut image = image;
        loop {
            match self.tx.try_send(image) {
                Ok(()) => return true,
                Err(TrySendError::Full(back)) => {
                    image = back;
                    if let Ok(oldest) = self.evict_rx.try_recv() {
                        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::trace!("Dropping frame {} under backpressure", oldest.timestamp_us);
                    } else if self.tx.capacity() == Some(0) {
                        // depth 1: the only slot is the image being encoded
                        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::trace!("Dropping frame {} under backpressure", image.timestamp_us);
                        return true;
                    }
                }
                Err(TrySendError::Disconnected(_)) => return false,
            }
        }
    }

    /// Images currently waiting for the worker
    pub fn queued(&self) -> usize {
        self.tx.len()
    }

    pub fn max_images(&self) -> usize {
        self.max_images
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Forwards captured images to one video encoder stream
pub struct FrameRelay {
    index: usize,
    stream: SharedStream,
    started: Arc<AtomicBool>,
    surface: FrameSurface,
    counters: Arc<Counters>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl FrameRelay {
    /// Create a relay owning `stream` that holds at most `max_images`
    /// images at a time.
    pub fn new(stream: Box<dyn VideoEncoderStream>, max_images: usize) -> Result<Self, EncoderError> {
        let index = stream.index();
        let max_images = max_images.max(1);
        let (tx, rx) = bounded::<CapturedImage>(max_images - 1);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

        let counters = Arc::new(Counters::default());
        let stream: SharedStream = Arc::new(Mutex::new(Some(stream)));
        let started = Arc::new(AtomicBool::new(false));

        let spawned = {
            let frames_rx = rx.clone();
            let stream = stream.clone();
            let started = started.clone();
            let counters = counters.clone();
            thread::Builder::new()
                .name(format!("frame-relay-{}", index))
                .spawn(move || run_worker(index, frames_rx, shutdown_rx, stream, started, counters))
        };
        let worker = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                if let Some(mut stream) = stream.lock().take() {
                    stream.release();
                }
                return Err(EncoderError::StreamInit(format!("relay worker: {}", e)));
            }
        };

        let surface = FrameSurface {
            tx,
            evict_rx: rx,
            closed: Arc::new(AtomicBool::new(false)),
            counters: counters.clone(),
            max_images,
        };

        Ok(Self {
            index,
            stream,
            started,
            surface,
            counters,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Surface the capture source writes into
    pub fn surface(&self) -> FrameSurface {
        self.surface.clone()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> FrameRelayStats {
        let c = &self.counters;
        FrameRelayStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            forwarded: c.forwarded.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            skipped: c.skipped.load(Ordering::Relaxed),
            invalid: c.invalid.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
        }
    }
}

impl Relay for FrameRelay {
    fn stream_index(&self) -> usize {
        self.index
    }

    fn start(&self) -> Result<(), EncoderError> {
        let mut guard = self.stream.lock();
        let stream = guard.as_mut().ok_or(EncoderError::Released)?;
        stream.start()?;
        self.started.store(true, Ordering::Release);
        tracing::debug!("Frame relay {} started", self.index);
        Ok(())
    }

    fn stop(&self) -> Result<(), EncoderError> {
        self.started.store(false, Ordering::Release);
        let mut guard = self.stream.lock();
        match guard.as_mut() {
            Some(stream) => {
                stream.stop()?;
                tracing::debug!("Frame relay {} stopped", self.index);
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn destroy(&self) {
        self.surface.closed.store(true, Ordering::Release);
        self.started.store(false, Ordering::Release);

        // Dropping the sender wakes the worker
        self.shutdown_tx.lock().take();
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                tracing::error!("Frame relay {} worker panicked", self.index);
            }
        }

        // Images that raced in after the worker exited
        while self.surface.evict_rx.try_recv().is_ok() {}

        if let Some(mut stream) = self.stream.lock().take() {
            stream.release();
            tracing::debug!("Frame relay {} released its stream", self.index);
        }
    }
}

impl Drop for FrameRelay {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn run_worker(
    index: usize,
    frames_rx: Receiver<CapturedImage>,
    shutdown_rx: Receiver<()>,
    stream: SharedStream,
    started: Arc<AtomicBool>,
    counters: Arc<Counters>,
) {
    tracing::debug!("Frame relay {} worker running", index);
    loop {
        select! {
            recv(frames_rx) -> msg => match msg {
                Ok(image) => forward(index, image, &stream, &started, &counters),
                Err(_) => break,
            },
            recv(shutdown_rx) -> _ => break,
        }
    }

    let mut released = 0usize;
    while frames_rx.try_recv().is_ok() {
        released += 1;
    }
    tracing::debug!("Frame relay {} worker exiting ({} queued images released)", index, released);
}

fn forward(
    index: usize,
    image: CapturedImage,
    stream: &SharedStream,
    started: &AtomicBool,
    counters: &Counters,
) {
    if !started.load(Ordering::Acquire) {
        counters.skipped.fetch_add(1, Ordering::Relaxed);
        return;
    }

    let Some(frame) = image.frame() else {
        counters.invalid.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            "Relay {} skipping image {} with invalid plane layout",
            index,
            image.timestamp_us
        );
        return;
    };

    let mut guard = stream.lock();
    let Some(encoder) = guard.as_mut() else {
        counters.skipped.fetch_add(1, Ordering::Relaxed);
        return;
    };

    match encoder.send_frame(&frame) {
        Ok(()) => {
            counters.forwarded.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            let failed = counters.failed.fetch_add(1, Ordering::Relaxed);
            // first failure and then every 100th
            if failed % 100 == 0 {
                tracing::warn!("Relay {} failed to encode frame: {} ({} failures)", index, e, failed + 1);
            }
        }
    }
    // image is released when it goes out of scope here
}
