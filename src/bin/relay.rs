//! Live Relay demo application
//!
//! Streams a synthetic test pattern and tone to the endpoint stored in the
//! preferences file. Command line flags update the stored preferences first.
//!
//! ```text
//! relay [--protocol rtmp|tcp|ws] [--host HOST] [--audio|--no-audio] [--seconds N] [--dry-run]
//! ```
//!
//! Live runs go through the raw TCP backend, so only `tcp` targets work
//! without `--dry-run`; `--host` on its own selects `tcp`.

use anyhow::{bail, Context, Result};
use parking_lot::Mutex;
use std::f32::consts::TAU;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use live_relay::{
    codec::{LoopbackBackend, MediaBackend, RawTcpBackend},
    config::{AudioConfig, Preferences, SampleFormat, StreamProtocol, VideoConfig},
    endpoint::{AudioSource, Endpoint, StateDebouncer, StreamTargets, VideoSource},
    media::{packed_planes, CapturedImage, SampleBuffer},
    relay::{FrameSurface, SampleRelay},
    store::{ConfigStore, EditResult, MemoryStorage},
};

#[derive(Debug, Default, Clone, PartialEq)]
struct Args {
    protocol: Option<StreamProtocol>,
    host: Option<String>,
    /// `--audio` / `--no-audio`; unset keeps the stored choice
    audio: Option<bool>,
    seconds: Option<u64>,
    dry_run: bool,
}

impl Args {
    fn edits_preferences(&self) -> bool {
        self.protocol.is_some() || self.host.is_some() || self.audio.is_some()
    }

    /// Fail before saving anything the live backend could not connect to
    fn check_protocol(&self) -> Result<()> {
        match self.protocol {
            Some(protocol) if !self.dry_run && protocol != StreamProtocol::Tcp => {
                bail!("Protocol {} needs --dry-run; live runs only support tcp", protocol)
            }
            _ => Ok(()),
        }
    }

    /// Stored record with the command line overrides applied
    fn apply(&self, current: &Preferences) -> Preferences {
        let protocol = match (self.protocol, &self.host) {
            (Some(protocol), _) => protocol,
            (None, Some(_)) if !self.dry_run => StreamProtocol::Tcp,
            (None, _) => current.protocol,
        };
        Preferences {
            protocol,
            host: self.host.clone().unwrap_or_else(|| current.host.clone()),
            audio_enabled: self.audio.unwrap_or(current.audio_enabled),
            ..current.clone()
        }
    }
}

/// Stored preferences must name a protocol the selected backend carries
fn check_backend(prefs: &Preferences, dry_run: bool) -> Result<()> {
    if !dry_run && prefs.protocol != StreamProtocol::Tcp {
        bail!(
            "Stored protocol is {}; live runs only support tcp (pass --protocol tcp or --dry-run)",
            prefs.protocol
        );
    }
    Ok(())
}

fn parse_args(raw: impl IntoIterator<Item = String>) -> Result<Args> {
    let mut args = Args::default();
    let mut iter = raw.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--protocol" => {
                let value = iter.next().context("--protocol needs a value")?;
                args.protocol = Some(value.parse()?);
            }
            "--host" => args.host = Some(iter.next().context("--host needs a value")?),
            "--seconds" => {
                let value = iter.next().context("--seconds needs a value")?;
                args.seconds = Some(value.parse().context("invalid --seconds")?);
            }
            "--audio" => args.audio = Some(true),
            "--no-audio" => args.audio = Some(false),
            "--dry-run" => args.dry_run = true,
            other => bail!("Unknown argument: {}", other),
        }
    }
    Ok(args)
}

/// Moving-bar test pattern pushed at the configured frame rate
struct TestPattern {
    config: VideoConfig,
    surface: Arc<Mutex<Option<FrameSurface>>>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TestPattern {
    fn new(config: VideoConfig) -> Self {
        Self {
            config,
            surface: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }
}

impl VideoSource for TestPattern {
    fn bind(&self, surface: FrameSurface) {
        *self.surface.lock() = Some(surface);
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let config = self.config.clone();
        let slot = self.surface.clone();
        let running = self.running.clone();
        let spawned = std::thread::Builder::new()
            .name("test-pattern".into())
            .spawn(move || {
                let interval = Duration::from_secs(1) / config.frame_rate.max(1);
                let epoch = Instant::now();
                let mut frame = 0u64;
                while running.load(Ordering::SeqCst) {
                    let surface = slot.lock().clone();
                    if let Some(surface) = surface {
                        let shade = (frame % 220) as u8 + 16;
                        let image = CapturedImage::new(
                            epoch.elapsed().as_micros() as i64,
                            config.width,
                            config.height,
                            config.pixel_format,
                            packed_planes(config.width, config.height, config.pixel_format, shade),
                        );
                        surface.submit(image);
                    }
                    frame += 1;
                    std::thread::sleep(interval);
                }
            });

        match spawned {
            Ok(handle) => *self.worker.lock() = Some(handle),
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                tracing::error!("Failed to spawn test pattern thread: {}", e);
            }
        }
    }

    fn unbind(&self) {
        *self.surface.lock() = None;
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

/// 440 Hz sine in 10 ms chunks
struct Tone {
    config: AudioConfig,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Tone {
    fn new(config: AudioConfig) -> Self {
        Self {
            config,
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        }
    }
}

impl AudioSource for Tone {
    fn bind(&self, relay: Arc<SampleRelay>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let config = self.config.clone();
        let running = self.running.clone();
        let spawned = std::thread::Builder::new()
            .name("tone".into())
            .spawn(move || {
                let frames = (config.sample_rate / 100) as usize;
                let channels = config.channels as usize;
                let mut chunk = Vec::with_capacity(frames * config.bytes_per_frame());
                let mut phase = 0f32;
                let step = TAU * 440.0 / config.sample_rate as f32;
                let mut timestamp_us = 0i64;

                while running.load(Ordering::SeqCst) {
                    chunk.clear();
                    for _ in 0..frames {
                        let value = phase.sin() * 0.2;
                        phase = (phase + step) % TAU;
                        for _ in 0..channels {
                            match config.sample_format {
                                SampleFormat::S16 => chunk
                                    .extend_from_slice(&((value * i16::MAX as f32) as i16).to_le_bytes()),
                                SampleFormat::F32 => chunk.extend_from_slice(&value.to_le_bytes()),
                            }
                        }
                    }

                    let buffer = SampleBuffer::for_config(&chunk, timestamp_us, &config);
                    if let Err(e) = relay.send(&buffer) {
                        tracing::warn!("Audio send failed: {}", e);
                    }
                    timestamp_us += buffer.duration_us() as i64;
                    std::thread::sleep(Duration::from_millis(10));
                }
            });

        match spawned {
            Ok(handle) => *self.worker.lock() = Some(handle),
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                tracing::error!("Failed to spawn tone thread: {}", e);
            }
        }
    }

    fn unbind(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = parse_args(std::env::args().skip(1))?;
    args.check_protocol()?;
    tracing::info!("Starting Live Relay");

    let store = if args.dry_run {
        ConfigStore::new(MemoryStorage::default())
    } else {
        ConfigStore::open_default()
    };

    if args.edits_preferences() {
        let overrides = args.clone();
        let result = store.edit(move |current| overrides.apply(current)).await;
        if let EditResult::FailWrite(e) = result {
            bail!("Could not save preferences: {}", e);
        }
    }

    let prefs = store.snapshot().await?;
    if prefs.host.is_empty() {
        bail!("No host configured; pass --host");
    }
    check_backend(&prefs, args.dry_run)?;
    tracing::info!("Target: {}://{}", prefs.protocol, prefs.host);

    let backend: Arc<dyn MediaBackend> = if args.dry_run {
        Arc::new(LoopbackBackend::new())
    } else {
        Arc::new(RawTcpBackend::new())
    };
    tracing::info!("Using {} backend", backend.name());

    let endpoint = Arc::new(Endpoint::new(backend));
    let mut debouncer = StateDebouncer::new(endpoint.subscribe());
    tokio::spawn(async move {
        while let Some(state) = debouncer.next().await {
            tracing::info!("Endpoint state: {}", state);
        }
    });

    let targets = StreamTargets {
        video: Some(Arc::new(TestPattern::new(prefs.video.clone()))),
        audio: Some(Arc::new(Tone::new(prefs.audio.clone()))),
    };
    endpoint
        .start_from_preferences(&prefs, targets)
        .await
        .context("Failed to start streaming")?;

    tracing::info!("Streaming - press Ctrl+C to stop");
    match args.seconds {
        Some(seconds) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = tokio::time::sleep(Duration::from_secs(seconds)) => {}
            }
        }
        None => tokio::signal::ctrl_c().await?,
    }

    endpoint.stop().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Args> {
        parse_args(args.iter().map(|a| a.to_string()))
    }

    fn stored() -> Preferences {
        Preferences {
            protocol: StreamProtocol::Tcp,
            host: "192.0.2.10:9000".into(),
            audio_enabled: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_audio_flags_toggle_both_ways() {
        let on = parse(&["--audio"]).unwrap();
        assert!(on.edits_preferences());
        assert!(on.apply(&stored()).audio_enabled);

        let off = parse(&["--no-audio"]).unwrap();
        let enabled = Preferences {
            audio_enabled: true,
            ..stored()
        };
        assert!(!off.apply(&enabled).audio_enabled);

        // no flag keeps the stored choice
        let none = parse(&["--seconds", "5"]).unwrap();
        assert!(!none.edits_preferences());
        assert!(!none.apply(&stored()).audio_enabled);
    }

    #[test]
    fn test_host_alone_selects_tcp() {
        let args = parse(&["--host", "198.51.100.4:9000"]).unwrap();
        let current = Preferences::default();
        let next = args.apply(&current);
        assert_eq!(next.protocol, StreamProtocol::Tcp);
        assert_eq!(next.host, "198.51.100.4:9000");
        assert!(check_backend(&next, false).is_ok());
    }

    #[test]
    fn test_live_run_rejects_other_protocols() {
        let args = parse(&["--protocol", "rtmp", "--host", "ingest.example.net"]).unwrap();
        assert!(args.check_protocol().is_err());

        let dry = parse(&["--protocol", "rtmp", "--dry-run"]).unwrap();
        assert!(dry.check_protocol().is_ok());

        let stored_rtmp = Preferences {
            protocol: StreamProtocol::Rtmp,
            ..stored()
        };
        assert!(check_backend(&stored_rtmp, false).is_err());
        assert!(check_backend(&stored_rtmp, true).is_ok());
    }

    #[test]
    fn test_unknown_argument_fails() {
        assert!(parse(&["--loud"]).is_err());
        assert!(parse(&["--seconds"]).is_err());
    }
}
