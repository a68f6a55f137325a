//! End-to-end runs of the endpoint against both bundled backends

use parking_lot::Mutex;
use std::io::Read;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::{Duration, Instant};

use live_relay::codec::tcp::{kind, PACKET_HEADER_LEN};
use live_relay::codec::{LoopbackBackend, LoopbackEvent, RawTcpBackend};
use live_relay::config::{PixelFormat, StreamProtocol, VideoConfig};
use live_relay::endpoint::{Endpoint, EndpointState, StartRequest, StreamTargets, VideoSource};
use live_relay::media::{packed_planes, CapturedImage};
use live_relay::relay::FrameSurface;

#[derive(Default)]
struct Camera {
    surface: Mutex<Option<FrameSurface>>,
}

impl Camera {
    fn surface(&self) -> FrameSurface {
        self.surface.lock().clone().expect("camera not bound")
    }
}

impl VideoSource for Camera {
    fn bind(&self, surface: FrameSurface) {
        *self.surface.lock() = Some(surface);
    }

    fn unbind(&self) {
        *self.surface.lock() = None;
    }
}

fn image(timestamp_us: i64, width: u32, height: u32) -> CapturedImage {
    CapturedImage::new(
        timestamp_us,
        width,
        height,
        PixelFormat::Yuv420p,
        packed_planes(width, height, PixelFormat::Yuv420p, (timestamp_us % 200) as u8),
    )
}

/// Submit only once the worker has drained the queue, so nothing is evicted
async fn submit_paced(surface: &FrameSurface, image: CapturedImage) {
    while surface.queued() > 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert!(surface.submit(image));
}

async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_thirty_frames_in_order_then_release() {
    let backend = LoopbackBackend::new();
    let log = backend.log();
    let endpoint = Endpoint::new(Arc::new(backend));
    let camera = Arc::new(Camera::default());
    let targets = StreamTargets {
        video: Some(camera.clone()),
        audio: None,
    };

    let request = StartRequest::new(StreamProtocol::Tcp, "203.0.113.5").with_video(VideoConfig::new(1280, 720));
    endpoint.start(request, targets).await.unwrap();
    assert_eq!(endpoint.state(), EndpointState::Started);

    let surface = camera.surface();
    let expected: Vec<i64> = (0..30).map(|n| 1_000 + n * 33_333).collect();
    for &timestamp in &expected {
        submit_paced(&surface, image(timestamp, 1280, 720)).await;
    }

    assert!(wait_until(Duration::from_secs(5), || log.frame_timestamps(0).len() == 30).await);
    assert_eq!(log.frame_timestamps(0), expected);

    endpoint.stop().await;
    assert_eq!(endpoint.state(), EndpointState::Stopped);
    assert!(surface.is_closed());
    assert_eq!(log.count(|e| matches!(e, LoopbackEvent::StreamReleased(0))), 1);
    assert_eq!(log.count(|e| matches!(e, LoopbackEvent::Disconnected)), 1);
    assert_eq!(log.count(|e| matches!(e, LoopbackEvent::SessionReleased)), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_burst_under_backpressure_keeps_order() {
    let backend = LoopbackBackend::new().frame_delay(Duration::from_millis(5));
    let log = backend.log();
    let endpoint = Endpoint::new(Arc::new(backend));
    let camera = Arc::new(Camera::default());
    let targets = StreamTargets {
        video: Some(camera.clone()),
        audio: None,
    };

    let request = StartRequest::new(StreamProtocol::Rtmp, "ingest.example.net").with_video(VideoConfig::new(320, 240));
    endpoint.start(request, targets).await.unwrap();

    let surface = camera.surface();
    for n in 0..100 {
        surface.submit(image(n, 320, 240));
        assert!(surface.queued() < surface.max_images());
    }
    assert!(wait_until(Duration::from_secs(5), || surface.queued() == 0).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let forwarded = log.frame_timestamps(0);
    assert!(!forwarded.is_empty());
    assert!(forwarded.len() < 100);
    assert!(forwarded.windows(2).all(|w| w[0] < w[1]));
    // the newest image is never the one evicted
    assert_eq!(forwarded.last(), Some(&99));

    endpoint.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_raw_tcp_delivers_packets() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let (packets_tx, packets_rx) = crossbeam_channel::unbounded::<(u8, u8, i64)>();

    let reader = std::thread::spawn(move || {
        let (mut socket, _) = listener.accept().unwrap();
        let mut header = [0u8; PACKET_HEADER_LEN];
        while socket.read_exact(&mut header).is_ok() {
            let index = header[0];
            let kind = header[1];
            let timestamp = i64::from_be_bytes(header[2..10].try_into().unwrap());
            let len = u32::from_be_bytes(header[10..14].try_into().unwrap()) as usize;
            let mut payload = vec![0u8; len];
            if socket.read_exact(&mut payload).is_err() {
                break;
            }
            if packets_tx.send((index, kind, timestamp)).is_err() {
                break;
            }
        }
    });

    let endpoint = Endpoint::new(Arc::new(RawTcpBackend::new()));
    let camera = Arc::new(Camera::default());
    let targets = StreamTargets {
        video: Some(camera.clone()),
        audio: None,
    };
    let request = StartRequest::new(StreamProtocol::Tcp, format!("127.0.0.1:{}", port))
        .with_video(VideoConfig::new(320, 240));
    endpoint.start(request, targets).await.unwrap();

    let surface = camera.surface();
    for n in 0..5 {
        submit_paced(&surface, image(n * 1_000, 320, 240)).await;
    }

    let mut frames = Vec::new();
    let first = packets_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!((first.0, first.1), (0, kind::VIDEO_HEADER));
    while frames.len() < 5 {
        let (index, packet_kind, timestamp) = packets_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(index, 0);
        assert_eq!(packet_kind, kind::VIDEO_FRAME);
        frames.push(timestamp);
    }
    assert_eq!(frames, vec![0, 1_000, 2_000, 3_000, 4_000]);

    endpoint.stop().await;
    assert_eq!(endpoint.state(), EndpointState::Stopped);
    reader.join().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_returns_when_peer_stops_reading() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);
    let peer = std::thread::spawn(move || {
        let (mut socket, _) = listener.accept().unwrap();
        let mut header = [0u8; PACKET_HEADER_LEN];
        let _ = socket.read_exact(&mut header);
        // stall with the connection open
        let _ = done_rx.recv();
    });

    let endpoint = Endpoint::new(Arc::new(RawTcpBackend::new()));
    let camera = Arc::new(Camera::default());
    let targets = StreamTargets {
        video: Some(camera.clone()),
        audio: None,
    };
    let request = StartRequest::new(StreamProtocol::Tcp, format!("127.0.0.1:{}", port))
        .with_video(VideoConfig::new(1280, 720));
    endpoint.start(request, targets).await.unwrap();

    let surface = camera.surface();
    for n in 0..100 {
        surface.submit(image(n * 10_000, 1280, 720));
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let stopped = tokio::time::timeout(Duration::from_secs(6), endpoint.stop()).await;
    assert!(stopped.is_ok(), "stop did not return");
    assert_eq!(endpoint.state(), EndpointState::Stopped);
    assert!(surface.is_closed());

    let _ = done_tx.send(());
    peer.join().unwrap();
}

#[tokio::test]
async fn test_raw_tcp_refuses_rtmp() {
    let endpoint = Endpoint::new(Arc::new(RawTcpBackend::new()));
    let request = StartRequest::new(StreamProtocol::Rtmp, "127.0.0.1").with_video(VideoConfig::new(320, 240));

    assert!(endpoint.start(request, StreamTargets::default()).await.is_err());
    assert_eq!(endpoint.state(), EndpointState::Stopped);
    assert!(endpoint.last_error().unwrap().contains("not supported"));
}
