//! Packet assembly throughput for the raw TCP muxer

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use live_relay::codec::tcp::{write_audio_packet, write_video_packet};
use live_relay::config::{AudioConfig, PixelFormat};
use live_relay::media::{packed_planes, CapturedImage, SampleBuffer};

fn bench_video_packet(c: &mut Criterion) {
    let mut group = c.benchmark_group("video_packet");
    for (width, height) in [(640u32, 480u32), (1280, 720), (1920, 1080)] {
        let image = CapturedImage::new(
            0,
            width,
            height,
            PixelFormat::Yuv420p,
            packed_planes(width, height, PixelFormat::Yuv420p, 0x80),
        );
        let Some(frame) = image.frame() else {
            panic!("test frame {}x{} is malformed", width, height);
        };
        let mut buf = BytesMut::with_capacity(frame.byte_len() + 64);

        group.throughput(Throughput::Bytes(frame.byte_len() as u64));
        group.bench_function(format!("{}x{}", width, height), |b| {
            b.iter(|| {
                buf.clear();
                write_video_packet(&mut buf, 0, black_box(&frame));
                black_box(buf.len())
            })
        });
    }
    group.finish();
}

fn bench_audio_packet(c: &mut Criterion) {
    let config = AudioConfig::default();
    let data = vec![0u8; config.bytes_per_frame() * 480];
    let chunk = SampleBuffer::for_config(&data, 0, &config);
    let mut buf = BytesMut::with_capacity(data.len() + 64);

    c.bench_function("audio_packet_10ms", |b| {
        b.iter(|| {
            buf.clear();
            write_audio_packet(&mut buf, 1, black_box(&chunk));
            black_box(buf.len())
        })
    });
}

criterion_group!(benches, bench_video_packet, bench_audio_packet);
criterion_main!(benches);
