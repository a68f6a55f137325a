//! Raw TCP muxer
//!
//! Carries uncompressed planes and PCM chunks over a plain TCP socket, for
//! ingest endpoints that accept raw media (local streaming software, test
//! rigs). Every packet is
//!
//! ```text
//! [stream index u8][kind u8][timestamp_us i64 BE][payload len u32 BE][payload]
//! ```
//!
//! Header packets describing each stream are written right after connect.

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use socket2::{SockRef, TcpKeepalive};
use std::io::Write;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use super::{AudioEncoderStream, EncoderStream, MediaBackend, MuxSession, VideoEncoderStream};
use crate::config::{AudioConfig, StreamProtocol, TransportTarget, VideoConfig};
use crate::error::{ConnectError, EncoderError};
use crate::media::{FrameBuffer, SampleBuffer};

/// Packet kinds
pub mod kind {
    pub const VIDEO_HEADER: u8 = 0x00;
    pub const AUDIO_HEADER: u8 = 0x01;
    pub const VIDEO_FRAME: u8 = 0x10;
    pub const AUDIO_CHUNK: u8 = 0x11;
}

/// Bytes preceding every payload
pub const PACKET_HEADER_LEN: usize = 1 + 1 + 8 + 4;

const KEEPALIVE_TIME: Duration = Duration::from_secs(10);
/// A peer that stops reading fails the write after this long
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Backend producing [`RawTcpSession`]s. Only `StreamProtocol::Tcp` targets
/// can be connected.
#[derive(Debug, Default, Clone)]
pub struct RawTcpBackend;

impl RawTcpBackend {
    pub fn new() -> Self {
        Self
    }
}

impl MediaBackend for RawTcpBackend {
    fn name(&self) -> &str {
        "raw-tcp"
    }

    fn create_session(&self, target: &TransportTarget) -> Result<Box<dyn MuxSession>, EncoderError> {
        Ok(Box::new(RawTcpSession::new(target.clone())))
    }
}

type SharedSocket = Arc<Mutex<Option<TcpStream>>>;

pub struct RawTcpSession {
    target: TransportTarget,
    socket: SharedSocket,
    /// Second handle on the connected socket. Shutting it down does not wait
    /// for the socket lock a blocked writer may be holding.
    control: Option<TcpStream>,
    /// Stream header packets, replayed on every connect
    headers: Vec<Bytes>,
    next_index: usize,
}

impl RawTcpSession {
    pub fn new(target: TransportTarget) -> Self {
        Self {
            target,
            socket: Arc::new(Mutex::new(None)),
            control: None,
            headers: Vec::new(),
            next_index: 0,
        }
    }

    fn allocate_index(&mut self) -> Result<u8, EncoderError> {
        let index = u8::try_from(self.next_index)
            .map_err(|_| EncoderError::StreamInit("too many streams".into()))?;
        self.next_index += 1;
        Ok(index)
    }
}

impl MuxSession for RawTcpSession {
    fn add_video_stream(
        &mut self,
        config: &VideoConfig,
    ) -> Result<Box<dyn VideoEncoderStream>, EncoderError> {
        let index = self.allocate_index()?;
        self.headers.push(encode_video_header(index, config));
        Ok(Box::new(RawTcpStream::new(index, self.socket.clone())))
    }

    fn add_audio_stream(
        &mut self,
        config: &AudioConfig,
    ) -> Result<Box<dyn AudioEncoderStream>, EncoderError> {
        let index = self.allocate_index()?;
        self.headers.push(encode_audio_header(index, config));
        Ok(Box::new(RawTcpStream::new(index, self.socket.clone())))
    }

    fn connect(&mut self) -> Result<(), ConnectError> {
        if self.target.protocol != StreamProtocol::Tcp {
            return Err(ConnectError::UnsupportedProtocol(self.target.protocol.to_string()));
        }

        let authority = self.target.authority();
        let addrs: Vec<_> = authority
            .to_socket_addrs()
            .map_err(|_| ConnectError::Resolve(authority.clone()))?
            .collect();
        if addrs.is_empty() {
            return Err(ConnectError::Resolve(authority));
        }

        let mut last_error = None;
        let mut stream = None;
        for addr in &addrs {
            match TcpStream::connect(addr) {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => last_error = Some(e),
            }
        }
        let mut stream = stream.ok_or_else(|| ConnectError::ConnectionFailed {
            target: authority.clone(),
            reason: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })?;

        configure_socket(&stream);

        for header in &self.headers {
            stream
                .write_all(header)
                .map_err(|e| ConnectError::ConnectionFailed {
                    target: authority.clone(),
                    reason: format!("stream header write: {}", e),
                })?;
        }

        self.control = match stream.try_clone() {
            Ok(control) => Some(control),
            Err(e) => {
                tracing::warn!("Failed to clone socket handle for {}: {}", self.target, e);
                None
            }
        };

        tracing::info!("Connected to {} ({} streams)", self.target, self.headers.len());
        *self.socket.lock() = Some(stream);
        Ok(())
    }

    fn disconnect(&mut self) -> Result<(), ConnectError> {
        // Shut down first so a writer stuck on the peer fails and lets go of the lock
        let shutdown = match self.control.take() {
            Some(control) => {
                let result = control.shutdown(Shutdown::Both);
                self.socket.lock().take();
                Some(result)
            }
            None => self.socket.lock().take().map(|stream| stream.shutdown(Shutdown::Both)),
        };

        match shutdown {
            None => Ok(()),
            Some(result) => {
                match result {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotConnected => {}
                    Err(e) => return Err(ConnectError::DisconnectFailed(e.to_string())),
                }
                tracing::info!("Disconnected from {}", self.target);
                Ok(())
            }
        }
    }

    fn release(&mut self) {
        self.control.take();
        self.socket.lock().take();
        self.headers.clear();
    }
}

fn configure_socket(stream: &TcpStream) {
    let sock = SockRef::from(stream);
    if let Err(e) = sock.set_nodelay(true) {
        tracing::warn!("Failed to set TCP_NODELAY: {}", e);
    }
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_TIME);
    if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
        tracing::warn!("Failed to enable keepalive: {}", e);
    }
    if let Err(e) = sock.set_write_timeout(Some(WRITE_TIMEOUT)) {
        tracing::warn!("Failed to set write timeout: {}", e);
    }
}

/// One track of a [`RawTcpSession`]
pub struct RawTcpStream {
    index: u8,
    socket: SharedSocket,
    started: bool,
    released: bool,
    /// Packet buffer (reused to avoid allocations)
    packet: BytesMut,
    packets_sent: u64,
    bytes_sent: u64,
}

impl RawTcpStream {
    fn new(index: u8, socket: SharedSocket) -> Self {
        Self {
            index,
            socket,
            started: false,
            released: false,
            packet: BytesMut::new(),
            packets_sent: 0,
            bytes_sent: 0,
        }
    }

    fn write_packet(&mut self) -> Result<(), EncoderError> {
        if self.released {
            return Err(EncoderError::Released);
        }
        if !self.started {
            return Err(EncoderError::EncodingFailed("stream not started".into()));
        }
        let mut guard = self.socket.lock();
        let socket = guard.as_mut().ok_or(EncoderError::NotConnected)?;
        if let Err(e) = socket.write_all(&self.packet) {
            // a partial packet leaves the byte stream unframed
            guard.take();
            tracing::warn!("Stream {} lost its connection: {}", self.index, e);
            return Err(EncoderError::EncodingFailed(e.to_string()));
        }
        self.packets_sent += 1;
        self.bytes_sent += self.packet.len() as u64;
        Ok(())
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            packets_sent: self.packets_sent,
            bytes_sent: self.bytes_sent,
        }
    }
}

impl EncoderStream for RawTcpStream {
    fn index(&self) -> usize {
        self.index as usize
    }

    fn start(&mut self) -> Result<(), EncoderError> {
        if self.released {
            return Err(EncoderError::Released);
        }
        self.started = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), EncoderError> {
        self.started = false;
        Ok(())
    }

    fn release(&mut self) {
        self.started = false;
        self.released = true;
        self.packet = BytesMut::new();
    }
}

impl VideoEncoderStream for RawTcpStream {
    fn send_frame(&mut self, frame: &FrameBuffer<'_>) -> Result<(), EncoderError> {
        self.packet.clear();
        write_video_packet(&mut self.packet, self.index, frame);
        self.write_packet()
    }
}

impl AudioEncoderStream for RawTcpStream {
    fn send_samples(&mut self, chunk: &SampleBuffer<'_>) -> Result<(), EncoderError> {
        self.packet.clear();
        write_audio_packet(&mut self.packet, self.index, chunk);
        self.write_packet()
    }
}

/// Per-stream transmit counters
#[derive(Debug, Clone, Default)]
pub struct StreamStats {
    pub packets_sent: u64,
    pub bytes_sent: u64,
}

fn put_header(buf: &mut BytesMut, index: u8, kind: u8, timestamp_us: i64, payload_len: usize) {
    buf.reserve(PACKET_HEADER_LEN + payload_len);
    buf.put_u8(index);
    buf.put_u8(kind);
    buf.put_i64(timestamp_us);
    buf.put_u32(payload_len as u32);
}

pub fn encode_video_header(index: u8, config: &VideoConfig) -> Bytes {
    let mut buf = BytesMut::new();
    put_header(&mut buf, index, kind::VIDEO_HEADER, 0, 4 + 4 + 1 + 4 + 4 + 4);
    buf.put_u32(config.width);
    buf.put_u32(config.height);
    buf.put_u8(config.pixel_format.as_u8());
    buf.put_u32(config.bitrate);
    buf.put_u32(config.frame_rate);
    buf.put_u32(config.keyframe_interval);
    buf.freeze()
}

pub fn encode_audio_header(index: u8, config: &AudioConfig) -> Bytes {
    let mut buf = BytesMut::new();
    put_header(&mut buf, index, kind::AUDIO_HEADER, 0, 4 + 2 + 1 + 4);
    buf.put_u32(config.sample_rate);
    buf.put_u16(config.channels);
    buf.put_u8(config.sample_format.as_u8());
    buf.put_u32(config.bitrate);
    buf.freeze()
}

/// Serialize a frame: dimensions, format, then each plane with its strides.
pub fn write_video_packet(buf: &mut BytesMut, index: u8, frame: &FrameBuffer<'_>) {
    let planes = frame.planes();
    let payload_len = 4 + 4 + 1 + 1 + planes.iter().map(|p| 12 + p.data.len()).sum::<usize>();
    put_header(buf, index, kind::VIDEO_FRAME, frame.timestamp_us, payload_len);
    buf.put_u32(frame.width);
    buf.put_u32(frame.height);
    buf.put_u8(frame.format.as_u8());
    buf.put_u8(planes.len() as u8);
    for plane in planes {
        buf.put_u32(plane.row_stride as u32);
        buf.put_u32(plane.pixel_stride as u32);
        buf.put_u32(plane.data.len() as u32);
        buf.put_slice(plane.data);
    }
}

pub fn write_audio_packet(buf: &mut BytesMut, index: u8, chunk: &SampleBuffer<'_>) {
    let payload_len = 4 + 2 + 1 + 4 + chunk.data.len();
    put_header(buf, index, kind::AUDIO_CHUNK, chunk.timestamp_us, payload_len);
    buf.put_u32(chunk.sample_rate);
    buf.put_u16(chunk.channels);
    buf.put_u8(chunk.format.as_u8());
    buf.put_u32(chunk.frame_count as u32);
    buf.put_slice(chunk.data);
}
