//! Audio chunks handed from the microphone source to the sample relay

use crate::config::{AudioConfig, SampleFormat};

/// One borrowed chunk of interleaved audio samples.
///
/// Valid only for the duration of the call it is passed to.
#[derive(Clone, Copy, Debug)]
pub struct SampleBuffer<'a> {
    pub data: &'a [u8],
    /// Capture timestamp in microseconds
    pub timestamp_us: i64,
    /// Sample frames in `data` (one frame = one sample per channel)
    pub frame_count: usize,
    pub sample_rate: u32,
    pub channels: u16,
    pub format: SampleFormat,
}

impl<'a> SampleBuffer<'a> {
    /// Build a chunk for `config`, deriving the frame count from the byte length
    pub fn for_config(data: &'a [u8], timestamp_us: i64, config: &AudioConfig) -> Self {
        let frame_bytes = config.bytes_per_frame().max(1);
        Self {
            data,
            timestamp_us,
            frame_count: data.len() / frame_bytes,
            sample_rate: config.sample_rate,
            channels: config.channels,
            format: config.sample_format,
        }
    }

    /// Chunk duration in microseconds
    pub fn duration_us(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.frame_count as u64).saturating_mul(1_000_000) / self.sample_rate as u64
    }

    /// Whether `data` holds exactly `frame_count` frames of the declared layout
    pub fn is_consistent(&self) -> bool {
        let frame_bytes = self.format.bytes_per_sample() * self.channels as usize;
        self.channels > 0
            && self
                .frame_count
                .checked_mul(frame_bytes)
                .is_some_and(|expected| expected == self.data.len())
    }
}
