//! Captured video images and the borrowed frame view handed to encoders

use bytes::Bytes;
use std::fmt;

use crate::config::PixelFormat;
use crate::constants::MAX_PLANES;

/// One plane of a captured image as delivered by the capture source
#[derive(Clone, Debug)]
pub struct PlaneData {
    pub data: Bytes,
    /// Bytes between the starts of two consecutive rows
    pub row_stride: usize,
    /// Bytes between two horizontally adjacent pixels of this plane
    pub pixel_stride: usize,
}

impl PlaneData {
    pub fn new(data: impl Into<Bytes>, row_stride: usize, pixel_stride: usize) -> Self {
        Self {
            data: data.into(),
            row_stride,
            pixel_stride,
        }
    }
}

type ReleaseHook = Box<dyn FnOnce() + Send>;

/// An image owned by the relay between capture and encoder handoff.
///
/// The release hook fires exactly once, when the image is dropped. The
/// relay drops images right after forwarding them, when it skips them, or
/// when they are evicted from a full queue, so capture sources can use the
/// hook to recycle their buffers.
pub struct CapturedImage {
    /// Capture timestamp in microseconds
    pub timestamp_us: i64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub planes: Vec<PlaneData>,
    release: Option<ReleaseHook>,
}

impl CapturedImage {
    pub fn new(
        timestamp_us: i64,
        width: u32,
        height: u32,
        format: PixelFormat,
        planes: Vec<PlaneData>,
    ) -> Self {
        Self {
            timestamp_us,
            width,
            height,
            format,
            planes,
            release: None,
        }
    }

    /// Attach a hook invoked when the relay is done with this image
    pub fn with_release(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.release = Some(Box::new(hook));
        self
    }

    /// Borrow the image as an encoder-ready frame.
    ///
    /// Returns `None` when the plane layout does not fit the pixel format:
    /// wrong plane count, more than [`MAX_PLANES`] planes, zero strides,
    /// strides whose extent overflows, or a plane too short for its rows.
    pub fn frame(&self) -> Option<FrameBuffer<'_>> {
        let count = self.planes.len();
        if count == 0 || count > MAX_PLANES || count != self.format.plane_count() {
            return None;
        }
        if self.width == 0 || self.height == 0 {
            return None;
        }

        let mut planes = [Plane::EMPTY; MAX_PLANES];
        for (index, (slot, plane)) in planes.iter_mut().zip(&self.planes).enumerate() {
            if plane.row_stride == 0 || plane.pixel_stride == 0 {
                return None;
            }
            let rows = self.plane_rows(index);
            let row_bytes = self.plane_width(index).checked_mul(plane.pixel_stride)?;
            if plane.row_stride < row_bytes {
                return None;
            }
            // last row does not need the full stride
            let required = plane
                .row_stride
                .checked_mul(rows - 1)?
                .checked_add(row_bytes)?;
            if plane.data.len() < required {
                return None;
            }
            *slot = Plane {
                data: &plane.data,
                row_stride: plane.row_stride,
                pixel_stride: plane.pixel_stride,
            };
        }

        Some(FrameBuffer {
            timestamp_us: self.timestamp_us,
            width: self.width,
            height: self.height,
            format: self.format,
            planes,
            plane_count: count,
        })
    }

    fn plane_rows(&self, index: usize) -> usize {
        let h = self.height as usize;
        if index > 0 && self.format.is_chroma_subsampled() {
            h.div_ceil(2)
        } else {
            h
        }
    }

    fn plane_width(&self, index: usize) -> usize {
        let w = self.width as usize;
        if index > 0 && self.format.is_chroma_subsampled() {
            w.div_ceil(2)
        } else {
            w
        }
    }
}

impl Drop for CapturedImage {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for CapturedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturedImage")
            .field("timestamp_us", &self.timestamp_us)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("planes", &self.planes.len())
            .finish()
    }
}

/// Borrowed view over a single plane
#[derive(Clone, Copy, Debug)]
pub struct Plane<'a> {
    pub data: &'a [u8],
    pub row_stride: usize,
    pub pixel_stride: usize,
}

impl Plane<'_> {
    const EMPTY: Plane<'static> = Plane {
        data: &[],
        row_stride: 0,
        pixel_stride: 0,
    };
}

/// A video frame borrowed from its [`CapturedImage`] for one encoder call
#[derive(Clone, Copy, Debug)]
pub struct FrameBuffer<'a> {
    pub timestamp_us: i64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    planes: [Plane<'a>; MAX_PLANES],
    plane_count: usize,
}

impl<'a> FrameBuffer<'a> {
    pub fn planes(&self) -> &[Plane<'a>] {
        &self.planes[..self.plane_count]
    }

    pub fn plane_count(&self) -> usize {
        self.plane_count
    }

    /// Total payload bytes across planes
    pub fn byte_len(&self) -> usize {
        self.planes().iter().map(|p| p.data.len()).sum()
    }
}

/// Tightly packed planes for a test or synthetic image
pub fn packed_planes(width: u32, height: u32, format: PixelFormat, fill: u8) -> Vec<PlaneData> {
    let w = width as usize;
    let h = height as usize;
    let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
    match format {
        PixelFormat::Yuv420p => vec![
            PlaneData::new(vec![fill; w * h], w, 1),
            PlaneData::new(vec![128u8; cw * ch], cw, 1),
            PlaneData::new(vec![128u8; cw * ch], cw, 1),
        ],
        PixelFormat::Nv12 | PixelFormat::Nv21 => vec![
            PlaneData::new(vec![fill; w * h], w, 1),
            PlaneData::new(vec![128u8; cw * 2 * ch], cw * 2, 2),
        ],
        PixelFormat::Rgba => vec![PlaneData::new(vec![fill; w * h * 4], w * 4, 4)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_frame_view_of_packed_yuv() {
        let image = CapturedImage::new(
            42,
            64,
            48,
            PixelFormat::Yuv420p,
            packed_planes(64, 48, PixelFormat::Yuv420p, 16),
        );
        let frame = image.frame().expect("valid layout");
        assert_eq!(frame.plane_count(), 3);
        assert_eq!(frame.timestamp_us, 42);
        assert_eq!(frame.planes()[0].data.len(), 64 * 48);
        assert_eq!(frame.byte_len(), 64 * 48 + 2 * 32 * 24);
    }

    #[test]
    fn test_frame_rejects_plane_mismatch() {
        let mut planes = packed_planes(64, 48, PixelFormat::Yuv420p, 0);
        planes.pop();
        let image = CapturedImage::new(0, 64, 48, PixelFormat::Yuv420p, planes);
        assert!(image.frame().is_none());

        let too_many = vec![PlaneData::new(vec![0u8; 16], 4, 1); MAX_PLANES + 1];
        let image = CapturedImage::new(0, 4, 4, PixelFormat::Rgba, too_many);
        assert!(image.frame().is_none());
    }

    #[test]
    fn test_frame_rejects_short_plane() {
        let planes = vec![PlaneData::new(vec![0u8; 10], 16, 4)];
        let image = CapturedImage::new(0, 4, 4, PixelFormat::Rgba, planes);
        assert!(image.frame().is_none());
    }

    #[test]
    fn test_frame_rejects_overflowing_strides() {
        let planes = vec![PlaneData::new(vec![0u8; 64], usize::MAX / 2, 4)];
        let image = CapturedImage::new(0, 4, 4, PixelFormat::Rgba, planes);
        assert!(image.frame().is_none());

        let planes = vec![PlaneData::new(vec![0u8; 64], usize::MAX, usize::MAX / 2)];
        let image = CapturedImage::new(0, 4, 4, PixelFormat::Rgba, planes);
        assert!(image.frame().is_none());
    }

    #[test]
    fn test_padded_stride_accepted() {
        // 4x2 RGBA with 32-byte rows, last row unpadded
        let planes = vec![PlaneData::new(vec![0u8; 32 + 16], 32, 4)];
        let image = CapturedImage::new(0, 4, 2, PixelFormat::Rgba, planes);
        assert!(image.frame().is_some());
    }

    #[test]
    fn test_release_hook_fires_once_on_drop() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let image = CapturedImage::new(0, 2, 2, PixelFormat::Rgba, packed_planes(2, 2, PixelFormat::Rgba, 0))
            .with_release(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        assert!(image.frame().is_some());
        assert_eq!(released.load(Ordering::SeqCst), 0);
        drop(image);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
