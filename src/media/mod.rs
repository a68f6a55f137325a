//! Media buffer types shared by capture sources, relays and encoders

pub mod frame;
pub mod sample;

pub use frame::{packed_planes, CapturedImage, FrameBuffer, Plane, PlaneData};
pub use sample::SampleBuffer;
