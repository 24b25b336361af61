//! Video capture, conversion and fan-out
//!
//! This module provides V4L2 device handling, pixel format conversion,
//! frame encoders and the capture-to-sinks pipeline.

pub mod buffer_pool;
pub mod convert;
pub mod device;
pub mod encoder;
pub mod format;
pub mod frame;
pub mod pipeline;
pub mod sink;
pub mod v4l2;

pub use buffer_pool::{AcquiredBuffer, BufferPool, Direction, RawQueue};
pub use convert::{convert, convert_into, ConvertError};
pub use device::DeviceHandle;
pub use encoder::{FrameEncoder, JpegEncoder};
pub use format::{PixelFormat, Resolution};
pub use frame::CapturedFrame;
pub use pipeline::{Pipeline, PipelineState, PipelineStats};
pub use sink::{Sink, SinkStats};
pub use v4l2::V4l2Queue;
