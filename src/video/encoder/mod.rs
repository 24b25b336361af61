//! Frame encoders for encoded sinks
//!
//! - `FrameEncoder`: input buffer in, bitstream out, one frame per call
//! - JPEG encoding for I420 frames (turbojpeg)

pub mod jpeg;
pub mod traits;

pub use jpeg::JpegEncoder;
pub use traits::{EncoderConfig, EncoderKind, FrameEncoder};

use crate::error::Result;
use crate::video::format::Resolution;

/// Build the encoder selected for a sink
pub fn create_encoder(kind: &EncoderKind, resolution: Resolution) -> Result<Box<dyn FrameEncoder>> {
    match kind {
        EncoderKind::Jpeg { quality } => {
            Ok(Box::new(JpegEncoder::with_quality(resolution, *quality)?))
        }
    }
}
