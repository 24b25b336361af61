//! Video frame data structures

use super::format::{PixelFormat, Resolution};

/// A captured frame, borrowed from the capture buffer it lives in
///
/// Only valid while that buffer is acquired: the pipeline hands it to every
/// sink and requeues the buffer afterwards.
#[derive(Debug, Clone, Copy)]
pub struct CapturedFrame<'a> {
    /// Bytes filled by the driver
    pub data: &'a [u8],
    /// Pixel format
    pub format: PixelFormat,
    /// Frame resolution
    pub resolution: Resolution,
    /// Driver sequence number
    pub sequence: u64,
}

impl<'a> CapturedFrame<'a> {
    pub fn new(data: &'a [u8], format: PixelFormat, resolution: Resolution, sequence: u64) -> Self {
        Self {
            data,
            format,
            resolution,
            sequence,
        }
    }

    /// Get data length
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether the driver filled a whole frame
    pub fn is_complete(&self) -> bool {
        self.format
            .frame_size(self.resolution)
            .map_or(!self.data.is_empty(), |size| self.data.len() >= size)
    }
}
