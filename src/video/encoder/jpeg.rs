//! JPEG encoder implementation
//!
//! Encodes I420 frames with turbojpeg's YUV encoder, which skips the
//! internal color space conversion. Captured 4:2:2 frames are converted to
//! I420 by the conversion engine directly into the input buffer.

use super::traits::{EncoderConfig, FrameEncoder};
use crate::error::{AppError, Result};
use crate::video::format::{PixelFormat, Resolution};

/// JPEG encoder using turbojpeg
///
/// ```text
/// UYVY/YUYV ──convert──> I420 (input buffer) ──turbojpeg──> JPEG (output)
/// ```
///
/// Note: This encoder is NOT thread-safe due to turbojpeg limitations.
pub struct JpegEncoder {
    config: EncoderConfig,
    compressor: turbojpeg::Compressor,
    /// I420 input (Y + U + V planes)
    i420_buffer: Vec<u8>,
    output: Vec<u8>,
}

impl JpegEncoder {
    pub fn new(config: EncoderConfig) -> Result<Self> {
        if !config.resolution.is_subsampling_aligned() {
            return Err(AppError::VideoError(format!(
                "JPEG encoder needs even dimensions, got {}",
                config.resolution
            )));
        }
        let i420_size = config.resolution.yuv420_size();

        let mut compressor = turbojpeg::Compressor::new().map_err(|e| {
            AppError::VideoError(format!("Failed to create turbojpeg compressor: {}", e))
        })?;
        compressor
            .set_quality(config.quality as i32)
            .map_err(|e| AppError::VideoError(format!("Failed to set JPEG quality: {}", e)))?;

        Ok(Self {
            config,
            compressor,
            i420_buffer: vec![0u8; i420_size],
            output: Vec::new(),
        })
    }

    /// Create with specific quality
    pub fn with_quality(resolution: Resolution, quality: u32) -> Result<Self> {
        Self::new(EncoderConfig::jpeg(resolution, quality))
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }
}

impl FrameEncoder for JpegEncoder {
    fn name(&self) -> &str {
        "JPEG (turbojpeg)"
    }

    fn input_format(&self) -> PixelFormat {
        PixelFormat::Yuv420
    }

    fn output_format(&self) -> PixelFormat {
        PixelFormat::Mjpeg
    }

    fn input_buffer(&mut self) -> &mut [u8] {
        &mut self.i420_buffer
    }

    fn encode_current_input(&mut self) -> Result<()> {
        let yuv_image = turbojpeg::YuvImage {
            pixels: self.i420_buffer.as_slice(),
            width: self.config.resolution.width as usize,
            height: self.config.resolution.height as usize,
            align: 1,
            subsamp: turbojpeg::Subsamp::Sub2x2,
        };

        self.output = self
            .compressor
            .compress_yuv_to_vec(yuv_image)
            .map_err(|e| AppError::VideoError(format!("JPEG compression failed: {}", e)))?;
        Ok(())
    }

    fn output(&self) -> &[u8] {
        &self.output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_i420_buffer_size() {
        let mut encoder = JpegEncoder::with_quality(Resolution::VGA, 80).unwrap();
        assert_eq!(encoder.input_buffer().len(), 640 * 480 * 3 / 2);
        assert_eq!(encoder.output_len(), 0);
    }

    #[test]
    fn test_rejects_odd_resolution() {
        assert!(JpegEncoder::with_quality(Resolution::new(15, 16), 80).is_err());
    }

    #[test]
    fn test_encodes_gray_frame() {
        let mut encoder = JpegEncoder::with_quality(Resolution::new(16, 16), 90).unwrap();
        encoder.input_buffer().fill(128);
        encoder.encode_current_input().unwrap();

        let jpeg = encoder.output();
        assert!(encoder.output_len() > 4);
        // SOI ... EOI
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);
    }
}
