//! Encoder traits and common types

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::video::format::{PixelFormat, Resolution};

/// Encoder selection for an encoded sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EncoderKind {
    /// libjpeg-turbo, I420 in, MJPEG out
    Jpeg {
        #[serde(default = "default_jpeg_quality")]
        quality: u32,
    },
}

fn default_jpeg_quality() -> u32 {
    80
}

impl EncoderKind {
    /// Codec produced by this encoder
    pub fn output_format(&self) -> PixelFormat {
        match self {
            EncoderKind::Jpeg { .. } => PixelFormat::Mjpeg,
        }
    }
}

impl Default for EncoderKind {
    fn default() -> Self {
        EncoderKind::Jpeg {
            quality: default_jpeg_quality(),
        }
    }
}

/// Encoder configuration
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// Frame resolution
    pub resolution: Resolution,
    /// Quality 1-100
    pub quality: u32,
}

impl EncoderConfig {
    pub fn jpeg(resolution: Resolution, quality: u32) -> Self {
        Self {
            resolution,
            quality: quality.clamp(1, 100),
        }
    }
}

/// Frame encoder with owned input and output buffers
///
/// One frame in the encoder's input format is written into
/// [`input_buffer`](FrameEncoder::input_buffer) before every
/// [`encode_current_input`](FrameEncoder::encode_current_input) call; after a
/// successful call exactly [`output_len`](FrameEncoder::output_len) bytes of
/// [`output`](FrameEncoder::output) are valid.
///
/// Note: Not Sync because turbojpeg handles are not thread-safe
pub trait FrameEncoder: Send {
    /// Get encoder name
    fn name(&self) -> &str;

    /// Raw format expected in the input buffer
    fn input_format(&self) -> PixelFormat;

    /// Codec written to the output buffer
    fn output_format(&self) -> PixelFormat;

    /// Input buffer, sized for exactly one frame
    fn input_buffer(&mut self) -> &mut [u8];

    /// Encode whatever frame is in the input buffer
    fn encode_current_input(&mut self) -> Result<()>;

    /// Output of the last successful encode
    fn output(&self) -> &[u8];

    fn output_len(&self) -> usize {
        self.output().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Identity {
        input: Vec<u8>,
        output: Vec<u8>,
    }

    impl FrameEncoder for Identity {
        fn name(&self) -> &str {
            "identity"
        }

        fn input_format(&self) -> PixelFormat {
            PixelFormat::Yuv420
        }

        fn output_format(&self) -> PixelFormat {
            PixelFormat::Yuv420
        }

        fn input_buffer(&mut self) -> &mut [u8] {
            &mut self.input
        }

        fn encode_current_input(&mut self) -> Result<()> {
            self.output = self.input.clone();
            Ok(())
        }

        fn output(&self) -> &[u8] {
            &self.output
        }
    }

    #[test]
    fn test_output_len_defaults_to_output() {
        let mut encoder = Identity {
            input: vec![0; 4],
            output: Vec::new(),
        };

        encoder.input_buffer().copy_from_slice(&[1, 2, 3, 4]);
        encoder.encode_current_input().unwrap();
        assert_eq!(encoder.output(), &[1, 2, 3, 4]);
        assert_eq!(encoder.output_len(), 4);
    }

    #[test]
    fn test_encoder_kind_serde() {
        let kind: EncoderKind = serde_json::from_str(r#"{"type":"jpeg"}"#).unwrap();
        assert_eq!(kind, EncoderKind::Jpeg { quality: 80 });
        assert_eq!(kind.output_format(), PixelFormat::Mjpeg);

        let kind: EncoderKind = serde_json::from_str(r#"{"type":"jpeg","quality":55}"#).unwrap();
        assert_eq!(kind, EncoderKind::Jpeg { quality: 55 });
    }

    #[test]
    fn test_quality_clamped() {
        assert_eq!(EncoderConfig::jpeg(Resolution::VGA, 0).quality, 1);
        assert_eq!(EncoderConfig::jpeg(Resolution::VGA, 250).quality, 100);
    }
}
