use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::error::{AppError, Result};
use crate::video::buffer_pool::MIN_BUFFERS;
use crate::video::encoder::EncoderKind;
use crate::video::format::{PixelFormat, Resolution};

/// Longest readiness wait `poll` is given, in milliseconds
pub const MAX_TIMEOUT_MS: u64 = u16::MAX as u64;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Capture device settings
    pub capture: CaptureConfig,
    /// Sinks, served in this order for every frame
    pub sinks: Vec<SinkConfig>,
    /// Loopback kernel module settings
    pub loopback: LoopbackConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            sinks: vec![
                SinkConfig {
                    name: "raw".to_string(),
                    device: "/dev/video3".to_string(),
                    format: PixelFormat::Yuv420,
                    encoder: None,
                    tee_path: None,
                    buffer_count: 4,
                },
                SinkConfig {
                    name: "mjpeg".to_string(),
                    device: "/dev/video4".to_string(),
                    format: PixelFormat::Mjpeg,
                    encoder: Some(EncoderKind::default()),
                    tee_path: Some("out.mjpeg".to_string()),
                    buffer_count: 4,
                },
            ],
            loopback: LoopbackConfig::default(),
        }
    }
}

impl AppConfig {
    /// Check the configuration before any device is touched
    pub fn validate(&self) -> Result<()> {
        self.capture.validate()?;

        if self.sinks.is_empty() {
            return Err(AppError::Config("at least one sink is required".to_string()));
        }

        let mut names = HashSet::new();
        for sink in &self.sinks {
            if !names.insert(sink.name.as_str()) {
                return Err(AppError::Config(format!(
                    "duplicate sink name '{}'",
                    sink.name
                )));
            }
            sink.validate(self.capture.format)?;
        }
        Ok(())
    }

    /// `video_nr` module parameter placing one loopback node per sink
    pub fn loopback_params(&self) -> String {
        let numbers: Vec<String> = (0..self.sinks.len() as u32)
            .map(|i| (self.loopback.base_device + i).to_string())
            .collect();
        format!("video_nr={}", numbers.join(","))
    }
}

/// Video capture configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CaptureConfig {
    /// Video device path (e.g., /dev/video0)
    pub device: String,
    /// Resolution width
    pub width: u32,
    /// Resolution height
    pub height: u32,
    /// Packed 4:2:2 capture format (UYVY or YUYV)
    pub format: PixelFormat,
    /// Number of mapped capture buffers
    pub buffer_count: u32,
    /// Readiness timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            width: 640,
            height: 480,
            format: PixelFormat::Uyvy,
            buffer_count: 4,
            timeout_ms: 2000,
        }
    }
}

impl CaptureConfig {
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if !self.resolution().is_subsampling_aligned() {
            return Err(AppError::Config(format!(
                "capture resolution {} must have positive even dimensions",
                self.resolution()
            )));
        }
        if !self.format.is_packed_422() {
            return Err(AppError::Config(format!(
                "capture format {} is not a packed 4:2:2 format",
                self.format
            )));
        }
        if self.buffer_count < MIN_BUFFERS {
            return Err(AppError::Config(format!(
                "capture buffer_count must be at least {}",
                MIN_BUFFERS
            )));
        }
        if self.timeout_ms == 0 || self.timeout_ms > MAX_TIMEOUT_MS {
            return Err(AppError::Config(format!(
                "capture timeout_ms must be between 1 and {}",
                MAX_TIMEOUT_MS
            )));
        }
        Ok(())
    }
}

/// One loopback sink
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SinkConfig {
    /// Name used in logs
    pub name: String,
    /// Output device path
    pub device: String,
    /// Format written to the device: raw pixel format or codec
    pub format: PixelFormat,
    /// Encoder for codec sinks, `None` for raw sinks
    #[serde(default)]
    pub encoder: Option<EncoderKind>,
    /// Optional file receiving a copy of every frame written to the device
    #[serde(default)]
    pub tee_path: Option<String>,
    /// Number of mapped output buffers
    #[serde(default = "default_sink_buffers")]
    pub buffer_count: u32,
}

fn default_sink_buffers() -> u32 {
    4
}

impl SinkConfig {
    fn validate(&self, capture_format: PixelFormat) -> Result<()> {
        let invalid = |reason: String| AppError::Config(format!("sink '{}': {}", self.name, reason));

        if self.buffer_count < MIN_BUFFERS {
            return Err(invalid(format!(
                "buffer_count must be at least {}",
                MIN_BUFFERS
            )));
        }

        match &self.encoder {
            Some(encoder) if encoder.output_format() != self.format => Err(invalid(format!(
                "encoder produces {} but the sink format is {}",
                encoder.output_format(),
                self.format
            ))),
            Some(_) => Ok(()),
            None if self.format.is_compressed() => {
                Err(invalid(format!("{} needs an encoder", self.format)))
            }
            None if self.format != capture_format && !self.format.is_420() => Err(invalid(
                format!("cannot convert {} to {}", capture_format, self.format),
            )),
            None => Ok(()),
        }
    }
}

/// Loopback kernel module configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoopbackConfig {
    /// Reload the module at startup
    pub enabled: bool,
    /// Module name, as listed in /proc/modules
    pub module_name: String,
    /// Path to the module image
    pub module_path: String,
    /// Device number of the first loopback node
    pub base_device: u32,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            module_name: "v4l2loopback".to_string(),
            module_path: "/usr/lib/v4l2loopback.ko".to_string(),
            base_device: 3,
        }
    }
}
