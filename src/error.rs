use thiserror::Error;

use crate::video::convert::ConvertError;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Device unavailable [{device}]: {reason}")]
    DeviceUnavailable { device: String, reason: String },

    #[error("Format unsupported [{device}]: requested {requested}, driver offered {actual}")]
    FormatUnsupported {
        device: String,
        requested: String,
        actual: String,
    },

    #[error("Insufficient buffer memory on {device}: granted {granted}, need at least 2")]
    InsufficientBuffers { device: String, granted: u32 },

    #[error("Device timeout [{device}]: no frame within {timeout_ms}ms")]
    DeviceTimeout { device: String, timeout_ms: u64 },

    #[error("Encoder failure on sink {sink}: {reason}")]
    SinkEncodeFailure { sink: String, reason: String },

    #[error("Buffer ring violation [{device}]: {reason}")]
    RingViolation { device: String, reason: String },

    #[error("Device {0} used after its buffers were released")]
    Released(String),

    #[error("Video error: {0}")]
    VideoError(String),

    #[error("Conversion error: {0}")]
    Convert(#[from] ConvertError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Kernel module error: {0}")]
    Module(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    /// Startup errors are reported once and end the process.
    pub fn is_startup(&self) -> bool {
        matches!(
            self,
            AppError::DeviceUnavailable { .. }
                | AppError::FormatUnsupported { .. }
                | AppError::InsufficientBuffers { .. }
                | AppError::Config(_)
        )
    }

    /// Errors that are confined to one sink for one frame.
    pub fn is_sink_local(&self) -> bool {
        matches!(
            self,
            AppError::SinkEncodeFailure { .. } | AppError::Convert(_)
        )
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AppError>;
