//! Application configuration
//!
//! Loaded from an optional JSON file; every field has a default matching
//! the stock two-sink deployment.

mod schema;

pub use schema::{AppConfig, CaptureConfig, LoopbackConfig, SinkConfig};

use std::path::Path;

use tracing::info;

use crate::error::{AppError, Result};

impl AppConfig {
    /// Read a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: AppConfig = serde_json::from_str(&text)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }
}
