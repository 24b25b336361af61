//! v4l-fanout - capture once, publish many times
//!
//! Captures packed 4:2:2 frames from one V4L2 device and distributes every
//! frame to a set of loopback output devices, converting to 4:2:0 layouts
//! and running an encoder where a sink asks for one.

pub mod config;
pub mod error;
pub mod modules;
pub mod utils;
pub mod video;

pub use error::{AppError, Result};
