//! Utility modules
//!
//! Common helpers used across the codebase.

pub mod throttle;

pub use throttle::LogThrottler;
