//! Log throttling utility
//!
//! Limits how often the same per-frame message is recorded so a sink that
//! fails on every frame cannot flood the log. Suppressed occurrences are
//! counted and reported with the next message that gets through.

use std::collections::HashMap;
use std::time::{Duration, Instant};

struct Entry {
    last_logged: Instant,
    suppressed: u64,
}

/// Log throttler that limits how often the same message is logged
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use v4l_fanout::utils::LogThrottler;
///
/// let mut throttler = LogThrottler::new(Duration::from_secs(5));
///
/// // First call lets the message through
/// assert_eq!(throttler.check("sink_busy"), Some(0));
///
/// // Subsequent calls within 5 seconds are suppressed
/// assert_eq!(throttler.check("sink_busy"), None);
/// ```
pub struct LogThrottler {
    entries: HashMap<String, Entry>,
    interval: Duration,
}

impl LogThrottler {
    /// Create a throttler; `interval` is the minimum time between two
    /// messages with the same key
    pub fn new(interval: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            interval,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Check whether a message may be logged now
    ///
    /// Returns the number of occurrences suppressed since the last logged
    /// one, or `None` if this one should be suppressed as well.
    pub fn check(&mut self, key: &str) -> Option<u64> {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(entry) if now.duration_since(entry.last_logged) < self.interval => {
                entry.suppressed += 1;
                None
            }
            Some(entry) => {
                let suppressed = entry.suppressed;
                entry.last_logged = now;
                entry.suppressed = 0;
                Some(suppressed)
            }
            None => {
                self.entries.insert(
                    key.to_string(),
                    Entry {
                        last_logged: now,
                        suppressed: 0,
                    },
                );
                Some(0)
            }
        }
    }

    /// Occurrences of `key` held back since it was last logged
    pub fn suppressed(&self, key: &str) -> Option<u64> {
        self.entries.get(key).map(|entry| entry.suppressed)
    }

    pub fn should_log(&mut self, key: &str) -> bool {
        self.check(key).is_some()
    }

    /// Forget a key once its error condition recovered, so the next
    /// failure is logged immediately
    pub fn clear(&mut self, key: &str) {
        self.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for LogThrottler {
    /// 5 second interval
    fn default() -> Self {
        Self::with_secs(5)
    }
}

/// Macro for throttled warning logging
///
/// The number of suppressed repeats is attached as the `suppressed` field.
///
/// # Example
///
/// ```rust
/// use v4l_fanout::utils::LogThrottler;
/// use v4l_fanout::warn_throttled;
///
/// let mut throttler = LogThrottler::default();
/// warn_throttled!(throttler, "encode", "Encoder failed: {}", "details");
/// ```
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if let Some(suppressed) = $throttler.check($key) {
            tracing::warn!(suppressed, $($arg)*);
        }
    };
}

/// Macro for throttled error logging
#[macro_export]
macro_rules! error_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if let Some(suppressed) = $throttler.check($key) {
            tracing::error!(suppressed, $($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_throttling_counts_suppressed() {
        let mut throttler = LogThrottler::new(Duration::from_millis(100));

        assert_eq!(throttler.check("sink"), Some(0));
        assert_eq!(throttler.check("sink"), None);
        assert_eq!(throttler.check("sink"), None);

        thread::sleep(Duration::from_millis(150));

        assert_eq!(throttler.check("sink"), Some(2));
        assert_eq!(throttler.check("sink"), None);
        assert_eq!(throttler.suppressed("sink"), Some(1));
        assert_eq!(throttler.suppressed("other"), None);
    }

    #[test]
    fn test_different_keys() {
        let mut throttler = LogThrottler::with_secs(10);

        assert!(throttler.should_log("/dev/video3"));
        assert!(throttler.should_log("/dev/video4"));
        assert!(!throttler.should_log("/dev/video3"));
        assert_eq!(throttler.len(), 2);
    }

    #[test]
    fn test_clear() {
        let mut throttler = LogThrottler::with_secs(10);

        assert!(throttler.should_log("key"));
        assert!(!throttler.should_log("key"));
        throttler.clear("key");
        assert!(throttler.should_log("key"));
    }

    #[test]
    fn test_macro_consumes_budget() {
        let mut throttler = LogThrottler::with_secs(10);
        assert!(throttler.is_empty());

        warn_throttled!(throttler, "encode", "failure {}", 1);
        warn_throttled!(throttler, "encode", "failure {}", 2);

        assert_eq!(throttler.len(), 1);
        assert!(!throttler.should_log("encode"));
    }
}
