//! # Time Sources
//!
//! - [`SystemTimeSource`]: production clock
//! - [`ManualTimeSource`]: clock advanced explicitly, for deterministic tests
//!
//! ```rust
//! use qc_block_download::adapters::ManualTimeSource;
//! use qc_block_download::TimeSource;
//! use std::time::Duration;
//!
//! let clock = ManualTimeSource::new(1_000);
//! clock.advance(Duration::from_millis(250));
//! assert_eq!(clock.now().as_millis(), 1_250);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use shared_types::entities::Timestamp;

use crate::ports::TimeSource;

/// Time source using the system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl SystemTimeSource {
    /// Create a system time source.
    pub fn new() -> Self {
        Self
    }
}

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

/// A time source that only moves when told to.
///
/// Clones share the same clock.
#[derive(Debug, Clone, Default)]
pub struct ManualTimeSource {
    millis: Arc<AtomicU64>,
}

impl ManualTimeSource {
    /// Create a clock starting at `millis` since the epoch.
    pub fn new(millis: u64) -> Self {
        Self {
            millis: Arc::new(AtomicU64::new(millis)),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let by = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        self.millis.fetch_add(by, Ordering::SeqCst);
    }

    /// Set the clock to an absolute value.
    pub fn set(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::from_millis(self.millis.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_is_shared_between_clones() {
        let clock = ManualTimeSource::new(100);
        let other = clock.clone();
        other.advance(Duration::from_secs(1));
        assert_eq!(clock.now().as_millis(), 1_100);

        clock.set(5);
        assert_eq!(other.now().as_millis(), 5);
    }

    #[test]
    fn test_system_clock_is_after_epoch() {
        assert!(SystemTimeSource::new().now().as_millis() > 0);
    }
}
