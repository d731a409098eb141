//! Wall-clock abstraction
//!
//! Heartbeat timestamps and the lost-worker timeout rule compare wall-clock
//! milliseconds; the clock is injected so the timeout sweep can be driven
//! deterministically in tests.

use std::time::{SystemTime, UNIX_EPOCH};

/// Source of wall-clock time in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    /// Current time in milliseconds.
    fn millis(&self) -> i64;
}

/// The system clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::Clock;
    use std::sync::atomic::{AtomicI64, Ordering};

    /// A clock advanced by hand.
    #[derive(Default)]
    pub struct ManualClock {
        now_ms: AtomicI64,
    }

    impl ManualClock {
        pub fn new(now_ms: i64) -> Self {
            Self {
                now_ms: AtomicI64::new(now_ms),
            }
        }

        pub fn advance(&self, delta_ms: i64) {
            self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn millis(&self) -> i64 {
            self.now_ms.load(Ordering::SeqCst)
        }
    }
}
