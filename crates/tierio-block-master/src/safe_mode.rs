//! Safe mode
//!
//! While the master is in safe mode, lookup handlers refuse to answer so
//! clients never act on partially recovered state. Mutation handlers are
//! not gated; only the read side consults this flag.

use std::sync::atomic::{AtomicBool, Ordering};

/// Tracks whether the master is in safe mode.
#[derive(Debug, Default)]
pub struct SafeModeManager {
    in_safe_mode: AtomicBool,
}

impl SafeModeManager {
    /// Create a manager with the given initial state.
    #[must_use]
    pub fn new(in_safe_mode: bool) -> Self {
        Self {
            in_safe_mode: AtomicBool::new(in_safe_mode),
        }
    }

    /// Whether the master is currently in safe mode.
    #[must_use]
    pub fn is_in_safe_mode(&self) -> bool {
        self.in_safe_mode.load(Ordering::Acquire)
    }

    /// Enter safe mode.
    pub fn enter(&self) {
        self.in_safe_mode.store(true, Ordering::Release);
    }

    /// Leave safe mode.
    pub fn leave(&self) {
        self.in_safe_mode.store(false, Ordering::Release);
    }
}
