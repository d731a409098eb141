//! Container id generation
//!
//! Block container ids are handed out monotonically. To avoid one journal
//! write per id, the master journals a reservation bound: ids below the
//! journaled bound are safe to return with no journal I/O, and crossing the
//! bound extends it by [`CONTAINER_ID_RESERVATION_SIZE`] and journals the
//! new bound. A crash burns at most one reservation worth of ids.

use parking_lot::{Mutex, MutexGuard};

/// Number of container ids reserved per journal write.
pub const CONTAINER_ID_RESERVATION_SIZE: u64 = 1000;

/// Generator state, guarded by the generator's mutex.
#[derive(Debug, Default)]
pub struct ContainerIdState {
    next_container_id: u64,
    journaled_next_container_id: u64,
}

impl ContainerIdState {
    /// Take the next container id.
    pub fn next(&mut self) -> u64 {
        let container_id = self.next_container_id;
        self.next_container_id += 1;
        container_id
    }

    /// The journaled reservation bound.
    #[must_use]
    pub fn journaled_next(&self) -> u64 {
        self.journaled_next_container_id
    }

    /// Extend the reservation bound. The caller journals the new bound
    /// before releasing the generator lock.
    pub fn set_journaled_next(&mut self, next_container_id: u64) {
        self.journaled_next_container_id = next_container_id;
    }

    /// Apply a replayed reservation entry.
    ///
    /// The id counter never moves backwards: replay may deliver bounds out
    /// of an older snapshot, and an id that was handed out must not be
    /// handed out again.
    pub fn apply_replay(&mut self, next_container_id: u64) {
        self.next_container_id = self.next_container_id.max(next_container_id);
        self.journaled_next_container_id = next_container_id;
    }
}

/// Monotonic container id source.
#[derive(Debug, Default)]
pub struct ContainerIdGenerator {
    inner: Mutex<ContainerIdState>,
}

impl ContainerIdGenerator {
    /// Create a generator starting at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the generator state.
    ///
    /// The lock is held across the journal append that covers a new
    /// reservation, so no later call can return an id outside a durable
    /// reservation.
    pub fn lock(&self) -> MutexGuard<'_, ContainerIdState> {
        self.inner.lock()
    }
}
