//! Per-block metadata

use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use tierio_common::{BlockId, WorkerId, UNKNOWN_BLOCK_SIZE};
use tracing::warn;

/// Mutable fields of a block, guarded by the block's mutex.
#[derive(Debug)]
pub struct BlockMeta {
    length: u64,
    /// Replica locations: worker id -> tier alias the replica lives on.
    locations: HashMap<WorkerId, String>,
}

/// Master metadata for one block.
///
/// The id is immutable and may be read without the lock; everything else
/// lives behind [`MasterBlockInfo::lock`].
#[derive(Debug)]
pub struct MasterBlockInfo {
    block_id: BlockId,
    inner: Mutex<BlockMeta>,
}

impl MasterBlockInfo {
    /// Create block metadata with no replica locations.
    #[must_use]
    pub fn new(block_id: BlockId, length: u64) -> Self {
        Self {
            block_id,
            inner: Mutex::new(BlockMeta {
                length,
                locations: HashMap::new(),
            }),
        }
    }

    /// The block id.
    #[must_use]
    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    /// Lock the mutable fields.
    pub fn lock(&self) -> MutexGuard<'_, BlockMeta> {
        self.inner.lock()
    }
}

impl BlockMeta {
    /// The byte length, or [`UNKNOWN_BLOCK_SIZE`] if not yet bound.
    #[must_use]
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Bind the length if it is still unknown.
    ///
    /// Returns whether the length changed. Once bound, the length is frozen:
    /// a differing re-commit is ignored with a warning.
    pub fn update_length(&mut self, block_id: BlockId, length: u64) -> bool {
        if self.length == UNKNOWN_BLOCK_SIZE {
            if length == UNKNOWN_BLOCK_SIZE {
                return false;
            }
            self.length = length;
            return true;
        }
        if length != self.length {
            warn!(
                "ignoring length update for block {}: {} -> {}",
                block_id, self.length, length
            );
        }
        false
    }

    /// Record a replica of this block on a worker tier.
    pub fn add_worker(&mut self, worker_id: WorkerId, tier_alias: &str) {
        self.locations.insert(worker_id, tier_alias.to_string());
    }

    /// Drop a worker from the replica locations.
    pub fn remove_worker(&mut self, worker_id: WorkerId) -> bool {
        self.locations.remove(&worker_id).is_some()
    }

    /// Number of replica locations.
    #[must_use]
    pub fn num_locations(&self) -> usize {
        self.locations.len()
    }

    /// Replica locations, worker id -> tier alias.
    #[must_use]
    pub fn locations(&self) -> &HashMap<WorkerId, String> {
        &self.locations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_binds_once() {
        let block = MasterBlockInfo::new(BlockId::from(7), UNKNOWN_BLOCK_SIZE);
        let mut meta = block.lock();

        assert!(!meta.update_length(block.block_id(), UNKNOWN_BLOCK_SIZE));
        assert!(meta.update_length(block.block_id(), 1024));
        assert_eq!(meta.length(), 1024);

        // Frozen: neither a matching nor a differing commit changes it.
        assert!(!meta.update_length(block.block_id(), 1024));
        assert!(!meta.update_length(block.block_id(), 2048));
        assert_eq!(meta.length(), 1024);
    }

    #[test]
    fn test_locations() {
        let block = MasterBlockInfo::new(BlockId::from(7), 64);
        let mut meta = block.lock();

        meta.add_worker(WorkerId::from(1), "MEM");
        meta.add_worker(WorkerId::from(2), "SSD");
        // Re-adding the same worker moves the replica, never duplicates it.
        meta.add_worker(WorkerId::from(1), "HDD");
        assert_eq!(meta.num_locations(), 2);
        assert_eq!(meta.locations()[&WorkerId::from(1)], "HDD");

        assert!(meta.remove_worker(WorkerId::from(1)));
        assert!(!meta.remove_worker(WorkerId::from(1)));
        assert_eq!(meta.num_locations(), 1);
    }
}
