//! Per-worker metadata

use crate::tier::StorageTierOrder;
use parking_lot::{Mutex, MutexGuard};
use std::collections::{HashMap, HashSet};
use tierio_common::{BlockId, WorkerId, WorkerNetAddress};
use tracing::warn;

/// Mutable fields of a worker, guarded by the worker's mutex.
#[derive(Debug, Default)]
pub struct WorkerMeta {
    /// Tier aliases available on this worker, fastest first.
    storage_tiers: Vec<String>,
    capacity_bytes_on_tiers: HashMap<String, u64>,
    used_bytes_on_tiers: HashMap<String, u64>,
    /// Blocks resident on this worker.
    blocks: HashSet<BlockId>,
    /// Blocks the master has asked this worker to free, delivered piggyback
    /// on the next heartbeat.
    to_remove_blocks: HashSet<BlockId>,
    last_heartbeat_ms: i64,
}

/// Master metadata for one worker.
///
/// Id and address are immutable and may be read without the lock; everything
/// else lives behind [`MasterWorkerInfo::lock`].
#[derive(Debug)]
pub struct MasterWorkerInfo {
    id: WorkerId,
    address: WorkerNetAddress,
    inner: Mutex<WorkerMeta>,
}

impl MasterWorkerInfo {
    /// Create worker metadata with an initial heartbeat stamp.
    #[must_use]
    pub fn new(id: WorkerId, address: WorkerNetAddress, now_ms: i64) -> Self {
        Self {
            id,
            address,
            inner: Mutex::new(WorkerMeta {
                last_heartbeat_ms: now_ms,
                ..WorkerMeta::default()
            }),
        }
    }

    /// The worker id.
    #[must_use]
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// The worker network address.
    #[must_use]
    pub fn address(&self) -> &WorkerNetAddress {
        &self.address
    }

    /// Lock the mutable fields.
    pub fn lock(&self) -> MutexGuard<'_, WorkerMeta> {
        self.inner.lock()
    }
}

impl WorkerMeta {
    /// Install the tier layout and the reported resident block set.
    ///
    /// Returns the blocks the master believed resident that the worker no
    /// longer reports; the caller reconciles those against the block
    /// registry as a removal batch.
    pub fn register(
        &mut self,
        worker_id: WorkerId,
        tier_order: &StorageTierOrder,
        storage_tiers: Vec<String>,
        capacity_bytes_on_tiers: HashMap<String, u64>,
        used_bytes_on_tiers: HashMap<String, u64>,
        reported_blocks: HashSet<BlockId>,
    ) -> Vec<BlockId> {
        if !self.storage_tiers.is_empty() {
            warn!("worker {} is re-registering", worker_id);
        }
        for alias in &storage_tiers {
            if !tier_order.contains(alias) {
                warn!(
                    "worker {} reports tier {} which is not in the global tier ordering",
                    worker_id, alias
                );
            }
        }
        for alias in capacity_bytes_on_tiers.keys() {
            if !storage_tiers.iter().any(|t| t == alias) {
                warn!(
                    "worker {} reports capacity on tier {} it did not declare",
                    worker_id, alias
                );
            }
        }

        let removed = self
            .blocks
            .difference(&reported_blocks)
            .copied()
            .collect();

        self.storage_tiers = storage_tiers;
        self.capacity_bytes_on_tiers = capacity_bytes_on_tiers;
        self.used_bytes_on_tiers = used_bytes_on_tiers;
        self.blocks = reported_blocks;
        removed
    }

    /// Total capacity across tiers.
    #[must_use]
    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes_on_tiers.values().sum()
    }

    /// Total usage across tiers.
    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.used_bytes_on_tiers.values().sum()
    }

    /// Per-tier capacity.
    #[must_use]
    pub fn capacity_bytes_on_tiers(&self) -> &HashMap<String, u64> {
        &self.capacity_bytes_on_tiers
    }

    /// Per-tier usage.
    #[must_use]
    pub fn used_bytes_on_tiers(&self) -> &HashMap<String, u64> {
        &self.used_bytes_on_tiers
    }

    /// Replace the per-tier usage with a fresh heartbeat report.
    pub fn update_used_bytes(&mut self, used_bytes_on_tiers: HashMap<String, u64>) {
        self.used_bytes_on_tiers = used_bytes_on_tiers;
    }

    /// Update the usage of a single tier.
    pub fn update_used_bytes_on_tier(&mut self, tier_alias: &str, used_bytes: u64) {
        self.used_bytes_on_tiers
            .insert(tier_alias.to_string(), used_bytes);
    }

    /// Record a block as resident.
    pub fn add_block(&mut self, block_id: BlockId) {
        self.blocks.insert(block_id);
    }

    /// Forget a resident block and any pending removal of it.
    pub fn remove_block(&mut self, block_id: BlockId) {
        self.blocks.remove(&block_id);
        self.to_remove_blocks.remove(&block_id);
    }

    /// Queue a block for removal on the worker.
    pub fn mark_for_removal(&mut self, block_id: BlockId) {
        self.to_remove_blocks.insert(block_id);
    }

    /// Take the queued removals for delivery in a heartbeat reply.
    pub fn drain_removal_targets(&mut self) -> Vec<BlockId> {
        self.to_remove_blocks.drain().collect()
    }

    /// Snapshot of the resident block set.
    #[must_use]
    pub fn blocks(&self) -> Vec<BlockId> {
        self.blocks.iter().copied().collect()
    }

    /// Number of resident blocks.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Millisecond timestamp of the last contact from this worker.
    #[must_use]
    pub fn last_heartbeat_ms(&self) -> i64 {
        self.last_heartbeat_ms
    }

    /// Stamp the worker as heard from now.
    pub fn touch(&mut self, now_ms: i64) {
        self.last_heartbeat_ms = now_ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker() -> MasterWorkerInfo {
        MasterWorkerInfo::new(
            WorkerId::from(42),
            WorkerNetAddress::new("worker-1", 29999, 29998),
            100,
        )
    }

    #[test]
    fn test_register_diffs_resident_blocks() {
        let worker = worker();
        let mut meta = worker.lock();
        meta.add_block(BlockId::from(1));
        meta.add_block(BlockId::from(2));

        let removed = meta.register(
            worker.id(),
            &StorageTierOrder::default(),
            vec!["MEM".to_string()],
            HashMap::from([("MEM".to_string(), 1024)]),
            HashMap::from([("MEM".to_string(), 512)]),
            HashSet::from([BlockId::from(2), BlockId::from(3)]),
        );

        assert_eq!(removed, vec![BlockId::from(1)]);
        assert_eq!(meta.block_count(), 2);
        assert_eq!(meta.capacity_bytes(), 1024);
        assert_eq!(meta.used_bytes(), 512);
    }

    #[test]
    fn test_removal_queue() {
        let worker = worker();
        let mut meta = worker.lock();

        meta.mark_for_removal(BlockId::from(5));
        meta.mark_for_removal(BlockId::from(5));
        meta.mark_for_removal(BlockId::from(6));
        // A confirmed removal also clears the pending entry.
        meta.remove_block(BlockId::from(6));

        assert_eq!(meta.drain_removal_targets(), vec![BlockId::from(5)]);
        assert!(meta.drain_removal_targets().is_empty());
    }

    #[test]
    fn test_touch() {
        let worker = worker();
        let mut meta = worker.lock();
        assert_eq!(meta.last_heartbeat_ms(), 100);
        meta.touch(250);
        assert_eq!(meta.last_heartbeat_ms(), 250);
    }
}
