//! The block master
//!
//! Manages the metadata for all blocks and block workers in the cluster and
//! serves the commit / register / heartbeat protocol.
//!
//! Concurrency and locking:
//!
//! Metadata is locked per object. Every [`MasterBlockInfo`] and every
//! [`MasterWorkerInfo`] has its own mutex, and an object must be locked
//! before any of its mutable fields is read or written. When a worker and a
//! block must be locked at the same time, the worker is locked first; no
//! handler holds two worker locks or two block locks at once, so operations
//! on different workers and different blocks proceed independently.
//!
//! The registry maps (blocks, lost blocks, worker sets) sit behind their own
//! read/write locks and are only ever held long enough to look up, insert or
//! remove a handle; a thread may take a registry lock while holding an
//! object mutex, never the reverse.

use crate::clock::{Clock, SystemClock};
use crate::container_id::{ContainerIdGenerator, CONTAINER_ID_RESERVATION_SIZE};
use crate::journal::{Journal, JournalContext, JournalEntry};
use crate::meta::{BlockMeta, MasterBlockInfo, MasterWorkerInfo, WorkerMeta};
use crate::safe_mode::SafeModeManager;
use crate::tier::StorageTierOrder;
use crate::workers::WorkerRegistry;
use parking_lot::RwLock;
use rand::Rng;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tierio_common::config::MasterConfig;
use tierio_common::{BlockId, Error, Result, WorkerId, WorkerNetAddress};
use tracing::{debug, error, info, warn};

/// One replica location of a block, joined with the worker's address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockLocation {
    pub worker_id: WorkerId,
    pub worker_address: WorkerNetAddress,
    pub tier_alias: String,
}

/// Client view of a block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    pub block_id: BlockId,
    pub length: u64,
    /// Replica locations ordered by storage tier, fastest first.
    pub locations: Vec<BlockLocation>,
}

/// Client view of a worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub address: WorkerNetAddress,
    pub last_contact_sec: u64,
    pub capacity_bytes: u64,
    pub used_bytes: u64,
    pub capacity_bytes_on_tiers: HashMap<String, u64>,
    pub used_bytes_on_tiers: HashMap<String, u64>,
}

/// Reply carried on a heartbeat response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerCommand {
    /// Nothing to do.
    Nothing,
    /// The master does not know this worker; it must register.
    Register,
    /// The worker must free the listed blocks.
    Free { block_ids: Vec<BlockId> },
}

/// The cluster block and worker metadata engine.
pub struct BlockMaster {
    /// All known blocks, including blocks with no remaining replica.
    blocks: RwLock<HashMap<BlockId, Arc<MasterBlockInfo>>>,
    /// Blocks with no replica left in cluster storage.
    lost_blocks: RwLock<HashSet<BlockId>>,
    container_ids: ContainerIdGenerator,
    workers: WorkerRegistry,
    tier_order: StorageTierOrder,
    safe_mode: SafeModeManager,
    journal: Arc<dyn Journal>,
    clock: Arc<dyn Clock>,
    worker_timeout_ms: i64,
}

impl BlockMaster {
    /// Create a master over the given journal, using the system clock.
    pub fn new(config: &MasterConfig, journal: Arc<dyn Journal>) -> Self {
        Self::with_clock(config, journal, Arc::new(SystemClock))
    }

    /// Create a master with an explicit clock.
    pub fn with_clock(
        config: &MasterConfig,
        journal: Arc<dyn Journal>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            blocks: RwLock::new(HashMap::new()),
            lost_blocks: RwLock::new(HashSet::new()),
            container_ids: ContainerIdGenerator::new(),
            workers: WorkerRegistry::new(),
            tier_order: StorageTierOrder::new(config.tiers.iter().cloned()),
            safe_mode: SafeModeManager::default(),
            journal,
            clock,
            worker_timeout_ms: config.worker_timeout_ms as i64,
        }
    }

    /// The safe mode flag consulted by the lookup handlers.
    pub fn safe_mode(&self) -> &SafeModeManager {
        &self.safe_mode
    }

    /// The global storage tier ordering.
    pub fn tier_order(&self) -> &StorageTierOrder {
        &self.tier_order
    }

    fn journal_context(&self) -> JournalContext<'_> {
        JournalContext::new(self.journal.as_ref())
    }

    fn get_block(&self, block_id: BlockId) -> Option<Arc<MasterBlockInfo>> {
        self.blocks.read().get(&block_id).cloned()
    }

    // ============ Journal replay and snapshot ============

    /// Apply one replayed journal entry.
    pub fn process_journal_entry(&self, entry: &JournalEntry) {
        match *entry {
            JournalEntry::ContainerIdGenerator { next_container_id } => {
                self.container_ids.lock().apply_replay(next_container_id);
            }
            JournalEntry::BlockInfo { block_id, length } => {
                if let Some(block) = self.get_block(block_id) {
                    block.lock().update_length(block_id, length);
                } else {
                    self.blocks
                        .write()
                        .insert(block_id, Arc::new(MasterBlockInfo::new(block_id, length)));
                }
            }
            JournalEntry::DeleteBlock { block_id } => {
                self.blocks.write().remove(&block_id);
            }
        }
    }

    /// Export the journaled state as a snapshot.
    ///
    /// Replaying the returned entries into a fresh master reconstructs the
    /// same blocks and a container id generator that can never re-issue an
    /// already returned id.
    pub fn journal_entries(&self) -> Vec<JournalEntry> {
        let mut entries = vec![JournalEntry::ContainerIdGenerator {
            next_container_id: self.container_ids.lock().journaled_next(),
        }];
        let blocks: Vec<Arc<MasterBlockInfo>> = self.blocks.read().values().cloned().collect();
        for block in blocks {
            entries.push(JournalEntry::BlockInfo {
                block_id: block.block_id(),
                length: block.lock().length(),
            });
        }
        entries
    }

    // ============ Container ids ============

    /// Mint a new block container id.
    pub fn get_new_container_id(&self) -> Result<u64> {
        let mut state = self.container_ids.lock();
        let container_id = state.next();
        if container_id < state.journaled_next() {
            // Within the journaled reservation; safe to return with no
            // journal I/O.
            return Ok(container_id);
        }
        // Extend the reservation and journal the new bound. Ids inside a
        // reservation that was never used are burned on a crash; that is the
        // price of one journal write per thousand ids. The flush happens
        // while the generator lock is held so a later call cannot return an
        // id that is not covered by a durable reservation. On a flush
        // failure the counter is not rewound: concurrent callers may already
        // hold later ids.
        state.set_journaled_next(container_id + CONTAINER_ID_RESERVATION_SIZE);
        let mut journal_ctx = self.journal_context();
        journal_ctx.append(JournalEntry::ContainerIdGenerator {
            next_container_id: state.journaled_next(),
        });
        journal_ctx.close()?;
        Ok(container_id)
    }

    // ============ Worker lifecycle ============

    /// Mint (or look up) the worker id for a network address.
    pub fn get_worker_id(&self, address: &WorkerNetAddress) -> WorkerId {
        loop {
            if let Some(worker) = self.workers.get_active_by_address(address) {
                let worker_id = worker.id();
                warn!("worker {} already exists as id {}", address, worker_id);
                return worker_id;
            }

            if let Some(worker) = self.workers.get_temp_by_address(address) {
                let worker_id = worker.id();
                warn!("unregistered worker {} asked for its id {} again", address, worker_id);
                // Stamp the worker before it is considered active.
                worker.lock().touch(self.clock.millis());
                self.workers.promote_temp(worker_id);
                return worker_id;
            }

            if let Some(worker) = self.workers.get_lost_by_address(address) {
                let worker_id = worker.id();
                warn!("lost worker {} asked for its old id {}", address, worker_id);
                worker.lock().touch(self.clock.millis());
                self.workers.revive_lost(worker_id);
                return worker_id;
            }

            let worker_id = WorkerId::from(rand::rng().random::<u64>() & (i64::MAX as u64));
            let worker = Arc::new(MasterWorkerInfo::new(
                worker_id,
                address.clone(),
                self.clock.millis(),
            ));
            if self.workers.insert_temp(worker) {
                info!("minted worker id {} for {}", worker_id, address);
                return worker_id;
            }
            // Lost a race against a concurrent mint for the same address or
            // a colliding random id; redo the index lookups.
        }
    }

    /// Register a worker's tier layout and resident blocks.
    pub fn worker_register(
        &self,
        worker_id: WorkerId,
        storage_tiers: Vec<String>,
        total_bytes_on_tiers: HashMap<String, u64>,
        used_bytes_on_tiers: HashMap<String, u64>,
        current_blocks_on_tiers: HashMap<String, Vec<BlockId>>,
    ) -> Result<()> {
        let worker = match self.workers.get_active_by_id(worker_id) {
            Some(worker) => worker,
            None => match self.workers.promote_temp(worker_id) {
                Some(worker) => {
                    info!("registering worker {} from the temp set ({})", worker_id, worker.address());
                    worker
                }
                None => return Err(Error::NoWorker { worker_id }),
            },
        };

        let reported_blocks: HashSet<BlockId> = current_blocks_on_tiers
            .values()
            .flatten()
            .copied()
            .collect();

        let mut meta = worker.lock();
        meta.touch(self.clock.millis());
        // Blocks the master believed resident but the worker no longer
        // reports have been lost on that worker.
        let removed_blocks = meta.register(
            worker_id,
            &self.tier_order,
            storage_tiers,
            total_bytes_on_tiers,
            used_bytes_on_tiers,
            reported_blocks,
        );
        self.process_worker_removed_blocks(worker_id, &mut meta, &removed_blocks);
        self.process_worker_added_blocks(worker_id, &mut meta, &current_blocks_on_tiers);
        self.process_worker_orphaned_blocks(worker_id, &mut meta);
        info!(
            "registered worker {} ({}): capacity {} used {} blocks {}",
            worker_id,
            worker.address(),
            meta.capacity_bytes(),
            meta.used_bytes(),
            meta.block_count()
        );
        Ok(())
    }

    /// Process a periodic worker report; the reply may carry a command.
    pub fn worker_heartbeat(
        &self,
        worker_id: WorkerId,
        used_bytes_on_tiers: HashMap<String, u64>,
        removed_block_ids: &[BlockId],
        added_blocks_on_tiers: &HashMap<String, Vec<BlockId>>,
    ) -> WorkerCommand {
        let Some(worker) = self.workers.get_active_by_id(worker_id) else {
            warn!("could not find worker id {} for heartbeat", worker_id);
            return WorkerCommand::Register;
        };

        // The lost-worker detector may demote the worker between the lookup
        // above and the lock below. The race is benign: the mutations here
        // are idempotent and the worker will be told to re-register on its
        // next heartbeat.
        let mut meta = worker.lock();
        self.process_worker_removed_blocks(worker_id, &mut meta, removed_block_ids);
        self.process_worker_added_blocks(worker_id, &mut meta, added_blocks_on_tiers);
        meta.update_used_bytes(used_bytes_on_tiers);
        meta.touch(self.clock.millis());

        let to_remove = meta.drain_removal_targets();
        if to_remove.is_empty() {
            WorkerCommand::Nothing
        } else {
            WorkerCommand::Free {
                block_ids: to_remove,
            }
        }
    }

    /// Demote every active worker whose last heartbeat is older than the
    /// worker timeout, releasing its replicas.
    ///
    /// Worker records are never deleted; a demoted worker that comes back
    /// re-registers under its old id.
    pub fn detect_lost_workers(&self) {
        for worker in self.workers.active_snapshot() {
            let worker_id = worker.id();
            let mut meta = worker.lock();
            let since_last_ms = self.clock.millis() - meta.last_heartbeat_ms();
            if since_last_ms > self.worker_timeout_ms {
                error!(
                    "worker {}({}) timed out after {}ms without a heartbeat",
                    worker_id,
                    worker.address(),
                    since_last_ms
                );
                self.workers.mark_lost(worker_id);
                let resident_blocks = meta.blocks();
                self.process_worker_removed_blocks(worker_id, &mut meta, &resident_blocks);
            }
        }
    }

    // ============ Block commit ============

    /// Commit a block on a worker tier.
    pub fn commit_block(
        &self,
        worker_id: WorkerId,
        used_bytes_on_tier: u64,
        tier_alias: &str,
        block_id: BlockId,
        length: u64,
    ) -> Result<()> {
        debug!(
            "commit block from worker {}: block {} length {} tier {} used {}",
            worker_id, block_id, length, tier_alias, used_bytes_on_tier
        );

        let worker = self
            .workers
            .get_active_by_id(worker_id)
            .ok_or(Error::NoWorker { worker_id })?;

        let mut journal_ctx = self.journal_context();
        {
            let mut worker_meta = worker.lock();
            // Loop until the block metadata is successfully locked: a
            // candidate for a new block can lose the insert race to a
            // concurrent commit of the same id.
            loop {
                let (block, new_block) = match self.get_block(block_id) {
                    Some(block) => (block, false),
                    None => (Arc::new(MasterBlockInfo::new(block_id, length)), true),
                };

                let mut block_meta = block.lock();
                let mut write_journal = false;
                if new_block {
                    let mut blocks = self.blocks.write();
                    match blocks.entry(block_id) {
                        Entry::Occupied(_) => {
                            // Another commit inserted this block first;
                            // discard the candidate and start over.
                            continue;
                        }
                        Entry::Vacant(entry) => {
                            entry.insert(Arc::clone(&block));
                        }
                    }
                    write_journal = true;
                } else if block_meta.update_length(block_id, length) {
                    // The length was previously unknown and is now bound.
                    write_journal = true;
                }
                if write_journal {
                    journal_ctx.append(JournalEntry::BlockInfo {
                        block_id,
                        length: block_meta.length(),
                    });
                }

                // Both the worker and the block are locked here.
                block_meta.add_worker(worker_id, tier_alias);
                // This worker holds the block, so it is no longer lost.
                self.lost_blocks.write().remove(&block_id);

                worker_meta.add_block(block_id);
                worker_meta.update_used_bytes_on_tier(tier_alias, used_bytes_on_tier);
                worker_meta.touch(self.clock.millis());
                break;
            }
        }
        journal_ctx.close()
    }

    /// Commit a block that lives only in the under filesystem.
    pub fn commit_block_in_ufs(&self, block_id: BlockId, length: u64) -> Result<()> {
        debug!("commit block in ufs: block {} length {}", block_id, length);
        if self.get_block(block_id).is_some() {
            // Metadata already exists; nothing to commit.
            return Ok(());
        }

        let block = Arc::new(MasterBlockInfo::new(block_id, length));
        let mut journal_ctx = self.journal_context();
        {
            let block_meta = block.lock();
            let mut blocks = self.blocks.write();
            if let Entry::Vacant(entry) = blocks.entry(block_id) {
                entry.insert(Arc::clone(&block));
                journal_ctx.append(JournalEntry::BlockInfo {
                    block_id,
                    length: block_meta.length(),
                });
            }
        }
        journal_ctx.close()
    }

    // ============ Block removal ============

    /// Free the given blocks from their workers, deleting the metadata too
    /// when `delete` is set.
    pub fn remove_blocks(&self, block_ids: &[BlockId], delete: bool) -> Result<()> {
        let mut journal_ctx = self.journal_context();
        for &block_id in block_ids {
            let Some(block) = self.get_block(block_id) else {
                continue;
            };
            let mut worker_ids = Vec::new();
            {
                let block_meta = block.lock();
                // The block may have been deleted since the lookup above;
                // membership is not re-checked because deleting it again is
                // a no-op.
                worker_ids.extend(block_meta.locations().keys().copied());
                if delete {
                    // Drop the id from the lost set before the metadata goes
                    // away so the set never holds a dangling id. For a plain
                    // free the metadata stays and the lost set is updated
                    // when the workers confirm the removals.
                    self.lost_blocks.write().remove(&block_id);
                    if self.blocks.write().remove(&block_id).is_some() {
                        journal_ctx.append(JournalEntry::DeleteBlock { block_id });
                    }
                }
            }

            // The workers are signalled after the block lock is released,
            // inverting the usual worker-before-block order on purpose: the
            // removal queue is an asynchronous signal to the worker, and the
            // block is no longer reachable, so there is no composite
            // invariant to protect.
            for worker_id in worker_ids {
                if let Some(worker) = self.workers.get_active_by_id(worker_id) {
                    worker.lock().mark_for_removal(block_id);
                }
            }
        }
        journal_ctx.close()
    }

    /// Delete every block the validator rejects.
    pub fn validate_blocks<F>(&self, validator: F, repair: bool) -> Result<()>
    where
        F: Fn(BlockId) -> bool,
    {
        // An unsynchronized snapshot: a block deleted concurrently may be
        // classified invalid here, and removing it again below is a no-op.
        let block_ids: Vec<BlockId> = self.blocks.read().keys().copied().collect();
        let invalid_blocks: Vec<BlockId> = block_ids
            .into_iter()
            .filter(|&block_id| !validator(block_id))
            .collect();
        if repair && !invalid_blocks.is_empty() {
            warn!("deleting {} invalid blocks", invalid_blocks.len());
            self.remove_blocks(&invalid_blocks, true)?;
        }
        Ok(())
    }

    // ============ Lost blocks ============

    /// Record blocks reported lost outside the heartbeat path.
    pub fn report_lost_blocks(&self, block_ids: &[BlockId]) {
        self.lost_blocks.write().extend(block_ids.iter().copied());
    }

    /// Snapshot of the lost block set.
    pub fn lost_blocks(&self) -> HashSet<BlockId> {
        self.lost_blocks.read().clone()
    }

    // ============ Lookups ============

    /// Look up a block.
    pub fn get_block_info(&self, block_id: BlockId) -> Result<BlockInfo> {
        let block = self
            .get_block(block_id)
            .ok_or(Error::BlockNotFound { block_id })?;
        let block_meta = block.lock();
        self.generate_block_info(block_id, &block_meta)
    }

    /// Look up a batch of blocks; unknown ids are skipped.
    pub fn get_block_info_list(&self, block_ids: &[BlockId]) -> Result<Vec<BlockInfo>> {
        let mut infos = Vec::with_capacity(block_ids.len());
        for &block_id in block_ids {
            let Some(block) = self.get_block(block_id) else {
                continue;
            };
            let block_meta = block.lock();
            infos.push(self.generate_block_info(block_id, &block_meta)?);
        }
        Ok(infos)
    }

    /// Build the client view of a locked block, joining worker addresses.
    fn generate_block_info(&self, block_id: BlockId, block_meta: &BlockMeta) -> Result<BlockInfo> {
        if self.safe_mode.is_in_safe_mode() {
            return Err(Error::unavailable("master is in safe mode"));
        }
        let mut located: Vec<(WorkerId, String)> = block_meta
            .locations()
            .iter()
            .map(|(worker_id, tier_alias)| (*worker_id, tier_alias.clone()))
            .collect();
        // Order replicas by the global tier ordinal; the sort is stable so
        // ties keep their iteration order.
        located.sort_by_key(|(_, tier_alias)| {
            self.tier_order.ordinal(tier_alias).unwrap_or(usize::MAX)
        });

        let mut locations = Vec::with_capacity(located.len());
        for (worker_id, tier_alias) in located {
            // The worker mutex is intentionally not taken: locking it here
            // would invert the worker-before-block order, and only the
            // immutable address is read.
            if let Some(worker) = self.workers.get_active_by_id(worker_id) {
                locations.push(BlockLocation {
                    worker_id,
                    worker_address: worker.address().clone(),
                    tier_alias,
                });
            }
        }
        Ok(BlockInfo {
            block_id,
            length: block_meta.length(),
            locations,
        })
    }

    /// List the workers currently in contact with the master.
    pub fn get_worker_info_list(&self) -> Result<Vec<WorkerInfo>> {
        if self.safe_mode.is_in_safe_mode() {
            return Err(Error::unavailable("master is in safe mode"));
        }
        Ok(self
            .workers
            .active_snapshot()
            .iter()
            .map(|worker| self.generate_worker_info(worker))
            .collect())
    }

    /// List the workers that have timed out, least stale first.
    pub fn get_lost_worker_info_list(&self) -> Vec<WorkerInfo> {
        let mut infos: Vec<WorkerInfo> = self
            .workers
            .lost_snapshot()
            .iter()
            .map(|worker| self.generate_worker_info(worker))
            .collect();
        infos.sort_by_key(|info| info.last_contact_sec);
        infos
    }

    fn generate_worker_info(&self, worker: &MasterWorkerInfo) -> WorkerInfo {
        let meta = worker.lock();
        let since_last_ms = (self.clock.millis() - meta.last_heartbeat_ms()).max(0);
        WorkerInfo {
            id: worker.id(),
            address: worker.address().clone(),
            last_contact_sec: (since_last_ms / 1000) as u64,
            capacity_bytes: meta.capacity_bytes(),
            used_bytes: meta.used_bytes(),
            capacity_bytes_on_tiers: meta.capacity_bytes_on_tiers().clone(),
            used_bytes_on_tiers: meta.used_bytes_on_tiers().clone(),
        }
    }

    // ============ Aggregates ============

    /// Number of active workers.
    pub fn worker_count(&self) -> usize {
        self.workers.active_count()
    }

    /// Number of lost workers.
    pub fn lost_worker_count(&self) -> usize {
        self.workers.lost_count()
    }

    /// Total capacity across active workers.
    pub fn get_capacity_bytes(&self) -> u64 {
        self.workers
            .active_snapshot()
            .iter()
            .map(|worker| worker.lock().capacity_bytes())
            .sum()
    }

    /// Total usage across active workers.
    pub fn get_used_bytes(&self) -> u64 {
        self.workers
            .active_snapshot()
            .iter()
            .map(|worker| worker.lock().used_bytes())
            .sum()
    }

    /// Per-tier capacity across active workers.
    pub fn get_total_bytes_on_tiers(&self) -> HashMap<String, u64> {
        let mut totals: HashMap<String, u64> = HashMap::new();
        for worker in self.workers.active_snapshot() {
            let meta = worker.lock();
            for (tier_alias, bytes) in meta.capacity_bytes_on_tiers() {
                *totals.entry(tier_alias.clone()).or_default() += bytes;
            }
        }
        totals
    }

    /// Per-tier usage across active workers.
    pub fn get_used_bytes_on_tiers(&self) -> HashMap<String, u64> {
        let mut totals: HashMap<String, u64> = HashMap::new();
        for worker in self.workers.active_snapshot() {
            let meta = worker.lock();
            for (tier_alias, bytes) in meta.used_bytes_on_tiers() {
                *totals.entry(tier_alias.clone()).or_default() += bytes;
            }
        }
        totals
    }

    // ============ Shared delta processing ============

    /// Reconcile blocks removed from a worker against the block registry.
    ///
    /// Runs under the worker's lock; takes each block's lock in turn.
    fn process_worker_removed_blocks(
        &self,
        worker_id: WorkerId,
        worker_meta: &mut WorkerMeta,
        removed_block_ids: &[BlockId],
    ) {
        for &block_id in removed_block_ids {
            let Some(block) = self.get_block(block_id) else {
                // The metadata is already gone (concurrent delete); just
                // forget the residency.
                worker_meta.remove_block(block_id);
                continue;
            };
            let mut block_meta = block.lock();
            info!("block {} removed on worker {}", block_id, worker_id);
            worker_meta.remove_block(block_id);
            block_meta.remove_worker(worker_id);
            if block_meta.num_locations() == 0 {
                self.lost_blocks.write().insert(block_id);
            }
        }
    }

    /// Record blocks added on a worker, by tier.
    ///
    /// Runs under the worker's lock; takes each block's lock in turn. A
    /// reported block the registry does not know is ignored with a warning.
    fn process_worker_added_blocks(
        &self,
        worker_id: WorkerId,
        worker_meta: &mut WorkerMeta,
        added_blocks_on_tiers: &HashMap<String, Vec<BlockId>>,
    ) {
        for (tier_alias, block_ids) in added_blocks_on_tiers {
            for &block_id in block_ids {
                let Some(block) = self.get_block(block_id) else {
                    warn!("invalid block {} reported by worker {}", block_id, worker_id);
                    continue;
                };
                let mut block_meta = block.lock();
                worker_meta.add_block(block_id);
                block_meta.add_worker(worker_id, tier_alias);
                self.lost_blocks.write().remove(&block_id);
            }
        }
    }

    /// Queue removal of resident blocks the registry does not know.
    ///
    /// Runs under the worker's lock.
    fn process_worker_orphaned_blocks(&self, worker_id: WorkerId, worker_meta: &mut WorkerMeta) {
        for block_id in worker_meta.blocks() {
            if !self.blocks.read().contains_key(&block_id) {
                info!(
                    "requesting delete for orphaned block {} on worker {}",
                    block_id, worker_id
                );
                worker_meta.mark_for_removal(block_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::ManualClock;
    use crate::journal::MemoryJournal;
    use tierio_common::UNKNOWN_BLOCK_SIZE;

    const GB: u64 = 1024 * 1024 * 1024;

    struct Harness {
        master: BlockMaster,
        journal: Arc<MemoryJournal>,
        clock: Arc<ManualClock>,
        config: MasterConfig,
    }

    fn harness() -> Harness {
        let journal = Arc::new(MemoryJournal::new());
        let clock = Arc::new(ManualClock::new(0));
        let config = MasterConfig::default();
        let master = BlockMaster::with_clock(
            &config,
            Arc::clone(&journal) as Arc<dyn Journal>,
            Arc::clone(&clock) as Arc<dyn Clock>,
        );
        Harness {
            master,
            journal,
            clock,
            config,
        }
    }

    fn addr(host: &str) -> WorkerNetAddress {
        WorkerNetAddress::new(host, 29999, 29998)
    }

    /// Mint an id for `host` and register it with one 1 GB MEM tier.
    fn register_worker(master: &BlockMaster, host: &str) -> WorkerId {
        let worker_id = master.get_worker_id(&addr(host));
        master
            .worker_register(
                worker_id,
                vec!["MEM".to_string()],
                HashMap::from([("MEM".to_string(), GB)]),
                HashMap::from([("MEM".to_string(), 0)]),
                HashMap::new(),
            )
            .unwrap();
        worker_id
    }

    fn block(id: u64) -> BlockId {
        BlockId::from(id)
    }

    // ===== Container ids (S1) =====

    #[test]
    fn test_container_id_reservation() {
        let h = harness();

        assert_eq!(h.master.get_new_container_id().unwrap(), 0);
        assert_eq!(
            h.journal.entries(),
            vec![JournalEntry::ContainerIdGenerator {
                next_container_id: 1000
            }]
        );

        // Ids 1..=999 stay inside the reservation: no journal I/O.
        for expected in 1..1000 {
            assert_eq!(h.master.get_new_container_id().unwrap(), expected);
        }
        assert_eq!(h.journal.entries().len(), 1);

        // Crossing the bound extends the reservation to 2000.
        assert_eq!(h.master.get_new_container_id().unwrap(), 1000);
        assert_eq!(
            h.journal.entries().last(),
            Some(&JournalEntry::ContainerIdGenerator {
                next_container_id: 2000
            })
        );
        assert_eq!(h.journal.entries().len(), 2);
    }

    #[test]
    fn test_container_id_monotonic_and_reserved() {
        let h = harness();
        let mut previous = None;
        for _ in 0..2500 {
            let id = h.master.get_new_container_id().unwrap();
            if let Some(previous) = previous {
                assert!(id > previous);
            }
            previous = Some(id);
        }
        // ceil(2500 / 1000) journal writes.
        assert_eq!(h.journal.entries().len(), 3);
    }

    // ===== Commit and lookup (S2) =====

    #[test]
    fn test_commit_then_lookup() {
        let h = harness();
        let worker_id = register_worker(&h.master, "w1");

        h.master
            .commit_block(worker_id, 1024, "MEM", block(7), 1024)
            .unwrap();

        let info = h.master.get_block_info(block(7)).unwrap();
        assert_eq!(info.length, 1024);
        assert_eq!(info.locations.len(), 1);
        assert_eq!(info.locations[0].worker_id, worker_id);
        assert_eq!(info.locations[0].tier_alias, "MEM");
        assert_eq!(info.locations[0].worker_address, addr("w1"));

        assert_eq!(h.master.get_used_bytes(), 1024);
        assert_eq!(h.master.get_capacity_bytes(), GB);
        assert!(h.master.lost_blocks().is_empty());
    }

    #[test]
    fn test_commit_requires_active_worker() {
        let h = harness();
        let err = h
            .master
            .commit_block(WorkerId::from(12345), 0, "MEM", block(1), 10)
            .unwrap_err();
        assert!(matches!(err, Error::NoWorker { .. }));
    }

    #[test]
    fn test_lookup_unknown_block() {
        let h = harness();
        let err = h.master.get_block_info(block(404)).unwrap_err();
        assert!(matches!(err, Error::BlockNotFound { .. }));

        // The batch lookup silently skips unknown ids instead.
        assert!(h.master.get_block_info_list(&[block(404)]).unwrap().is_empty());
    }

    #[test]
    fn test_lookup_orders_locations_by_tier() {
        let h = harness();
        let w1 = register_worker(&h.master, "w1");
        let w2 = register_worker(&h.master, "w2");

        h.master.commit_block(w1, 100, "SSD", block(3), 100).unwrap();
        h.master.commit_block(w2, 100, "MEM", block(3), 100).unwrap();

        let info = h.master.get_block_info(block(3)).unwrap();
        let tiers: Vec<&str> = info.locations.iter().map(|l| l.tier_alias.as_str()).collect();
        assert_eq!(tiers, vec!["MEM", "SSD"]);
    }

    #[test]
    fn test_safe_mode_blocks_lookups_only() {
        let h = harness();
        let worker_id = register_worker(&h.master, "w1");
        h.master.commit_block(worker_id, 10, "MEM", block(1), 10).unwrap();

        h.master.safe_mode().enter();
        assert!(matches!(
            h.master.get_block_info(block(1)),
            Err(Error::Unavailable(_))
        ));
        assert!(matches!(
            h.master.get_worker_info_list(),
            Err(Error::Unavailable(_))
        ));
        // Mutations are not gated.
        h.master.commit_block(worker_id, 20, "MEM", block(2), 10).unwrap();

        h.master.safe_mode().leave();
        assert_eq!(h.master.get_block_info(block(1)).unwrap().length, 10);
    }

    // ===== Lost worker detection (S3) =====

    #[test]
    fn test_lost_worker_reclamation() {
        let h = harness();
        let worker_id = register_worker(&h.master, "w1");
        h.master
            .commit_block(worker_id, 1024, "MEM", block(7), 1024)
            .unwrap();

        // Within the timeout nothing happens.
        h.clock.advance(h.config.worker_timeout_ms as i64);
        h.master.detect_lost_workers();
        assert_eq!(h.master.worker_count(), 1);

        h.clock.advance(1);
        h.master.detect_lost_workers();
        assert_eq!(h.master.worker_count(), 0);
        assert_eq!(h.master.lost_worker_count(), 1);

        let info = h.master.get_block_info(block(7)).unwrap();
        assert!(info.locations.is_empty());
        assert!(h.master.lost_blocks().contains(&block(7)));

        // A heartbeat under the old id is answered with a register command.
        assert_eq!(
            h.master
                .worker_heartbeat(worker_id, HashMap::new(), &[], &HashMap::new()),
            WorkerCommand::Register
        );

        // The worker returns: same id, revived through the lost set.
        assert_eq!(h.master.get_worker_id(&addr("w1")), worker_id);
        assert_eq!(h.master.worker_count(), 1);
        assert_eq!(h.master.lost_worker_count(), 0);
    }

    #[test]
    fn test_lost_worker_info_list_sorted() {
        let h = harness();
        let w1 = register_worker(&h.master, "w1");
        h.clock.advance(5_000);
        let w2 = register_worker(&h.master, "w2");

        h.clock.advance(h.config.worker_timeout_ms as i64 + 1);
        h.master.detect_lost_workers();

        let lost = h.master.get_lost_worker_info_list();
        assert_eq!(lost.len(), 2);
        // Ascending by seconds since last contact: w2 heard from last.
        assert_eq!(lost[0].id, w2);
        assert_eq!(lost[1].id, w1);
        assert!(lost[0].last_contact_sec <= lost[1].last_contact_sec);
    }

    // ===== Delete and journal (S4) =====

    #[test]
    fn test_delete_and_journal() {
        let h = harness();
        let worker_id = register_worker(&h.master, "w1");
        h.master
            .commit_block(worker_id, 1024, "MEM", block(7), 1024)
            .unwrap();

        h.master.remove_blocks(&[block(7)], true).unwrap();

        assert_eq!(
            h.journal.entries(),
            vec![
                JournalEntry::BlockInfo {
                    block_id: block(7),
                    length: 1024
                },
                JournalEntry::DeleteBlock { block_id: block(7) },
            ]
        );
        assert!(matches!(
            h.master.get_block_info(block(7)),
            Err(Error::BlockNotFound { .. })
        ));
        assert!(!h.master.lost_blocks().contains(&block(7)));

        // The next heartbeat tells the worker to free the block.
        assert_eq!(
            h.master
                .worker_heartbeat(worker_id, HashMap::new(), &[], &HashMap::new()),
            WorkerCommand::Free {
                block_ids: vec![block(7)]
            }
        );
        assert_eq!(
            h.master
                .worker_heartbeat(worker_id, HashMap::new(), &[], &HashMap::new()),
            WorkerCommand::Nothing
        );
    }

    #[test]
    fn test_free_keeps_metadata() {
        let h = harness();
        let worker_id = register_worker(&h.master, "w1");
        h.master.commit_block(worker_id, 100, "MEM", block(8), 100).unwrap();

        h.master.remove_blocks(&[block(8)], false).unwrap();

        // Metadata and location stay until the worker confirms the removal.
        assert_eq!(h.master.get_block_info(block(8)).unwrap().locations.len(), 1);
        assert_eq!(h.journal.entries().len(), 1);

        let command =
            h.master
                .worker_heartbeat(worker_id, HashMap::new(), &[], &HashMap::new());
        assert_eq!(
            command,
            WorkerCommand::Free {
                block_ids: vec![block(8)]
            }
        );

        // The worker reports the removal; now the block is lost.
        h.master
            .worker_heartbeat(worker_id, HashMap::new(), &[block(8)], &HashMap::new());
        assert!(h.master.get_block_info(block(8)).unwrap().locations.is_empty());
        assert!(h.master.lost_blocks().contains(&block(8)));
    }

    #[test]
    fn test_remove_unknown_blocks_is_noop() {
        let h = harness();
        h.master.remove_blocks(&[block(1), block(2)], true).unwrap();
        assert!(h.journal.entries().is_empty());
    }

    #[test]
    fn test_validate_blocks_repairs() {
        let h = harness();
        let worker_id = register_worker(&h.master, "w1");
        h.master.commit_block(worker_id, 10, "MEM", block(1), 10).unwrap();
        h.master.commit_block(worker_id, 20, "MEM", block(2), 10).unwrap();

        h.master
            .validate_blocks(|block_id| block_id != block(2), true)
            .unwrap();

        assert!(h.master.get_block_info(block(1)).is_ok());
        assert!(matches!(
            h.master.get_block_info(block(2)),
            Err(Error::BlockNotFound { .. })
        ));
    }

    // ===== Worker id lifecycle (S5) =====

    #[test]
    fn test_worker_id_lifecycle() {
        let h = harness();
        let worker_id = h.master.get_worker_id(&addr("w1"));

        // Minted but not registered: commits must not see an active worker.
        let err = h
            .master
            .commit_block(worker_id, 100, "MEM", block(9), 100)
            .unwrap_err();
        assert!(matches!(err, Error::NoWorker { .. }));
        assert_eq!(h.master.worker_count(), 0);

        h.master
            .worker_register(
                worker_id,
                vec!["MEM".to_string()],
                HashMap::from([("MEM".to_string(), GB)]),
                HashMap::from([("MEM".to_string(), 0)]),
                HashMap::new(),
            )
            .unwrap();
        assert_eq!(h.master.worker_count(), 1);

        // The same address maps to the same id from now on.
        assert_eq!(h.master.get_worker_id(&addr("w1")), worker_id);
        assert_eq!(h.master.worker_count(), 1);

        h.master.commit_block(worker_id, 100, "MEM", block(9), 100).unwrap();
    }

    #[test]
    fn test_register_unknown_worker_fails() {
        let h = harness();
        let err = h
            .master
            .worker_register(
                WorkerId::from(999),
                vec!["MEM".to_string()],
                HashMap::new(),
                HashMap::new(),
                HashMap::new(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::NoWorker { .. }));
    }

    #[test]
    fn test_heartbeat_from_unknown_worker() {
        let h = harness();
        assert_eq!(
            h.master
                .worker_heartbeat(WorkerId::from(1), HashMap::new(), &[], &HashMap::new()),
            WorkerCommand::Register
        );
    }

    // ===== Unknown length upgrade (S6) =====

    #[test]
    fn test_unknown_length_upgrade() {
        let h = harness();
        h.master
            .commit_block_in_ufs(block(11), UNKNOWN_BLOCK_SIZE)
            .unwrap();

        let worker_id = register_worker(&h.master, "w1");
        h.master
            .commit_block(worker_id, 500, "MEM", block(11), 500)
            .unwrap();

        assert_eq!(h.master.get_block_info(block(11)).unwrap().length, 500);

        let block_11_entries: Vec<JournalEntry> = h
            .journal
            .entries()
            .into_iter()
            .filter(|entry| {
                matches!(entry, JournalEntry::BlockInfo { block_id, .. } if *block_id == block(11))
            })
            .collect();
        assert_eq!(
            block_11_entries,
            vec![
                JournalEntry::BlockInfo {
                    block_id: block(11),
                    length: UNKNOWN_BLOCK_SIZE
                },
                JournalEntry::BlockInfo {
                    block_id: block(11),
                    length: 500
                },
            ]
        );
    }

    #[test]
    fn test_frozen_length_commit_is_silent() {
        let h = harness();
        let worker_id = register_worker(&h.master, "w1");
        h.master.commit_block(worker_id, 10, "MEM", block(5), 100).unwrap();

        // Re-commit with a different length: ignored, no new journal entry.
        h.master.commit_block(worker_id, 10, "MEM", block(5), 999).unwrap();
        assert_eq!(h.master.get_block_info(block(5)).unwrap().length, 100);
        assert_eq!(h.journal.entries().len(), 1);
    }

    #[test]
    fn test_ufs_commit_is_idempotent() {
        let h = harness();
        h.master.commit_block_in_ufs(block(4), 64).unwrap();
        h.master.commit_block_in_ufs(block(4), 64).unwrap();
        assert_eq!(h.journal.entries().len(), 1);
    }

    // ===== Register and heartbeat deltas =====

    #[test]
    fn test_reregister_diffs_resident_blocks() {
        let h = harness();
        let worker_id = register_worker(&h.master, "w1");
        h.master.commit_block(worker_id, 10, "MEM", block(1), 10).unwrap();
        h.master.commit_block(worker_id, 20, "MEM", block(2), 10).unwrap();

        // Re-register reporting only block 2: block 1 was lost on the way.
        h.master
            .worker_register(
                worker_id,
                vec!["MEM".to_string()],
                HashMap::from([("MEM".to_string(), GB)]),
                HashMap::from([("MEM".to_string(), 10)]),
                HashMap::from([("MEM".to_string(), vec![block(2)])]),
            )
            .unwrap();

        assert!(h.master.get_block_info(block(1)).unwrap().locations.is_empty());
        assert!(h.master.lost_blocks().contains(&block(1)));
        assert_eq!(h.master.get_block_info(block(2)).unwrap().locations.len(), 1);
    }

    #[test]
    fn test_register_schedules_orphan_removal() {
        let h = harness();
        let worker_id = h.master.get_worker_id(&addr("w1"));
        // The worker reports block 99 which the master has no metadata for.
        h.master
            .worker_register(
                worker_id,
                vec!["MEM".to_string()],
                HashMap::from([("MEM".to_string(), GB)]),
                HashMap::from([("MEM".to_string(), 0)]),
                HashMap::from([("MEM".to_string(), vec![block(99)])]),
            )
            .unwrap();

        assert_eq!(
            h.master
                .worker_heartbeat(worker_id, HashMap::new(), &[], &HashMap::new()),
            WorkerCommand::Free {
                block_ids: vec![block(99)]
            }
        );
    }

    #[test]
    fn test_heartbeat_applies_added_blocks() {
        let h = harness();
        let w1 = register_worker(&h.master, "w1");
        let w2 = register_worker(&h.master, "w2");
        h.master.commit_block(w1, 10, "MEM", block(6), 10).unwrap();

        let command = h.master.worker_heartbeat(
            w2,
            HashMap::from([("MEM".to_string(), 10)]),
            &[],
            &HashMap::from([("MEM".to_string(), vec![block(6)])]),
        );
        assert_eq!(command, WorkerCommand::Nothing);
        assert_eq!(h.master.get_block_info(block(6)).unwrap().locations.len(), 2);
        assert_eq!(h.master.get_used_bytes(), 20);
    }

    #[test]
    fn test_heartbeat_refreshes_timeout() {
        let h = harness();
        let worker_id = register_worker(&h.master, "w1");

        h.clock.advance(h.config.worker_timeout_ms as i64);
        h.master
            .worker_heartbeat(worker_id, HashMap::new(), &[], &HashMap::new());

        h.clock.advance(h.config.worker_timeout_ms as i64);
        h.master.detect_lost_workers();
        assert_eq!(h.master.worker_count(), 1);
    }

    #[test]
    fn test_report_lost_blocks() {
        let h = harness();
        h.master.report_lost_blocks(&[block(1), block(2)]);
        assert_eq!(h.master.lost_blocks().len(), 2);
    }

    // ===== Aggregates =====

    #[test]
    fn test_capacity_aggregation() {
        let h = harness();
        register_worker(&h.master, "w1");
        register_worker(&h.master, "w2");

        assert_eq!(h.master.get_capacity_bytes(), 2 * GB);
        assert_eq!(h.master.get_total_bytes_on_tiers()["MEM"], 2 * GB);
        assert_eq!(h.master.get_used_bytes_on_tiers()["MEM"], 0);

        let workers = h.master.get_worker_info_list().unwrap();
        assert_eq!(workers.len(), 2);
        assert!(workers.iter().all(|w| w.capacity_bytes == GB));
    }

    // ===== Replay equivalence (invariant 5) =====

    #[test]
    fn test_snapshot_replay_equivalence() {
        let h = harness();
        let worker_id = register_worker(&h.master, "w1");
        h.master.commit_block(worker_id, 100, "MEM", block(1), 100).unwrap();
        h.master.commit_block(worker_id, 300, "MEM", block(2), 200).unwrap();
        h.master.commit_block_in_ufs(block(3), 300).unwrap();
        h.master.remove_blocks(&[block(2)], true).unwrap();
        let last_id = (0..3)
            .map(|_| h.master.get_new_container_id().unwrap())
            .last()
            .unwrap();

        let restored = harness();
        for entry in h.master.journal_entries() {
            restored.master.process_journal_entry(&entry);
        }

        assert_eq!(restored.master.get_block_info(block(1)).unwrap().length, 100);
        assert_eq!(restored.master.get_block_info(block(3)).unwrap().length, 300);
        assert!(matches!(
            restored.master.get_block_info(block(2)),
            Err(Error::BlockNotFound { .. })
        ));
        // Replicas are runtime state; they come back with the workers.
        assert!(restored.master.get_block_info(block(1)).unwrap().locations.is_empty());

        // No already-returned container id can be returned again.
        assert!(restored.master.get_new_container_id().unwrap() > last_id);
    }

    #[test]
    fn test_journal_replay_equivalence() {
        let h = harness();
        let worker_id = register_worker(&h.master, "w1");
        h.master
            .commit_block_in_ufs(block(11), UNKNOWN_BLOCK_SIZE)
            .unwrap();
        h.master.commit_block(worker_id, 500, "MEM", block(11), 500).unwrap();
        h.master.commit_block(worker_id, 600, "MEM", block(12), 100).unwrap();
        h.master.remove_blocks(&[block(12)], true).unwrap();
        h.master.get_new_container_id().unwrap();

        // Replay the raw journal (not the snapshot) into a fresh master.
        let restored = harness();
        for entry in h.journal.entries() {
            restored.master.process_journal_entry(&entry);
        }

        assert_eq!(restored.master.get_block_info(block(11)).unwrap().length, 500);
        assert!(matches!(
            restored.master.get_block_info(block(12)),
            Err(Error::BlockNotFound { .. })
        ));
        assert!(restored.master.get_new_container_id().unwrap() >= 1000);
    }
}
