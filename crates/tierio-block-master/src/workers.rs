//! Worker registry
//!
//! Workers live in exactly one of three sets:
//! - `temp`: id minted via `getWorkerId` but registration not completed.
//!   Registration spans two RPCs, and a commit arriving between them must be
//!   able to find the id without treating the worker as serving.
//! - `active`: registered and heartbeating.
//! - `lost`: timed out; revived with its old id if the worker returns.
//!
//! Each set is dual-indexed by worker id and by network address; ids and
//! addresses are unique across all three sets. Membership is guarded by one
//! registry lock. Handlers look a worker up, drop the registry lock, then
//! take the worker's own mutex; a thread already holding a worker mutex may
//! migrate that worker between sets, but never the reverse order.

use crate::meta::MasterWorkerInfo;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tierio_common::{WorkerId, WorkerNetAddress};

/// One lifecycle set, indexed by id and by address.
#[derive(Default)]
struct WorkerSet {
    by_id: HashMap<WorkerId, Arc<MasterWorkerInfo>>,
    by_address: HashMap<WorkerNetAddress, Arc<MasterWorkerInfo>>,
}

impl WorkerSet {
    fn insert(&mut self, worker: Arc<MasterWorkerInfo>) -> bool {
        if self.by_id.contains_key(&worker.id()) || self.by_address.contains_key(worker.address())
        {
            return false;
        }
        self.by_address
            .insert(worker.address().clone(), Arc::clone(&worker));
        self.by_id.insert(worker.id(), worker);
        true
    }

    fn remove(&mut self, worker_id: WorkerId) -> Option<Arc<MasterWorkerInfo>> {
        let worker = self.by_id.remove(&worker_id)?;
        self.by_address.remove(worker.address());
        Some(worker)
    }

    fn get_by_id(&self, worker_id: WorkerId) -> Option<Arc<MasterWorkerInfo>> {
        self.by_id.get(&worker_id).cloned()
    }

    fn get_by_address(&self, address: &WorkerNetAddress) -> Option<Arc<MasterWorkerInfo>> {
        self.by_address.get(address).cloned()
    }

    fn contains_id(&self, worker_id: WorkerId) -> bool {
        self.by_id.contains_key(&worker_id)
    }

    fn contains_address(&self, address: &WorkerNetAddress) -> bool {
        self.by_address.contains_key(address)
    }

    fn snapshot(&self) -> Vec<Arc<MasterWorkerInfo>> {
        self.by_id.values().cloned().collect()
    }

    fn len(&self) -> usize {
        self.by_id.len()
    }
}

#[derive(Default)]
struct Sets {
    active: WorkerSet,
    lost: WorkerSet,
    temp: WorkerSet,
}

impl Sets {
    fn id_in_use(&self, worker_id: WorkerId) -> bool {
        self.active.contains_id(worker_id)
            || self.lost.contains_id(worker_id)
            || self.temp.contains_id(worker_id)
    }

    fn address_in_use(&self, address: &WorkerNetAddress) -> bool {
        self.active.contains_address(address)
            || self.lost.contains_address(address)
            || self.temp.contains_address(address)
    }
}

/// The three disjoint worker sets.
#[derive(Default)]
pub struct WorkerRegistry {
    sets: RwLock<Sets>,
}

impl WorkerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Find an active worker by id.
    #[must_use]
    pub fn get_active_by_id(&self, worker_id: WorkerId) -> Option<Arc<MasterWorkerInfo>> {
        self.sets.read().active.get_by_id(worker_id)
    }

    /// Find an active worker by address.
    #[must_use]
    pub fn get_active_by_address(
        &self,
        address: &WorkerNetAddress,
    ) -> Option<Arc<MasterWorkerInfo>> {
        self.sets.read().active.get_by_address(address)
    }

    /// Find a not-yet-registered worker by address.
    #[must_use]
    pub fn get_temp_by_address(&self, address: &WorkerNetAddress) -> Option<Arc<MasterWorkerInfo>> {
        self.sets.read().temp.get_by_address(address)
    }

    /// Find a lost worker by address.
    #[must_use]
    pub fn get_lost_by_address(&self, address: &WorkerNetAddress) -> Option<Arc<MasterWorkerInfo>> {
        self.sets.read().lost.get_by_address(address)
    }

    /// Insert a freshly minted worker into the temp set.
    ///
    /// Fails if the id or address is already in use in any set.
    pub fn insert_temp(&self, worker: Arc<MasterWorkerInfo>) -> bool {
        let mut sets = self.sets.write();
        if sets.id_in_use(worker.id()) || sets.address_in_use(worker.address()) {
            return false;
        }
        sets.temp.insert(worker)
    }

    /// Move a worker from the temp set to the active set.
    pub fn promote_temp(&self, worker_id: WorkerId) -> Option<Arc<MasterWorkerInfo>> {
        let mut sets = self.sets.write();
        let worker = sets.temp.remove(worker_id)?;
        sets.active.insert(Arc::clone(&worker));
        Some(worker)
    }

    /// Move a worker from the lost set back to the active set.
    pub fn revive_lost(&self, worker_id: WorkerId) -> Option<Arc<MasterWorkerInfo>> {
        let mut sets = self.sets.write();
        let worker = sets.lost.remove(worker_id)?;
        sets.active.insert(Arc::clone(&worker));
        Some(worker)
    }

    /// Move a worker from the active set to the lost set.
    pub fn mark_lost(&self, worker_id: WorkerId) -> Option<Arc<MasterWorkerInfo>> {
        let mut sets = self.sets.write();
        let worker = sets.active.remove(worker_id)?;
        sets.lost.insert(Arc::clone(&worker));
        Some(worker)
    }

    /// Snapshot of the active set.
    #[must_use]
    pub fn active_snapshot(&self) -> Vec<Arc<MasterWorkerInfo>> {
        self.sets.read().active.snapshot()
    }

    /// Snapshot of the lost set.
    #[must_use]
    pub fn lost_snapshot(&self) -> Vec<Arc<MasterWorkerInfo>> {
        self.sets.read().lost.snapshot()
    }

    /// Number of active workers.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.sets.read().active.len()
    }

    /// Number of lost workers.
    #[must_use]
    pub fn lost_count(&self) -> usize {
        self.sets.read().lost.len()
    }

    /// Number of minted-but-unregistered workers.
    #[must_use]
    pub fn temp_count(&self) -> usize {
        self.sets.read().temp.len()
    }
}
