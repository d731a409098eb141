//! Tierio Block Master - cluster metadata engine
//!
//! This crate implements the master-side metadata engine for a tiered
//! storage cluster:
//! - Block registry (block id -> length and worker replica locations)
//! - Worker registry (temp / active / lost lifecycle, dual-indexed)
//! - Container id generation with journal-backed reservation
//! - The commit / register / heartbeat protocol
//! - Lost-worker detection
//! - Journaling of state transitions and replay on recovery
//!
//! The engine is transport-free; the gRPC surface lives in the master
//! daemon and delegates to [`master::BlockMaster`].

pub mod clock;
pub mod container_id;
pub mod journal;
pub mod master;
pub mod meta;
pub mod safe_mode;
pub mod tier;
pub mod workers;

// Re-exports
pub use clock::{Clock, SystemClock};
pub use container_id::CONTAINER_ID_RESERVATION_SIZE;
pub use journal::{Journal, JournalContext, JournalEntry, JournalLog, MemoryJournal};
pub use master::{BlockInfo, BlockLocation, BlockMaster, WorkerCommand, WorkerInfo};
pub use safe_mode::SafeModeManager;
pub use tier::StorageTierOrder;
pub use workers::WorkerRegistry;
