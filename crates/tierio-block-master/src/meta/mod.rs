//! Master-side metadata objects
//!
//! Each block and each worker is represented by one metadata object with an
//! immutable identity and a mutex over its mutable fields. An object must be
//! locked before any mutable field is read or written; when a worker and a
//! block must be locked together, the worker is locked first.

pub mod block_info;
pub mod worker_info;

pub use block_info::{BlockMeta, MasterBlockInfo};
pub use worker_info::{MasterWorkerInfo, WorkerMeta};
