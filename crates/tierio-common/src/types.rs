//! Core type definitions for Tierio
//!
//! This module defines the fundamental types used throughout the system
//! including block and worker identifiers and worker network addresses.

use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sentinel for a block whose byte length is not yet known.
///
/// A block committed through the under-filesystem path may be created before
/// any worker has reported its size; the length is bound later by the first
/// worker commit and is frozen from then on.
pub const UNKNOWN_BLOCK_SIZE: u64 = u64::MAX;

/// Number of low bits of a block id holding the sequence number. The
/// remaining high bits hold the container id handed out by the master.
pub const SEQUENCE_NUMBER_BITS: u32 = 24;

/// Largest sequence number a container can hold.
pub const MAX_SEQUENCE_NUMBER: u64 = (1 << SEQUENCE_NUMBER_BITS) - 1;

/// Unique identifier for a block.
///
/// The high bits are the container id (allocated in reserved batches by the
/// master), the low [`SEQUENCE_NUMBER_BITS`] bits are the sequence number
/// assigned by the client within that container.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into,
)]
pub struct BlockId(u64);

impl BlockId {
    /// Compose a block id from a container id and a sequence number.
    #[must_use]
    pub const fn compose(container_id: u64, sequence_number: u64) -> Self {
        Self((container_id << SEQUENCE_NUMBER_BITS) | (sequence_number & MAX_SEQUENCE_NUMBER))
    }

    /// The container id portion of this block id.
    #[must_use]
    pub const fn container_id(&self) -> u64 {
        self.0 >> SEQUENCE_NUMBER_BITS
    }

    /// The sequence number portion of this block id.
    #[must_use]
    pub const fn sequence_number(&self) -> u64 {
        self.0 & MAX_SEQUENCE_NUMBER
    }

    /// The raw 64-bit value.
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({})", self.0)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a storage worker.
///
/// Minted by the master on first contact; non-negative so it survives a
/// round-trip through signed 64-bit wire fields.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into,
)]
pub struct WorkerId(u64);

impl WorkerId {
    /// The raw 64-bit value.
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WorkerId({})", self.0)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Network address of a storage worker.
///
/// Uniquely identifies a worker process across restarts; the master keys its
/// address index on the full triple.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerNetAddress {
    /// Hostname or IP the worker serves RPCs on
    pub host: String,
    /// Worker RPC port
    pub rpc_port: u16,
    /// Worker data transfer port
    pub data_port: u16,
}

impl WorkerNetAddress {
    /// Create a new worker address.
    #[must_use]
    pub fn new(host: impl Into<String>, rpc_port: u16, data_port: u16) -> Self {
        Self {
            host: host.into(),
            rpc_port,
            data_port,
        }
    }
}

impl fmt::Debug for WorkerNetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "WorkerNetAddress({}:{}/{})",
            self.host, self.rpc_port, self.data_port
        )
    }
}

impl fmt::Display for WorkerNetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.rpc_port)
    }
}
