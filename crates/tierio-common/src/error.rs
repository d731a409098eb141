//! Error types for Tierio
//!
//! This module defines the common error types used throughout the system.

use crate::types::{BlockId, WorkerId};
use thiserror::Error;

/// Common result type for Tierio operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Tierio
#[derive(Debug, Error)]
pub enum Error {
    // Metadata errors
    #[error("block not found: {block_id}")]
    BlockNotFound { block_id: BlockId },

    #[error("no worker with id {worker_id}")]
    NoWorker { worker_id: WorkerId },

    // Journal errors
    #[error("unexpected journal entry tag: {tag}")]
    UnexpectedJournalEntry { tag: u8 },

    #[error("journal error: {0}")]
    Journal(String),

    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    // Service errors
    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an unavailable error
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Create a journal error
    pub fn journal(msg: impl Into<String>) -> Self {
        Self::Journal(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::BlockNotFound { .. } | Self::NoWorker { .. })
    }

    /// Check if this is a retryable error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_not_found() {
        assert!(Error::BlockNotFound {
            block_id: BlockId::from(7)
        }
        .is_not_found());
        assert!(Error::NoWorker {
            worker_id: WorkerId::from(42)
        }
        .is_not_found());
        assert!(!Error::unavailable("safe mode").is_not_found());
    }

    #[test]
    fn test_error_retryable() {
        assert!(Error::unavailable("journal closed").is_retryable());
        assert!(!Error::internal("bad state").is_retryable());
    }
}
