//! Journaling of master state transitions
//!
//! The master journals exactly three kinds of state transition: the
//! container-id reservation bound, a block's id/length binding, and a block
//! deletion. Replaying the entries in order reconstructs semantically
//! identical metadata (worker state is rebuilt from registration, not from
//! the journal).
//!
//! Handlers do not talk to the log directly. Each handler opens a
//! [`JournalContext`], appends the entries its state transitions produce,
//! and closes the context on success; the close durably flushes the whole
//! batch. A context dropped on an error path discards its entries, so the
//! durable log never holds a partial handler.

mod log;

pub use log::JournalLog;

use parking_lot::Mutex;
use tierio_common::{BlockId, Error, Result};
use tracing::warn;

/// A journaled state transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JournalEntry {
    /// New upper bound of the container-id reservation.
    ContainerIdGenerator { next_container_id: u64 },
    /// A block's id/length binding was created or its length was bound.
    BlockInfo { block_id: BlockId, length: u64 },
    /// A block's metadata was deleted.
    DeleteBlock { block_id: BlockId },
}

/// Sink for journal entries.
///
/// `append` must make the whole batch durable before returning; replay must
/// observe a prefix of appended batches with no batch split in half.
pub trait Journal: Send + Sync {
    /// Durably append a batch of entries.
    fn append(&self, entries: &[JournalEntry]) -> Result<()>;
}

/// Scoped, buffered journal handle for a single handler invocation.
///
/// Entries become durable only when the context is closed. Dropping the
/// context without closing it discards the buffered entries.
pub struct JournalContext<'a> {
    journal: &'a dyn Journal,
    pending: Vec<JournalEntry>,
    flushed: bool,
}

impl<'a> JournalContext<'a> {
    pub(crate) fn new(journal: &'a dyn Journal) -> Self {
        Self {
            journal,
            pending: Vec::new(),
            flushed: false,
        }
    }

    /// Buffer an entry for the flush at scope exit.
    pub fn append(&mut self, entry: JournalEntry) {
        self.pending.push(entry);
    }

    /// Flush the buffered entries.
    ///
    /// A flush failure surfaces as `Unavailable`: the handler's state may
    /// already be ahead of the durable log and the caller must give up.
    pub fn close(mut self) -> Result<()> {
        self.flushed = true;
        if self.pending.is_empty() {
            return Ok(());
        }
        let entries = std::mem::take(&mut self.pending);
        self.journal
            .append(&entries)
            .map_err(|e| Error::unavailable(format!("journal flush failed: {e}")))
    }
}

impl Drop for JournalContext<'_> {
    fn drop(&mut self) {
        if !self.flushed && !self.pending.is_empty() {
            warn!(
                "discarding {} journal entries from an aborted handler",
                self.pending.len()
            );
        }
    }
}

/// Journal kept in memory only.
///
/// Used when the master runs without a journal directory; recovers nothing
/// across restarts.
#[derive(Default)]
pub struct MemoryJournal {
    entries: Mutex<Vec<JournalEntry>>,
}

impl MemoryJournal {
    /// Create an empty in-memory journal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything appended so far.
    #[must_use]
    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries.lock().clone()
    }
}

impl Journal for MemoryJournal {
    fn append(&self, entries: &[JournalEntry]) -> Result<()> {
        self.entries.lock().extend_from_slice(entries);
        Ok(())
    }
}
