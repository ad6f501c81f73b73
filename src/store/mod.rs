//! The shared store: transport, ledger and mutex in one versioned repository.
//!
//! Hosts never talk to each other. Every coordination decision is made by
//! reading a synchronized snapshot of the store and publishing a change-set
//! that the store either accepts whole or rejects because someone else
//! published first.

mod git;
mod memory;

pub use git::GitStore;
pub use memory::{MemoryRemote, MemoryStore};

use crate::error::Result;

/// Result of pulling the latest accepted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Local view already matched the store.
    UpToDate,
    /// Local view advanced to the store's latest state.
    FastForwarded,
    /// Local view holds unpublished state; discard before syncing again.
    Diverged,
}

/// Result of pushing the pending change-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Publish {
    /// The change-set is now the store's latest state.
    Accepted,
    /// The store moved since the last sync; nothing was applied.
    Rejected,
}

/// A versioned store with conflict-on-concurrent-write semantics.
///
/// Writes and removals are staged locally until [`publish`](Self::publish).
/// A publish is all-or-nothing and is rejected whenever another writer was
/// accepted after this handle's last [`sync`](Self::sync).
pub trait SharedStore {
    /// Pulls the latest accepted state. Blocks until the store answers.
    fn sync(&mut self) -> Result<SyncStatus>;

    /// Reads a file from the local view, including staged changes.
    fn read(&self, path: &str) -> Result<Option<Vec<u8>>>;

    fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.read(path)?.is_some())
    }

    /// File names directly inside `dir`, sorted.
    fn list(&self, dir: &str) -> Result<Vec<String>>;

    fn write(&mut self, path: &str, contents: &[u8]) -> Result<()>;

    /// Removes a file. Missing files are not an error.
    fn remove(&mut self, path: &str) -> Result<()>;

    /// Publishes every staged change as one change-set.
    fn publish(&mut self, message: &str) -> Result<Publish>;

    /// Drops unpublished local state, returning to the last synced view.
    fn discard(&mut self) -> Result<()>;
}
