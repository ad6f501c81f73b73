//! In-memory versioned store with atomic accept-or-reject publish.
//!
//! [`MemoryRemote`] plays the shared repository; each host gets its own
//! [`MemoryStore`] checkout. A publish succeeds only when the remote version
//! still equals the version the checkout last synced, mirroring a
//! fast-forward-only push.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{BenchError, Result};
use crate::store::{Publish, SharedStore, SyncStatus};

#[derive(Debug, Default)]
struct RemoteState {
    version: u64,
    files: BTreeMap<String, Vec<u8>>,
    history: Vec<String>,
}

/// The shared side of the in-memory store. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct MemoryRemote {
    state: Arc<Mutex<RemoteState>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, RemoteState>> {
        self.state
            .lock()
            .map_err(|_| BenchError::Store("memory remote lock poisoned".into()))
    }

    /// A fresh checkout, synced to the current remote state.
    pub fn checkout(&self) -> Result<MemoryStore> {
        let state = self.lock()?;
        Ok(MemoryStore {
            remote: self.clone(),
            base_version: state.version,
            base: state.files.clone(),
            pending: BTreeMap::new(),
        })
    }

    pub fn version(&self) -> Result<u64> {
        Ok(self.lock()?.version)
    }

    /// Snapshot of every file currently accepted by the remote.
    pub fn files(&self) -> Result<BTreeMap<String, Vec<u8>>> {
        Ok(self.lock()?.files.clone())
    }

    /// Messages of every accepted change-set, oldest first.
    pub fn history(&self) -> Result<Vec<String>> {
        Ok(self.lock()?.history.clone())
    }
}

/// One host's view of a [`MemoryRemote`].
#[derive(Debug)]
pub struct MemoryStore {
    remote: MemoryRemote,
    base_version: u64,
    base: BTreeMap<String, Vec<u8>>,
    // `None` marks a staged removal.
    pending: BTreeMap<String, Option<Vec<u8>>>,
}

impl MemoryStore {
    pub fn remote(&self) -> &MemoryRemote {
        &self.remote
    }

    fn effective_changes(&self) -> BTreeMap<String, Option<Vec<u8>>> {
        self.pending
            .iter()
            .filter(|(path, change)| self.base.get(*path) != change.as_ref())
            .map(|(path, change)| (path.clone(), change.clone()))
            .collect()
    }
}

impl SharedStore for MemoryStore {
    fn sync(&mut self) -> Result<SyncStatus> {
        if !self.effective_changes().is_empty() {
            return Ok(SyncStatus::Diverged);
        }
        self.pending.clear();
        let state = self.remote.lock()?;
        if state.version == self.base_version {
            return Ok(SyncStatus::UpToDate);
        }
        self.base = state.files.clone();
        self.base_version = state.version;
        Ok(SyncStatus::FastForwarded)
    }

    fn read(&self, path: &str) -> Result<Option<Vec<u8>>> {
        match self.pending.get(path) {
            Some(change) => Ok(change.clone()),
            None => Ok(self.base.get(path).cloned()),
        }
    }

    fn list(&self, dir: &str) -> Result<Vec<String>> {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        let child = |path: &str| -> Option<String> {
            let rest = path.strip_prefix(&prefix)?;
            (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
        };

        let mut names: Vec<String> = self
            .base
            .keys()
            .filter(|path| !matches!(self.pending.get(*path), Some(None)))
            .filter_map(|path| child(path))
            .collect();
        names.extend(
            self.pending
                .iter()
                .filter(|(_, change)| change.is_some())
                .filter_map(|(path, _)| child(path)),
        );
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn write(&mut self, path: &str, contents: &[u8]) -> Result<()> {
        self.pending.insert(path.to_string(), Some(contents.to_vec()));
        Ok(())
    }

    fn remove(&mut self, path: &str) -> Result<()> {
        self.pending.insert(path.to_string(), None);
        Ok(())
    }

    fn publish(&mut self, message: &str) -> Result<Publish> {
        let changes = self.effective_changes();
        if changes.is_empty() {
            self.pending.clear();
            return Ok(Publish::Accepted);
        }

        let mut state = self.remote.lock()?;
        if state.version != self.base_version {
            return Ok(Publish::Rejected);
        }
        for (path, change) in changes {
            match change {
                Some(bytes) => state.files.insert(path, bytes),
                None => state.files.remove(&path),
            };
        }
        state.version += 1;
        state.history.push(message.to_string());

        self.base = state.files.clone();
        self.base_version = state.version;
        self.pending.clear();
        Ok(Publish::Accepted)
    }

    fn discard(&mut self) -> Result<()> {
        self.pending.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staged_writes_are_visible_locally_only() {
        let remote = MemoryRemote::new();
        let mut a = remote.checkout().unwrap();
        let b = remote.checkout().unwrap();

        a.write("runs/x.json", b"{}").unwrap();
        assert!(a.exists("runs/x.json").unwrap());
        assert!(!b.exists("runs/x.json").unwrap());
        assert!(remote.files().unwrap().is_empty());
    }

    #[test]
    fn first_publish_wins_second_is_rejected() {
        let remote = MemoryRemote::new();
        let mut a = remote.checkout().unwrap();
        let mut b = remote.checkout().unwrap();

        a.write("claims/x.claim", b"a").unwrap();
        b.write("claims/x.claim", b"b").unwrap();

        assert_eq!(a.publish("claim x").unwrap(), Publish::Accepted);
        assert_eq!(b.publish("claim x").unwrap(), Publish::Rejected);
        assert_eq!(remote.files().unwrap()["claims/x.claim"], b"a".to_vec());
        assert_eq!(remote.history().unwrap(), vec!["claim x".to_string()]);
    }

    #[test]
    fn sync_reports_divergence_until_discarded() {
        let remote = MemoryRemote::new();
        let mut a = remote.checkout().unwrap();
        let mut b = remote.checkout().unwrap();

        a.write("f", b"1").unwrap();
        a.publish("one").unwrap();

        b.write("g", b"2").unwrap();
        assert_eq!(b.sync().unwrap(), SyncStatus::Diverged);
        b.discard().unwrap();
        assert_eq!(b.sync().unwrap(), SyncStatus::FastForwarded);
        assert_eq!(b.read("f").unwrap(), Some(b"1".to_vec()));
        assert_eq!(b.read("g").unwrap(), None);
        assert_eq!(b.sync().unwrap(), SyncStatus::UpToDate);
    }

    #[test]
    fn unchanged_writes_publish_without_new_version() {
        let remote = MemoryRemote::new();
        let mut a = remote.checkout().unwrap();
        a.write("phase/p.txt", b"x\n").unwrap();
        a.publish("compile").unwrap();
        assert_eq!(remote.version().unwrap(), 1);

        a.write("phase/p.txt", b"x\n").unwrap();
        assert_eq!(a.publish("compile").unwrap(), Publish::Accepted);
        assert_eq!(remote.version().unwrap(), 1);
        assert_eq!(a.sync().unwrap(), SyncStatus::UpToDate);
    }

    #[test]
    fn list_merges_staged_changes() {
        let remote = MemoryRemote::new();
        let mut a = remote.checkout().unwrap();
        a.write("runs/a.json", b"1").unwrap();
        a.write("runs/b.json", b"1").unwrap();
        a.write("runs/claims/a.json.claim", b"1").unwrap();
        a.publish("seed").unwrap();

        a.remove("runs/a.json").unwrap();
        a.write("runs/c.json", b"1").unwrap();
        assert_eq!(
            a.list("runs").unwrap(),
            vec!["b.json".to_string(), "c.json".to_string()]
        );
        assert_eq!(a.list("runs/claims/").unwrap(), vec!["a.json.claim".to_string()]);
    }

    #[test]
    fn removal_is_published() {
        let remote = MemoryRemote::new();
        let mut a = remote.checkout().unwrap();
        a.write("f", b"1").unwrap();
        a.publish("add").unwrap();
        a.remove("f").unwrap();
        a.publish("remove").unwrap();
        assert!(remote.files().unwrap().is_empty());
        assert_eq!(remote.version().unwrap(), 2);
    }
}
