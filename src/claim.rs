//! Claim manager: optimistic mutual exclusion over the shared store.
//!
//! A claim is a marker file published like any other change. Whichever host
//! gets its publish accepted first owns the item; everyone else sees the
//! rejection, rolls back and moves on. There is no lock service and no lease.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{BenchError, Result};
use crate::item::WorkItem;
use crate::layout::{CLAIM_SUFFIX, Layout};
use crate::ledger::{self, ErrorRecord, ResultRecord};
use crate::manifest::{self, Manifest};
use crate::store::{Publish, SharedStore, SyncStatus};
use crate::sync::{RetryConfig, publish_with_retry, synchronize};

/// Informational content of a claim marker. Only its existence matters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimMarker {
    pub item: String,
    pub phase: String,
    pub host: String,
    pub claim_id: String,
    pub claimed_at: DateTime<Utc>,
}

/// An accepted claim held by this host.
#[derive(Debug, Clone, PartialEq)]
pub struct Claim {
    pub item: WorkItem,
    pub marker: ClaimMarker,
    /// True when the marker was already ours from an earlier, interrupted run.
    pub resumed: bool,
}

impl Claim {
    pub fn phase(&self) -> &str {
        &self.marker.phase
    }
}

/// Why an item could not be claimed. None of these are errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LossReason {
    /// A result already exists.
    Completed,
    /// The item is no longer in the phase manifest.
    Dequeued,
    /// Another host holds a marker for it.
    HeldBy(String),
    /// Another host published first.
    Race,
}

impl std::fmt::Display for LossReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LossReason::Completed => write!(f, "already completed"),
            LossReason::Dequeued => write!(f, "no longer queued"),
            LossReason::HeldBy(host) => write!(f, "claimed by {host}"),
            LossReason::Race => write!(f, "lost publish race"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Claimed(Claim),
    Lost(LossReason),
}

/// What to publish when releasing a claim.
#[derive(Debug, Clone, PartialEq)]
pub enum Release {
    /// Write the result and dequeue the item.
    Completed(ResultRecord),
    /// Record the failure on the side; the item stays queued.
    Failed(ErrorRecord),
}

/// A claim marker as found in the store.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimEntry {
    pub file: String,
    pub item: Option<WorkItem>,
    pub marker: Option<ClaimMarker>,
}

impl ClaimEntry {
    pub fn owner(&self) -> Option<&str> {
        self.marker.as_ref().map(|m| m.host.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClearOutcome {
    Removed,
    NotFound,
    /// Refused because another host owns the marker and `force` was off.
    ForeignOwner(String),
}

/// Owns the store handle and performs every claim-related change-set.
pub struct ClaimManager<S: SharedStore> {
    store: S,
    host: String,
    layout: Layout,
    retry: RetryConfig,
}

impl<S: SharedStore> ClaimManager<S> {
    pub fn new(store: S, host: impl Into<String>, layout: Layout, retry: RetryConfig) -> Self {
        Self {
            store,
            host: host.into(),
            layout,
            retry,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn into_store(self) -> S {
        self.store
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn retry(&self) -> &RetryConfig {
        &self.retry
    }

    /// Pulls the latest accepted state, abandoning anything unpublished.
    pub async fn sync(&mut self) -> Result<SyncStatus> {
        synchronize(&mut self.store, &self.retry).await
    }

    /// Reads the marker for `item`, if any. Unreadable markers still count
    /// as held, by an unknown owner.
    pub fn marker(&self, item: &WorkItem) -> Result<Option<ClaimEntry>> {
        let path = self.layout.claim_path(item);
        Ok(self.store.read(&path)?.map(|bytes| ClaimEntry {
            file: format!("{}{CLAIM_SUFFIX}", item.name()),
            item: Some(item.clone()),
            marker: serde_json::from_slice(&bytes).ok(),
        }))
    }

    /// Attempts to take exclusive ownership of `item` in `phase`.
    ///
    /// Returns [`ClaimOutcome::Lost`] without writing anything when the item
    /// is done, dequeued or held elsewhere. A marker already owned by this
    /// host is resumed instead of re-published.
    pub async fn try_claim(&mut self, phase: &str, item: &WorkItem) -> Result<ClaimOutcome> {
        self.sync().await?;

        if ledger::has_result(&self.store, &self.layout, item)? {
            return Ok(ClaimOutcome::Lost(LossReason::Completed));
        }
        if !self.is_queued(phase, item)? {
            return Ok(ClaimOutcome::Lost(LossReason::Dequeued));
        }
        if let Some(entry) = self.marker(item)? {
            return Ok(match entry.marker {
                Some(marker) if marker.host == self.host => {
                    info!(item = %item.name(), claim_id = %marker.claim_id, "resuming own claim");
                    ClaimOutcome::Claimed(Claim {
                        item: item.clone(),
                        marker,
                        resumed: true,
                    })
                }
                Some(marker) => ClaimOutcome::Lost(LossReason::HeldBy(marker.host)),
                None => ClaimOutcome::Lost(LossReason::HeldBy("unknown".into())),
            });
        }

        let marker = ClaimMarker {
            item: item.name(),
            phase: phase.to_string(),
            host: self.host.clone(),
            claim_id: uuid::Uuid::new_v4().to_string(),
            claimed_at: Utc::now(),
        };
        let path = self.layout.claim_path(item);
        let message = format!("claim {} by {}", item.name(), self.host);

        match self.stage_and_publish(&path, &marker, &message) {
            Ok(Publish::Accepted) => {
                debug!(item = %item.name(), claim_id = %marker.claim_id, "claim accepted");
                Ok(ClaimOutcome::Claimed(Claim {
                    item: item.clone(),
                    marker,
                    resumed: false,
                }))
            }
            Ok(Publish::Rejected) => {
                self.store.discard()?;
                self.sync().await?;
                Ok(ClaimOutcome::Lost(LossReason::Race))
            }
            Err(e) => {
                self.store.discard()?;
                Err(e)
            }
        }
    }

    fn stage_and_publish(
        &mut self,
        path: &str,
        marker: &ClaimMarker,
        message: &str,
    ) -> Result<Publish> {
        let bytes = serde_json::to_vec_pretty(marker)?;
        self.store.write(path, &bytes)?;
        self.store.publish(message)
    }

    fn is_queued(&self, phase: &str, item: &WorkItem) -> Result<bool> {
        match Manifest::load(&self.store, &self.layout, phase) {
            Ok(manifest) => Ok(manifest.contains(item)),
            Err(BenchError::MissingManifest(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Removes the marker and publishes the outcome as one change-set.
    ///
    /// On success the result is written (unless one already exists) and the
    /// item leaves the manifest. On failure only an error record is added.
    pub async fn release(&mut self, claim: &Claim, release: &Release) -> Result<()> {
        let layout = self.layout.clone();
        let item = &claim.item;
        let phase = claim.phase().to_string();
        let verb = match release {
            Release::Completed(_) => "complete",
            Release::Failed(_) => "fail",
        };
        let message = format!("{verb} {} by {}", item.name(), self.host);
        let mut duplicate = false;

        publish_with_retry(&mut self.store, &self.retry, &message, |store| {
            store.remove(&layout.claim_path(item))?;
            match release {
                Release::Completed(record) => {
                    duplicate = !ledger::write_result(store, &layout, item, record)?;
                    match Manifest::load(&*store, &layout, &phase) {
                        Ok(mut manifest) => {
                            if manifest.remove(item) {
                                manifest.save(store, &layout)?;
                            }
                        }
                        Err(BenchError::MissingManifest(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
                Release::Failed(record) => {
                    ledger::write_error(store, &layout, item, record)?;
                }
            }
            Ok(())
        })
        .await?;

        if duplicate {
            warn!(item = %item.name(), "result already existed, kept the first one");
        }
        Ok(())
    }

    /// Every claim marker currently in the store, sorted by file name.
    pub fn list(&self) -> Result<Vec<ClaimEntry>> {
        list_entries(&self.store, &self.layout)
    }

    /// Deletes markers whose item is completed or no longer queued anywhere.
    /// Live claims on queued items are never touched.
    pub async fn prune(&mut self) -> Result<Vec<String>> {
        let layout = self.layout.clone();
        let message = format!("prune orphan claims by {}", self.host);
        let mut removed = Vec::new();

        publish_with_retry(&mut self.store, &self.retry, &message, |store| {
            removed.clear();
            let mut queued = Vec::new();
            // A corrupt manifest aborts the prune rather than orphaning its claims.
            for phase in manifest::list_phases(&*store, &layout)? {
                let m = Manifest::load(&*store, &layout, &phase)?;
                queued.extend(m.entries().iter().cloned());
            }
            for entry in list_entries(&*store, &layout)? {
                let orphan = match &entry.item {
                    Some(item) => {
                        ledger::has_result(&*store, &layout, item)? || !queued.contains(item)
                    }
                    None => false,
                };
                if orphan {
                    store.remove(&crate::layout::join(&layout.claims_dir, &entry.file))?;
                    removed.push(entry.file);
                }
            }
            Ok(())
        })
        .await?;

        if !removed.is_empty() {
            info!(count = removed.len(), "pruned orphan claims");
        }
        Ok(removed)
    }

    /// Removes the marker for one item. Refuses foreign markers unless forced.
    pub async fn clear(&mut self, item: &WorkItem, force: bool) -> Result<ClearOutcome> {
        self.sync().await?;
        let Some(entry) = self.marker(item)? else {
            return Ok(ClearOutcome::NotFound);
        };
        if let Some(owner) = entry.owner()
            && owner != self.host
            && !force
        {
            return Ok(ClearOutcome::ForeignOwner(owner.to_string()));
        }

        let path = self.layout.claim_path(item);
        let message = format!("clear claim {} by {}", item.name(), self.host);
        publish_with_retry(&mut self.store, &self.retry, &message, |store| {
            store.remove(&path)
        })
        .await?;
        warn!(item = %item.name(), owner = ?entry.owner(), "claim cleared manually");
        Ok(ClearOutcome::Removed)
    }
}

fn list_entries(store: &impl SharedStore, layout: &Layout) -> Result<Vec<ClaimEntry>> {
    let mut entries = Vec::new();
    for file in store.list(&layout.claims_dir)? {
        let Some(name) = file.strip_suffix(CLAIM_SUFFIX) else {
            continue;
        };
        let item = WorkItem::decode(name).ok();
        let marker = store
            .read(&crate::layout::join(&layout.claims_dir, &file))?
            .and_then(|bytes| serde_json::from_slice(&bytes).ok());
        entries.push(ClaimEntry { file, item, marker });
    }
    Ok(entries)
}
