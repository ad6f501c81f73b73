//! Result ledger: write-once completion artifacts keyed by item name.
//!
//! The presence of a result file is the only source of truth for
//! completion. Claim markers and manifests may lag or lie; results never do.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};
use crate::item::WorkItem;
use crate::layout::Layout;
use crate::store::SharedStore;

/// Durable record of one completed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    pub level: String,
    pub pairing: String,
    pub configuration: String,
    pub rerun_index: u32,
    pub host: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub timing_seconds: f64,
    pub success: bool,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl ResultRecord {
    pub fn item(&self) -> Result<WorkItem> {
        let pairing = crate::item::Pairing::parse(&self.pairing)?;
        WorkItem::new(&self.level, pairing, &self.configuration, self.rerun_index)
    }
}

/// Side-channel record of a failed attempt. The item stays queued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub item: String,
    pub host: String,
    pub kind: String,
    pub error: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub timing_seconds: f64,
}

impl ErrorRecord {
    pub fn new(
        item: &WorkItem,
        host: &str,
        error: &DispatchError,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        Self {
            item: item.name(),
            host: host.to_string(),
            kind: error.kind().to_string(),
            error: error.to_string(),
            started_at,
            finished_at,
            timing_seconds: seconds_between(started_at, finished_at),
        }
    }
}

pub(crate) fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_milliseconds().max(0) as f64 / 1000.0
}

pub fn has_result(store: &impl SharedStore, layout: &Layout, item: &WorkItem) -> Result<bool> {
    store.exists(&layout.result_path(item))
}

pub fn read_result(
    store: &impl SharedStore,
    layout: &Layout,
    item: &WorkItem,
) -> Result<Option<ResultRecord>> {
    store
        .read(&layout.result_path(item))?
        .map(|bytes| serde_json::from_slice(&bytes).map_err(Into::into))
        .transpose()
}

/// Stages a result unless one already exists. Returns whether it was staged.
pub fn write_result(
    store: &mut impl SharedStore,
    layout: &Layout,
    item: &WorkItem,
    record: &ResultRecord,
) -> Result<bool> {
    let path = layout.result_path(item);
    if store.exists(&path)? {
        return Ok(false);
    }
    store.write(&path, &serde_json::to_vec_pretty(record)?)?;
    Ok(true)
}

/// Stages an error record under a fresh, collision-free name.
pub fn write_error(
    store: &mut impl SharedStore,
    layout: &Layout,
    item: &WorkItem,
    record: &ErrorRecord,
) -> Result<String> {
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    let path = layout.error_path(item, &record.host, &nonce);
    store.write(&path, &serde_json::to_vec_pretty(record)?)?;
    Ok(path)
}

/// Names of every item with a published result.
pub fn completed_names(store: &impl SharedStore, layout: &Layout) -> Result<Vec<String>> {
    Ok(store
        .list(&layout.results_dir)?
        .into_iter()
        .filter(|name| WorkItem::decode(name).is_ok())
        .collect())
}
