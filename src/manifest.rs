//! Phase manifests: one ordered queue of work item names per phase.
//!
//! A manifest is plain text, one name per line, in compiler output order.
//! Producers always rewrite the whole file; an entry is only ever removed
//! once its result is published in the same change-set.

use std::collections::HashSet;

use crate::error::{BenchError, Result};
use crate::item::WorkItem;
use crate::layout::Layout;
use crate::store::SharedStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub phase: String,
    entries: Vec<WorkItem>,
}

impl Manifest {
    pub fn new(phase: impl Into<String>, entries: Vec<WorkItem>) -> Self {
        Self {
            phase: phase.into(),
            entries,
        }
    }

    /// Parses manifest text. Blank lines are ignored; duplicate or
    /// undecodable entries make the whole phase unusable.
    pub fn parse(phase: &str, text: &str) -> Result<Self> {
        let corrupt = |reason: String| BenchError::ManifestCorruption {
            phase: phase.to_string(),
            reason,
        };

        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        for (lineno, line) in text.lines().enumerate() {
            let name = line.trim();
            if name.is_empty() {
                continue;
            }
            let item = WorkItem::decode(name)
                .map_err(|e| corrupt(format!("line {}: {e}", lineno + 1)))?;
            if !seen.insert(name.to_string()) {
                return Err(corrupt(format!("line {}: duplicate entry {name}", lineno + 1)));
            }
            entries.push(item);
        }
        Ok(Self::new(phase, entries))
    }

    pub fn render(&self) -> String {
        let mut out = self
            .entries
            .iter()
            .map(WorkItem::name)
            .collect::<Vec<_>>()
            .join("\n");
        if !out.is_empty() {
            out.push('\n');
        }
        out
    }

    /// Loads a phase manifest from the store's local view.
    pub fn load(store: &impl SharedStore, layout: &Layout, phase: &str) -> Result<Self> {
        let path = layout.manifest_path(phase);
        let bytes = store
            .read(&path)?
            .ok_or_else(|| BenchError::MissingManifest(phase.to_string()))?;
        let text = String::from_utf8(bytes).map_err(|_| BenchError::ManifestCorruption {
            phase: phase.to_string(),
            reason: "not valid UTF-8".into(),
        })?;
        Self::parse(phase, &text)
    }

    /// Stages the whole manifest for the next publish.
    pub fn save(&self, store: &mut impl SharedStore, layout: &Layout) -> Result<()> {
        store.write(&layout.manifest_path(&self.phase), self.render().as_bytes())
    }

    pub fn entries(&self) -> &[WorkItem] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, item: &WorkItem) -> bool {
        self.entries.contains(item)
    }

    /// Removes an entry, returning whether it was present.
    pub fn remove(&mut self, item: &WorkItem) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e != item);
        self.entries.len() != before
    }
}

/// Phase names that currently have a manifest in the store.
pub fn list_phases(store: &impl SharedStore, layout: &Layout) -> Result<Vec<String>> {
    Ok(store
        .list(&layout.phase_dir)?
        .into_iter()
        .filter_map(|name| name.strip_suffix(".txt").map(str::to_string))
        .collect())
}
