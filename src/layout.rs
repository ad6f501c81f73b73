//! Directory layout inside the shared store.
//!
//! All paths are `/`-separated and relative to the store root.

use serde::Deserialize;

use crate::item::WorkItem;

/// File extension of claim markers.
pub const CLAIM_SUFFIX: &str = ".claim";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Layout {
    /// Phase manifests, one `<phase>.txt` per phase.
    #[serde(default = "default_phase_dir")]
    pub phase_dir: String,

    /// Result artifacts, one per completed item.
    #[serde(default = "default_results_dir")]
    pub results_dir: String,

    /// Claim markers for in-flight items.
    #[serde(default = "default_claims_dir")]
    pub claims_dir: String,

    /// Side-channel records of failed runs.
    #[serde(default = "default_errors_dir")]
    pub errors_dir: String,
}

fn default_phase_dir() -> String {
    "phase".to_string()
}

fn default_results_dir() -> String {
    "runs".to_string()
}

fn default_claims_dir() -> String {
    "runs/claims".to_string()
}

fn default_errors_dir() -> String {
    "runs/errors".to_string()
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            phase_dir: default_phase_dir(),
            results_dir: default_results_dir(),
            claims_dir: default_claims_dir(),
            errors_dir: default_errors_dir(),
        }
    }
}

impl Layout {
    pub fn manifest_path(&self, phase: &str) -> String {
        join(&self.phase_dir, &format!("{phase}.txt"))
    }

    pub fn result_path(&self, item: &WorkItem) -> String {
        join(&self.results_dir, &item.name())
    }

    pub fn claim_path(&self, item: &WorkItem) -> String {
        join(&self.claims_dir, &format!("{}{CLAIM_SUFFIX}", item.name()))
    }

    pub fn error_path(&self, item: &WorkItem, host: &str, nonce: &str) -> String {
        join(&self.errors_dir, &format!("{}.{host}.{nonce}.json", item.name()))
    }

    /// Directories the store is allowed to stage, inspect and clean.
    pub fn managed_dirs(&self) -> Vec<String> {
        let mut dirs: Vec<String> = Vec::new();
        for dir in [
            &self.phase_dir,
            &self.results_dir,
            &self.claims_dir,
            &self.errors_dir,
        ] {
            let covered = dirs
                .iter()
                .any(|d| dir == d || dir.starts_with(&format!("{d}/")));
            if !covered {
                dirs.retain(|d| !d.starts_with(&format!("{dir}/")));
                dirs.push(dir.clone());
            }
        }
        dirs
    }
}

pub fn join(dir: &str, file: &str) -> String {
    let dir = dir.trim_end_matches('/');
    if dir.is_empty() {
        file.to_string()
    } else {
        format!("{dir}/{file}")
    }
}
