//! Work matrix compiler: expands phase definitions into ordered manifests.
//!
//! Expansion order is pairings (outer) × configurations × levels × reruns
//! (inner), each in declaration order. The compiler is pure; whether a result
//! already exists is decided at claim time, not here.

use std::collections::HashMap;

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{BenchError, Result};
use crate::item::{Pairing, WorkItem};
use crate::layout::Layout;
use crate::manifest::Manifest;
use crate::store::SharedStore;

/// Declarative description of one phase of the benchmark matrix.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PhaseDefinition {
    pub name: String,
    pub configurations: Vec<String>,
    pub levels: Vec<String>,
    /// Pairing tags, e.g. `qwen3-8b` or `qwen3-8b+mistral-small-24b`.
    pub pairings: Vec<String>,
    /// Repetitions per tuple.
    #[serde(default = "default_reruns")]
    pub reruns: u32,
}

fn default_reruns() -> u32 {
    1
}

impl PhaseDefinition {
    pub fn parsed_pairings(&self) -> Result<Vec<Pairing>> {
        self.pairings.iter().map(|tag| Pairing::parse(tag)).collect()
    }
}

/// Expands one phase into its manifest.
///
/// Identical tuples are kept once, at their first position. Two distinct
/// tuples rendering to the same name abort compilation.
pub fn compile(def: &PhaseDefinition) -> Result<Manifest> {
    validate_phase_name(&def.name)?;
    let pairings = def.parsed_pairings()?;

    let mut seen: HashMap<String, WorkItem> = HashMap::new();
    let mut entries = Vec::new();
    for pairing in &pairings {
        for configuration in &def.configurations {
            for level in &def.levels {
                for rerun in 0..def.reruns {
                    let item = WorkItem::new(level, pairing.clone(), configuration, rerun)?;
                    let name = item.name();
                    match seen.get(&name) {
                        Some(existing) if *existing == item => {
                            debug!(phase = %def.name, item = %name, "duplicate tuple skipped");
                        }
                        Some(existing) => {
                            return Err(BenchError::NameCollision {
                                name,
                                first: existing.to_string(),
                                second: item.to_string(),
                            });
                        }
                        None => {
                            seen.insert(name, item.clone());
                            entries.push(item);
                        }
                    }
                }
            }
        }
    }
    Ok(Manifest::new(def.name.clone(), entries))
}

/// Compiles every phase, failing as a whole if any one phase is invalid.
pub fn compile_all(defs: &[PhaseDefinition]) -> Result<Vec<Manifest>> {
    defs.iter().map(compile).collect()
}

/// Compiles every phase and stages the manifests. Nothing is published.
pub fn write_manifests(
    store: &mut impl SharedStore,
    layout: &Layout,
    defs: &[PhaseDefinition],
) -> Result<Vec<Manifest>> {
    let manifests = compile_all(defs)?;
    for manifest in &manifests {
        manifest.save(store, layout)?;
        info!(phase = %manifest.phase, items = manifest.len(), "manifest compiled");
    }
    Ok(manifests)
}

/// Phase names become file names, so they follow the configuration charset.
fn validate_phase_name(name: &str) -> Result<()> {
    crate::item::validate_configuration(name).map_err(|e| match e {
        BenchError::InvalidSlug { value, reason, .. } => BenchError::InvalidSlug {
            field: "phase",
            value,
            reason,
        },
        other => other,
    })
}
