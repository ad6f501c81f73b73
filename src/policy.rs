//! Per-host policy: which pairings a host runs, in what priority, and in
//! which phases.
//!
//! Lookup is pure. The caller decides how loudly to report a host that fell
//! back to the default.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::error::{BenchError, Result};
use crate::item::Pairing;
use crate::matrix::PhaseDefinition;

/// Policy as written in the configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct HostPolicy {
    /// Pairing tags in priority order. Empty inherits the default.
    #[serde(default)]
    pub pairings: Vec<String>,
    /// Allowed phase names. Empty inherits the default.
    #[serde(default)]
    pub phases: Vec<String>,
}

/// Every host policy known to the configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PolicyBook {
    #[serde(default)]
    pub default: Option<HostPolicy>,
    #[serde(default)]
    pub hosts: BTreeMap<String, HostPolicy>,
}

/// A host's effective policy after inheritance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPolicy {
    pub host: String,
    /// Priority-ordered pairings. Empty means every pairing, in manifest order.
    pub pairings: Vec<Pairing>,
    pub phases: Vec<String>,
    /// True when the host had no entry of its own.
    pub is_default: bool,
}

impl PolicyBook {
    /// The default policy, derived from the first phase when none is configured.
    pub fn default_policy(&self, phases: &[PhaseDefinition]) -> HostPolicy {
        if let Some(default) = &self.default {
            return default.clone();
        }
        match phases.first() {
            Some(first) => HostPolicy {
                pairings: first.pairings.clone(),
                phases: vec![first.name.clone()],
            },
            None => HostPolicy::default(),
        }
    }

    pub fn resolve(&self, host: &str, phases: &[PhaseDefinition]) -> Result<ResolvedPolicy> {
        let default = self.default_policy(phases);
        let (entry, is_default) = match self.hosts.get(host) {
            Some(entry) => (entry.clone(), false),
            None => (default.clone(), true),
        };

        let pairings = if entry.pairings.is_empty() {
            &default.pairings
        } else {
            &entry.pairings
        };
        let phases = if entry.phases.is_empty() {
            default.phases
        } else {
            entry.phases
        };

        let mut parsed: Vec<Pairing> = Vec::with_capacity(pairings.len());
        for tag in pairings {
            let pairing = Pairing::parse(tag)?;
            if !parsed.contains(&pairing) {
                parsed.push(pairing);
            }
        }

        Ok(ResolvedPolicy {
            host: host.to_string(),
            pairings: parsed,
            phases,
            is_default,
        })
    }
}

impl ResolvedPolicy {
    pub fn allows_phase(&self, phase: &str) -> bool {
        self.phases.iter().any(|p| p == phase)
    }

    pub fn allows_pairing(&self, pairing: &Pairing) -> bool {
        self.pairings.is_empty() || self.pairings.contains(pairing)
    }

    /// Restricts the policy to a single phase.
    pub fn only_phase(mut self, phase: &str) -> Result<Self> {
        if !self.allows_phase(phase) {
            return Err(BenchError::PhaseNotAllowed {
                phase: phase.to_string(),
                host: self.host,
            });
        }
        self.phases = vec![phase.to_string()];
        Ok(self)
    }

    /// Selection buckets in priority order. `None` accepts any pairing.
    pub fn priority(&self) -> Vec<Option<&Pairing>> {
        if self.pairings.is_empty() {
            vec![None]
        } else {
            self.pairings.iter().map(Some).collect()
        }
    }
}
