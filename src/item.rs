//! Work item identity and its canonical file name.
//!
//! A [`WorkItem`] is one cell of the benchmark matrix: a level, a model
//! [`Pairing`], a configuration name and a rerun index. It renders to
//! `<level>_<pairing>_<configuration>_<rerun>.json`. Configuration names,
//! model names and rerun indices never contain `_`, so decoding splits from
//! the right and the level keeps any remaining underscores.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{BenchError, Result};

/// File extension shared by item names and result artifacts.
pub const ITEM_SUFFIX: &str = ".json";

/// Separator between realisator and imaginator in a pairing tag.
pub const PAIRING_JOIN: char = '+';

/// A set of cooperating model roles used for one run.
///
/// The imaginator defaults to the realisator when absent, and the tag only
/// carries it when it differs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Pairing {
    pub realisator: String,
    pub imaginator: Option<String>,
}

impl Pairing {
    /// A pairing where one model plays every role.
    pub fn solo(model: impl Into<String>) -> Self {
        Self {
            realisator: model.into(),
            imaginator: None,
        }
    }

    /// A pairing with a distinct imaginator model.
    pub fn hybrid(realisator: impl Into<String>, imaginator: impl Into<String>) -> Self {
        let realisator = realisator.into();
        let imaginator = imaginator.into();
        let imaginator = (imaginator != realisator).then_some(imaginator);
        Self {
            realisator,
            imaginator,
        }
    }

    /// Parses a tag such as `qwen3-8b` or `qwen3-8b+mistral-small-24b`.
    pub fn parse(tag: &str) -> Result<Self> {
        let pairing = match tag.split_once(PAIRING_JOIN) {
            Some((real, imag)) => {
                validate_model(real)?;
                validate_model(imag)?;
                Self::hybrid(real, imag)
            }
            None => {
                validate_model(tag)?;
                Self::solo(tag)
            }
        };
        if pairing.tag() != tag {
            return Err(BenchError::InvalidSlug {
                field: "pairing",
                value: tag.to_string(),
                reason: format!("not canonical, expected '{}'", pairing.tag()),
            });
        }
        Ok(pairing)
    }

    pub fn imaginator_or_default(&self) -> &str {
        self.imaginator.as_deref().unwrap_or(&self.realisator)
    }

    /// Canonical tag used in item names and host policies.
    pub fn tag(&self) -> String {
        match &self.imaginator {
            Some(imag) if *imag != self.realisator => {
                format!("{}{PAIRING_JOIN}{imag}", self.realisator)
            }
            _ => self.realisator.clone(),
        }
    }
}

impl fmt::Display for Pairing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag())
    }
}

/// One unit of benchmark work. Immutable once generated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkItem {
    pub level: String,
    pub pairing: Pairing,
    pub configuration: String,
    pub rerun_index: u32,
}

impl WorkItem {
    /// Builds an item after checking every component against the name grammar.
    pub fn new(
        level: impl Into<String>,
        pairing: Pairing,
        configuration: impl Into<String>,
        rerun_index: u32,
    ) -> Result<Self> {
        let item = Self {
            level: level.into(),
            pairing,
            configuration: configuration.into(),
            rerun_index,
        };
        validate_level(&item.level)?;
        validate_model(&item.pairing.realisator)?;
        if let Some(imag) = &item.pairing.imaginator {
            validate_model(imag)?;
        }
        validate_configuration(&item.configuration)?;
        Ok(item)
    }

    /// Canonical, collision-free file name for this item.
    pub fn name(&self) -> String {
        format!(
            "{}_{}_{}_{}{ITEM_SUFFIX}",
            self.level,
            self.pairing.tag(),
            self.configuration,
            self.rerun_index
        )
    }

    /// Decodes a canonical name back into its identity.
    ///
    /// Rejects anything that would not re-encode to exactly `name`.
    pub fn decode(name: &str) -> Result<Self> {
        let invalid = |reason: &str| BenchError::InvalidItemName {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        let base = name
            .strip_suffix(ITEM_SUFFIX)
            .ok_or_else(|| invalid("missing .json suffix"))?;
        let (rest, rerun) = base
            .rsplit_once('_')
            .ok_or_else(|| invalid("missing rerun index"))?;
        let (rest, configuration) = rest
            .rsplit_once('_')
            .ok_or_else(|| invalid("missing configuration"))?;
        let (level, tag) = rest
            .rsplit_once('_')
            .ok_or_else(|| invalid("missing level or pairing"))?;

        let rerun_index: u32 = rerun
            .parse()
            .map_err(|_| invalid("rerun index is not a number"))?;
        let pairing = Pairing::parse(tag).map_err(|e| invalid(&e.to_string()))?;
        let item = Self::new(level, pairing, configuration, rerun_index)
            .map_err(|e| invalid(&e.to_string()))?;

        if item.name() != name {
            return Err(invalid("not in canonical form"));
        }
        Ok(item)
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} / {} / {} #{}",
            self.level, self.pairing, self.configuration, self.rerun_index
        )
    }
}

fn validate_chars(
    field: &'static str,
    value: &str,
    allow_underscore: bool,
) -> Result<()> {
    let err = |reason: String| BenchError::InvalidSlug {
        field,
        value: value.to_string(),
        reason,
    };
    if value.is_empty() {
        return Err(err("must not be empty".into()));
    }
    if value.starts_with('.') {
        return Err(err("must not start with '.'".into()));
    }
    if let Some(bad) = value.chars().find(|c| {
        !(c.is_ascii_alphanumeric() || *c == '-' || *c == '.' || (allow_underscore && *c == '_'))
    }) {
        return Err(err(format!("character '{bad}' is not allowed")));
    }
    Ok(())
}

/// Levels may contain underscores; they are the leftmost name component.
pub fn validate_level(level: &str) -> Result<()> {
    validate_chars("level", level, true)?;
    if level.ends_with('_') {
        return Err(BenchError::InvalidSlug {
            field: "level",
            value: level.to_string(),
            reason: "must not end with '_'".into(),
        });
    }
    Ok(())
}

pub fn validate_configuration(name: &str) -> Result<()> {
    validate_chars("configuration", name, false)
}

pub fn validate_model(name: &str) -> Result<()> {
    validate_chars("model", name, false)
}
