//! Coordinates a benchmark matrix across independent hosts that share
//! nothing but a versioned store.
//!
//! Each host compiles or reads phase manifests, claims one item at a time by
//! publishing a marker, executes it through an external dispatcher and
//! publishes the result. The store's first-accepted-publish-wins rule is the
//! only mutual exclusion.

pub mod bridge;
pub mod claim;
pub mod cli;
pub mod config;
pub mod error;
pub mod host;
pub mod item;
pub mod layout;
pub mod ledger;
pub mod manifest;
pub mod matrix;
pub mod policy;
pub mod runner;
pub mod store;
pub mod sync;
pub mod telemetry;
pub mod ui;

pub use error::{BenchError, DispatchError, Result};
