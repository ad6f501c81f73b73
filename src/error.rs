use thiserror::Error;

pub type Result<T> = std::result::Result<T, BenchError>;

#[derive(Debug, Error)]
pub enum BenchError {
    #[error("Shared store still diverged after {attempts} synchronization attempts")]
    SyncConflict { attempts: u32 },

    #[error("Manifest for phase '{phase}' is corrupt: {reason}")]
    ManifestCorruption { phase: String, reason: String },

    #[error("No manifest found for phase '{0}'. Run `benchgrid compile` first.")]
    MissingManifest(String),

    #[error("Invalid work item name '{name}': {reason}")]
    InvalidItemName { name: String, reason: String },

    #[error("Invalid {field} '{value}': {reason}")]
    InvalidSlug {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("Work item name '{name}' is produced by both {first} and {second}")]
    NameCollision {
        name: String,
        first: String,
        second: String,
    },

    #[error("Phase '{phase}' is not allowed for host '{host}'")]
    PhaseNotAllowed { phase: String, host: String },

    #[error("Unknown phase: {0}")]
    UnknownPhase(String),

    #[error("Dispatcher error: {0}")]
    Dispatch(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Failure reported by a run dispatcher for a single run.
///
/// These never abort the control loop; the execution bridge turns them into
/// a failed [`RunOutcome`](crate::bridge::RunOutcome).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatchError {
    /// The run executed but reported a failure.
    #[error("Run failed: {0}")]
    Failed(String),

    /// The run exceeded its time budget and was killed.
    #[error("Run timed out after {0}s")]
    Timeout(u64),

    /// The dispatcher could not be started.
    #[error("Failed to start dispatcher: {0}")]
    Spawn(String),

    /// The dispatcher finished but its report could not be understood.
    #[error("Invalid dispatcher report: {0}")]
    InvalidReport(String),
}

impl DispatchError {
    /// Short machine-friendly tag stored in error records.
    pub fn kind(&self) -> &'static str {
        match self {
            DispatchError::Failed(_) => "failed",
            DispatchError::Timeout(_) => "timeout",
            DispatchError::Spawn(_) => "spawn",
            DispatchError::InvalidReport(_) => "invalid_report",
        }
    }
}
