use std::fmt;

use serde::{Deserialize, Serialize};

/// The six states of the runner control loop.
///
/// A healthy pass flows SYNC → SELECT → CLAIM → EXECUTE → PUBLISH → SYNC.
/// A lost claim goes back to SELECT; running out of work ends in DONE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunnerState {
    Sync,
    Select,
    Claim,
    Execute,
    Publish,
    Done,
}

impl fmt::Display for RunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunnerState::Sync => write!(f, "SYNC"),
            RunnerState::Select => write!(f, "SELECT"),
            RunnerState::Claim => write!(f, "CLAIM"),
            RunnerState::Execute => write!(f, "EXECUTE"),
            RunnerState::Publish => write!(f, "PUBLISH"),
            RunnerState::Done => write!(f, "DONE"),
        }
    }
}

impl RunnerState {
    /// Whether the loop may move from `self` to `next`.
    pub fn can_transition_to(self, next: RunnerState) -> bool {
        use RunnerState::*;
        matches!(
            (self, next),
            (Sync, Select)
                | (Select, Claim)
                | (Select, Done)
                | (Claim, Execute)
                | (Claim, Select)
                | (Execute, Publish)
                | (Publish, Sync)
                | (Publish, Done)
        )
    }
}

/// Why the loop reached DONE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// Nothing this host may run is left anywhere.
    Exhausted,
    /// Work remains, but none of it is selectable for this host right now.
    NoEligible,
    /// The configured item limit was reached.
    Stopped,
}

impl Termination {
    /// Process exit code for the binary.
    pub fn exit_code(self) -> i32 {
        match self {
            Termination::Exhausted | Termination::Stopped => 0,
            Termination::NoEligible => 3,
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Exhausted => write!(f, "queue exhausted"),
            Termination::NoEligible => write!(f, "no eligible items under current policy"),
            Termination::Stopped => write!(f, "stopped at item limit"),
        }
    }
}
