//! Execution bridge between work items and the external run dispatcher.
//!
//! The core never looks inside a run. It decodes the item name into a
//! [`RunSpec`], hands it to a [`RunDispatcher`], and turns whatever comes
//! back, including dispatcher failures, into a [`RunOutcome`].

use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, error};

use crate::claim::Release;
use crate::error::{BenchError, DispatchError, Result};
use crate::item::{Pairing, WorkItem};
use crate::ledger::{ErrorRecord, ResultRecord};

/// Everything a dispatcher needs to run one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSpec {
    pub item: String,
    pub level: String,
    pub pairing: Pairing,
    pub configuration: String,
    pub rerun_index: u32,
}

impl From<&WorkItem> for RunSpec {
    fn from(item: &WorkItem) -> Self {
        Self {
            item: item.name(),
            level: item.level.clone(),
            pairing: item.pairing.clone(),
            configuration: item.configuration.clone(),
            rerun_index: item.rerun_index,
        }
    }
}

/// Lossless decode of a canonical item name into a [`RunSpec`].
pub fn materialize(name: &str) -> Result<RunSpec> {
    Ok(RunSpec::from(&WorkItem::decode(name)?))
}

/// What a dispatcher reports for a run that finished.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DispatchReport {
    /// Wall time reported by the run itself. Measured by the bridge if absent.
    #[serde(default)]
    pub timing_seconds: Option<f64>,
    /// Whether the agent solved the level. A `false` here is still a result.
    pub success: bool,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Executes identified runs. Implementations own all simulation logic.
pub trait RunDispatcher {
    fn execute(
        &self,
        spec: &RunSpec,
    ) -> impl Future<Output = std::result::Result<DispatchReport, DispatchError>> + Send;
}

/// Outcome of one execution, ready to be published.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed {
        report: DispatchReport,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        timing_seconds: f64,
    },
    Failed {
        error: DispatchError,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    },
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed { .. })
    }

    /// Converts the outcome into the change-set that releases the claim.
    pub fn into_release(self, item: &WorkItem, host: &str) -> Release {
        match self {
            RunOutcome::Completed {
                report,
                started_at,
                finished_at,
                timing_seconds,
            } => Release::Completed(ResultRecord {
                level: item.level.clone(),
                pairing: item.pairing.tag(),
                configuration: item.configuration.clone(),
                rerun_index: item.rerun_index,
                host: host.to_string(),
                started_at,
                finished_at,
                timing_seconds,
                success: report.success,
                payload: report.payload,
            }),
            RunOutcome::Failed {
                error,
                started_at,
                finished_at,
            } => Release::Failed(ErrorRecord::new(item, host, &error, started_at, finished_at)),
        }
    }
}

/// Wraps a dispatcher so that no single run can abort the caller.
pub struct ExecutionBridge<D> {
    dispatcher: D,
}

impl<D: RunDispatcher> ExecutionBridge<D> {
    pub fn new(dispatcher: D) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    pub async fn execute(&self, item: &WorkItem) -> RunOutcome {
        let spec = RunSpec::from(item);
        let started_at = Utc::now();
        let clock = Instant::now();
        let result = self.dispatcher.execute(&spec).await;
        let finished_at = Utc::now();
        let measured = clock.elapsed().as_secs_f64();

        match result {
            Ok(report) => {
                let timing_seconds = report.timing_seconds.unwrap_or(measured);
                debug!(item = %spec.item, timing_seconds, success = report.success, "run finished");
                RunOutcome::Completed {
                    report,
                    started_at,
                    finished_at,
                    timing_seconds,
                }
            }
            Err(err) => {
                error!(item = %spec.item, kind = err.kind(), "run failed: {err}");
                RunOutcome::Failed {
                    error: err,
                    started_at,
                    finished_at,
                }
            }
        }
    }
}

/// Runs an external command per item.
///
/// Invoked as `<command...> --level L --pairing P --configuration C --rerun N`.
/// The command prints a JSON [`DispatchReport`] on stdout, either as the whole
/// output or as its last non-empty line.
#[derive(Debug, Clone)]
pub struct CommandDispatcher {
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
    working_dir: Option<PathBuf>,
}

impl CommandDispatcher {
    pub fn new(command: &[String], timeout_secs: u64, working_dir: Option<PathBuf>) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| BenchError::Dispatch("dispatcher command is empty".into()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
            working_dir,
        })
    }

    fn command(&self, spec: &RunSpec) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("--level")
            .arg(&spec.level)
            .arg("--pairing")
            .arg(spec.pairing.tag())
            .arg("--configuration")
            .arg(&spec.configuration)
            .arg("--rerun")
            .arg(spec.rerun_index.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

impl RunDispatcher for CommandDispatcher {
    async fn execute(&self, spec: &RunSpec) -> std::result::Result<DispatchReport, DispatchError> {
        let child = self
            .command(spec)
            .spawn()
            .map_err(|e| DispatchError::Spawn(format!("{}: {e}", self.program)))?;

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| DispatchError::Timeout(limit.as_secs()))?,
            None => child.wait_with_output().await,
        }
        .map_err(|e| DispatchError::Spawn(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail = stderr.lines().last().unwrap_or("").trim();
            let code = output
                .status
                .code()
                .map_or_else(|| "signal".to_string(), |c| c.to_string());
            return Err(DispatchError::Failed(format!("exit {code}: {tail}")));
        }

        parse_report(&String::from_utf8_lossy(&output.stdout))
    }
}

fn parse_report(stdout: &str) -> std::result::Result<DispatchReport, DispatchError> {
    let trimmed = stdout.trim();
    if let Ok(report) = serde_json::from_str(trimmed) {
        return Ok(report);
    }
    let last = trimmed
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| DispatchError::InvalidReport("empty output".into()))?;
    serde_json::from_str(last).map_err(|e| DispatchError::InvalidReport(e.to_string()))
}
