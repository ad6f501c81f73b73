//! Runner control loop: SYNC → SELECT → CLAIM → EXECUTE → PUBLISH, per host.
//!
//! One runner is strictly sequential. Concurrency exists only between
//! runners on different hosts, and every conflict between them is settled by
//! the shared store accepting exactly one publish.

mod state;

pub use state::{RunnerState, Termination};

use std::collections::HashSet;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::bridge::{ExecutionBridge, RunDispatcher, RunOutcome};
use crate::claim::{Claim, ClaimManager, ClaimOutcome, LossReason};
use crate::error::{BenchError, Result};
use crate::item::WorkItem;
use crate::layout::Layout;
use crate::ledger;
use crate::manifest::Manifest;
use crate::matrix::{PhaseDefinition, compile};
use crate::policy::ResolvedPolicy;
use crate::store::SharedStore;

/// Knobs for a single `run` invocation.
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Stop after this many executed items.
    pub max_items: Option<usize>,
    /// Pick up claim markers this host left behind.
    pub resume: bool,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            max_items: None,
            resume: true,
        }
    }
}

/// Progress notifications for whoever is watching the loop.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    Claimed { item: WorkItem, resumed: bool },
    Lost { item: WorkItem, reason: LossReason },
    Executing { item: WorkItem },
    Completed { item: WorkItem, success: bool },
    Failed { item: WorkItem, error: String },
}

pub trait RunObserver: Send + Sync {
    fn on_event(&self, event: &RunEvent);
}

/// What a finished loop did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub termination: Termination,
    pub completed: usize,
    pub failed: usize,
    pub lost: usize,
    pub resumed: usize,
    /// Every state entered, in order.
    pub transitions: Vec<RunnerState>,
}

enum Step {
    Sync,
    Select,
    Claim { phase: String, item: WorkItem },
    Execute(Claim),
    Publish(Claim, RunOutcome),
    Done(Termination),
}

impl Step {
    fn state(&self) -> RunnerState {
        match self {
            Step::Sync => RunnerState::Sync,
            Step::Select => RunnerState::Select,
            Step::Claim { .. } => RunnerState::Claim,
            Step::Execute(_) => RunnerState::Execute,
            Step::Publish(..) => RunnerState::Publish,
            Step::Done(_) => RunnerState::Done,
        }
    }
}

enum Selection {
    Found { phase: String, item: WorkItem },
    Exhausted,
    NoEligible,
}

pub struct Runner<S: SharedStore, D: RunDispatcher> {
    claims: ClaimManager<S>,
    bridge: ExecutionBridge<D>,
    policy: ResolvedPolicy,
    options: RunnerOptions,
    observer: Option<Box<dyn RunObserver>>,
    // Items that failed in this process are left to other hosts.
    failed: HashSet<String>,
    warned_missing: HashSet<String>,
}

impl<S: SharedStore, D: RunDispatcher> Runner<S, D> {
    pub fn new(
        claims: ClaimManager<S>,
        bridge: ExecutionBridge<D>,
        policy: ResolvedPolicy,
        options: RunnerOptions,
    ) -> Self {
        Self {
            claims,
            bridge,
            policy,
            options,
            observer: None,
            failed: HashSet::new(),
            warned_missing: HashSet::new(),
        }
    }

    pub fn with_observer(mut self, observer: Box<dyn RunObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn claims(&self) -> &ClaimManager<S> {
        &self.claims
    }

    pub fn into_claims(self) -> ClaimManager<S> {
        self.claims
    }

    fn emit(&self, event: RunEvent) {
        if let Some(observer) = &self.observer {
            observer.on_event(&event);
        }
    }

    /// Runs until there is nothing left to do for this host.
    ///
    /// Only store synchronization and manifest integrity failures are
    /// returned as errors; per-run failures are recorded and skipped.
    pub async fn run(&mut self) -> Result<RunSummary> {
        let mut summary = RunSummary {
            termination: Termination::Exhausted,
            completed: 0,
            failed: 0,
            lost: 0,
            resumed: 0,
            transitions: Vec::new(),
        };
        let mut lost_this_pass: HashSet<String> = HashSet::new();
        let mut executed = 0usize;
        let mut step = Step::Sync;

        loop {
            let state = step.state();
            debug!(host = %self.claims.host(), %state, "entering state");
            summary.transitions.push(state);

            step = match step {
                Step::Sync => {
                    self.claims.sync().await?;
                    lost_this_pass.clear();
                    Step::Select
                }
                Step::Select => match self.select(&lost_this_pass)? {
                    Selection::Found { phase, item } => Step::Claim { phase, item },
                    Selection::Exhausted => Step::Done(Termination::Exhausted),
                    Selection::NoEligible => Step::Done(Termination::NoEligible),
                },
                Step::Claim { phase, item } => match self.claims.try_claim(&phase, &item).await? {
                    ClaimOutcome::Claimed(claim) => {
                        if claim.resumed {
                            summary.resumed += 1;
                        }
                        info!(item = %item.name(), phase = %phase, resumed = claim.resumed, "claimed");
                        self.emit(RunEvent::Claimed {
                            item,
                            resumed: claim.resumed,
                        });
                        Step::Execute(claim)
                    }
                    ClaimOutcome::Lost(reason) => {
                        info!(item = %item.name(), %reason, "claim lost, moving on");
                        summary.lost += 1;
                        lost_this_pass.insert(item.name());
                        self.emit(RunEvent::Lost { item, reason });
                        Step::Select
                    }
                },
                Step::Execute(claim) => {
                    self.emit(RunEvent::Executing {
                        item: claim.item.clone(),
                    });
                    let outcome = self.bridge.execute(&claim.item).await;
                    Step::Publish(claim, outcome)
                }
                Step::Publish(claim, outcome) => {
                    let item = claim.item.clone();
                    let event = match &outcome {
                        RunOutcome::Completed { report, .. } => {
                            summary.completed += 1;
                            RunEvent::Completed {
                                item: item.clone(),
                                success: report.success,
                            }
                        }
                        RunOutcome::Failed { error, .. } => {
                            summary.failed += 1;
                            self.failed.insert(item.name());
                            RunEvent::Failed {
                                item: item.clone(),
                                error: error.to_string(),
                            }
                        }
                    };
                    let release = outcome.into_release(&item, self.claims.host());
                    self.claims.release(&claim, &release).await?;
                    self.emit(event);

                    executed += 1;
                    match self.options.max_items {
                        Some(max) if executed >= max => Step::Done(Termination::Stopped),
                        _ => Step::Sync,
                    }
                }
                Step::Done(termination) => {
                    summary.termination = termination;
                    info!(
                        host = %self.claims.host(),
                        %termination,
                        completed = summary.completed,
                        failed = summary.failed,
                        lost = summary.lost,
                        "runner finished"
                    );
                    return Ok(summary);
                }
            };
        }
    }

    /// First selectable item: pairing priority, then phase order, then
    /// manifest order.
    fn select(&mut self, lost_this_pass: &HashSet<String>) -> Result<Selection> {
        if self.policy.phases.is_empty() {
            return Ok(Selection::NoEligible);
        }

        let phases = self.policy.phases.clone();
        let mut manifests = Vec::with_capacity(phases.len());
        for phase in &phases {
            manifests.push(self.load_manifest(phase)?);
        }

        let store = self.claims.store();
        let layout = self.claims.layout();
        let mut remaining = false;

        for bucket in self.policy.priority() {
            for manifest in &manifests {
                for item in manifest.entries() {
                    if bucket.is_some_and(|p| *p != item.pairing) {
                        continue;
                    }
                    if ledger::has_result(store, layout, item)? {
                        continue;
                    }
                    remaining = true;

                    let name = item.name();
                    if lost_this_pass.contains(&name) || self.failed.contains(&name) {
                        continue;
                    }
                    if let Some(entry) = self.claims.marker(item)? {
                        let ours = entry.owner() == Some(self.claims.host());
                        if !(ours && self.options.resume) {
                            continue;
                        }
                    }
                    return Ok(Selection::Found {
                        phase: manifest.phase.clone(),
                        item: item.clone(),
                    });
                }
            }
        }

        Ok(if remaining {
            Selection::NoEligible
        } else {
            Selection::Exhausted
        })
    }

    fn load_manifest(&mut self, phase: &str) -> Result<Manifest> {
        match Manifest::load(self.claims.store(), self.claims.layout(), phase) {
            Ok(manifest) => Ok(manifest),
            Err(BenchError::MissingManifest(_)) => {
                if self.warned_missing.insert(phase.to_string()) {
                    warn!(phase, "no manifest for allowed phase, treating as empty");
                }
                Ok(Manifest::new(phase, Vec::new()))
            }
            Err(e) => Err(e),
        }
    }
}

/// Per-phase progress as seen from the local view of the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhaseStatus {
    pub phase: String,
    pub queued: usize,
    pub claimed: usize,
    pub completed: usize,
    /// Queued items whose pairing this host may run.
    pub runnable_here: usize,
    pub allowed_here: bool,
}

/// Progress per defined phase. Completed counts every item of the phase
/// definition with a result, whether or not it already left the manifest.
pub fn status_report(
    store: &impl SharedStore,
    layout: &Layout,
    policy: &ResolvedPolicy,
    phases: &[PhaseDefinition],
) -> Result<Vec<PhaseStatus>> {
    let completed: HashSet<String> = ledger::completed_names(store, layout)?.into_iter().collect();
    let mut report = Vec::with_capacity(phases.len());
    for def in phases {
        let expected = compile(def)?;
        let manifest = match Manifest::load(store, layout, &def.name) {
            Ok(m) => m,
            Err(BenchError::MissingManifest(_)) => Manifest::new(def.name.as_str(), Vec::new()),
            Err(e) => return Err(e),
        };
        let mut status = PhaseStatus {
            phase: def.name.clone(),
            queued: 0,
            claimed: 0,
            completed: expected
                .entries()
                .iter()
                .filter(|item| completed.contains(&item.name()))
                .count(),
            runnable_here: 0,
            allowed_here: policy.allows_phase(&def.name),
        };
        for item in manifest.entries() {
            if completed.contains(&item.name()) {
                continue;
            }
            status.queued += 1;
            if store.exists(&layout.claim_path(item))? {
                status.claimed += 1;
            } else if status.allowed_here && policy.allows_pairing(&item.pairing) {
                status.runnable_here += 1;
            }
        }
        report.push(status);
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;
    use crate::bridge::{DispatchReport, RunSpec};
    use crate::error::DispatchError;
    use crate::item::Pairing;
    use crate::policy::PolicyBook;
    use crate::store::{MemoryRemote, MemoryStore, Publish};
    use crate::sync::RetryConfig;

    #[derive(Clone, Default)]
    struct FakeDispatcher {
        executed: Arc<Mutex<Vec<String>>>,
        failing: Arc<HashSet<String>>,
        delay_ms: u64,
    }

    impl FakeDispatcher {
        fn failing(names: &[String]) -> Self {
            Self {
                failing: Arc::new(names.iter().cloned().collect()),
                ..Self::default()
            }
        }

        fn executed(&self) -> Vec<String> {
            self.executed.lock().unwrap().clone()
        }
    }

    impl RunDispatcher for FakeDispatcher {
        async fn execute(
            &self,
            spec: &RunSpec,
        ) -> std::result::Result<DispatchReport, DispatchError> {
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            self.executed.lock().unwrap().push(spec.item.clone());
            if self.failing.contains(&spec.item) {
                return Err(DispatchError::Failed("scripted failure".into()));
            }
            Ok(DispatchReport {
                timing_seconds: Some(0.5),
                success: true,
                payload: serde_json::json!({ "level": spec.level }),
            })
        }
    }

    fn phase() -> PhaseDefinition {
        PhaseDefinition {
            name: "p1".into(),
            configurations: vec!["cfg".into()],
            levels: vec!["l1".into(), "l2".into(), "l3".into()],
            pairings: vec!["a".into(), "b".into()],
            reruns: 1,
        }
    }

    /// p1 holds 3 items for pairing `a` and 2 for pairing `b`.
    fn scenario_remote() -> MemoryRemote {
        let remote = MemoryRemote::new();
        let mut store = remote.checkout().unwrap();
        let layout = Layout::default();
        let mut manifest = compile(&phase()).unwrap();
        let dropped = WorkItem::new("l3", Pairing::solo("b"), "cfg", 0).unwrap();
        assert!(manifest.remove(&dropped));
        manifest.save(&mut store, &layout).unwrap();
        assert_eq!(store.publish("compile").unwrap(), Publish::Accepted);
        remote
    }

    fn policy(host: &str, pairings: &[&str]) -> ResolvedPolicy {
        let mut book = PolicyBook::default();
        book.hosts.insert(
            host.to_string(),
            crate::policy::HostPolicy {
                pairings: pairings.iter().map(|s| s.to_string()).collect(),
                phases: vec!["p1".into()],
            },
        );
        book.resolve(host, &[phase()]).unwrap()
    }

    fn runner(
        remote: &MemoryRemote,
        host: &str,
        pairings: &[&str],
        dispatcher: FakeDispatcher,
        options: RunnerOptions,
    ) -> Runner<MemoryStore, FakeDispatcher> {
        let claims = ClaimManager::new(
            remote.checkout().unwrap(),
            host,
            Layout::default(),
            RetryConfig {
                max_retries: 10,
                base_delay_ms: 1,
            },
        );
        Runner::new(
            claims,
            ExecutionBridge::new(dispatcher),
            policy(host, pairings),
            options,
        )
    }

    fn manifest_text(remote: &MemoryRemote) -> String {
        String::from_utf8(remote.files().unwrap()["phase/p1.txt"].clone()).unwrap()
    }

    fn result_names(remote: &MemoryRemote) -> Vec<String> {
        remote
            .files()
            .unwrap()
            .into_keys()
            .filter_map(|k| k.strip_prefix("runs/").map(str::to_string))
            .filter(|k| !k.contains('/'))
            .collect()
    }

    #[tokio::test]
    async fn single_host_drains_queue_in_priority_order() {
        let remote = scenario_remote();
        let dispatcher = FakeDispatcher::default();
        let mut r = runner(&remote, "x", &["b", "a"], dispatcher.clone(), RunnerOptions::default());

        let summary = r.run().await.unwrap();
        assert_eq!(summary.termination, Termination::Exhausted);
        assert_eq!(summary.completed, 5);
        assert_eq!(
            dispatcher.executed(),
            vec![
                "l1_b_cfg_0.json",
                "l2_b_cfg_0.json",
                "l1_a_cfg_0.json",
                "l2_a_cfg_0.json",
                "l3_a_cfg_0.json",
            ]
        );
        assert_eq!(manifest_text(&remote), "");
        assert_eq!(result_names(&remote).len(), 5);
    }

    #[tokio::test]
    async fn transitions_follow_the_state_machine() {
        let remote = scenario_remote();
        let mut r = runner(
            &remote,
            "x",
            &["a"],
            FakeDispatcher::default(),
            RunnerOptions {
                max_items: Some(1),
                resume: true,
            },
        );
        let summary = r.run().await.unwrap();
        use RunnerState::*;
        assert_eq!(
            summary.transitions,
            vec![Sync, Select, Claim, Execute, Publish, Done]
        );
        assert_eq!(summary.termination, Termination::Stopped);
        for pair in summary.transitions.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]));
        }
    }

    #[tokio::test]
    async fn failed_run_keeps_item_queued_and_is_not_retried_locally() {
        let remote = scenario_remote();
        let bad = "l2_b_cfg_0.json".to_string();
        let dispatcher = FakeDispatcher::failing(&[bad.clone()]);
        let mut r = runner(&remote, "y", &["b"], dispatcher.clone(), RunnerOptions::default());

        let summary = r.run().await.unwrap();
        assert_eq!(summary.termination, Termination::NoEligible);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(dispatcher.executed().iter().filter(|n| **n == bad).count(), 1);

        assert!(manifest_text(&remote).lines().any(|l| l == bad));
        let files = remote.files().unwrap();
        assert!(!files.keys().any(|k| k.starts_with("runs/claims/")));
        assert!(files.keys().any(|k| k.starts_with("runs/errors/l2_b_cfg_0.json.y.")));
    }

    #[tokio::test]
    async fn existing_result_is_never_reclaimed_even_if_still_queued() {
        let remote = scenario_remote();
        let layout = Layout::default();
        let done = WorkItem::new("l1", Pairing::solo("a"), "cfg", 0).unwrap();
        let mut seed = remote.checkout().unwrap();
        seed.write(&layout.result_path(&done), b"{}").unwrap();
        seed.publish("out of band result").unwrap();

        let dispatcher = FakeDispatcher::default();
        let mut r = runner(&remote, "x", &["a"], dispatcher.clone(), RunnerOptions::default());
        let summary = r.run().await.unwrap();

        assert_eq!(summary.termination, Termination::Exhausted);
        assert!(!dispatcher.executed().contains(&done.name()));
        assert_eq!(summary.completed, 2);
        assert_eq!(remote.files().unwrap()[&layout.result_path(&done)], b"{}".to_vec());
    }

    #[tokio::test]
    async fn foreign_claim_is_skipped() {
        let remote = scenario_remote();
        let layout = Layout::default();
        let held = WorkItem::new("l1", Pairing::solo("b"), "cfg", 0).unwrap();
        let mut other = ClaimManager::new(
            remote.checkout().unwrap(),
            "z",
            layout.clone(),
            RetryConfig::default(),
        );
        assert!(matches!(
            other.try_claim("p1", &held).await.unwrap(),
            ClaimOutcome::Claimed(_)
        ));

        let dispatcher = FakeDispatcher::default();
        let mut r = runner(&remote, "y", &["b"], dispatcher.clone(), RunnerOptions::default());
        let summary = r.run().await.unwrap();

        assert_eq!(summary.termination, Termination::NoEligible);
        assert_eq!(dispatcher.executed(), vec!["l2_b_cfg_0.json"]);
        assert!(manifest_text(&remote).contains(&held.name()));
    }

    #[tokio::test]
    async fn own_stale_claim_is_resumed_unless_disabled() {
        let remote = scenario_remote();
        let item = WorkItem::new("l2", Pairing::solo("b"), "cfg", 0).unwrap();
        let mut crashed = ClaimManager::new(
            remote.checkout().unwrap(),
            "y",
            Layout::default(),
            RetryConfig::default(),
        );
        crashed.try_claim("p1", &item).await.unwrap();

        let no_resume = FakeDispatcher::default();
        let mut r = runner(
            &remote,
            "y",
            &["b"],
            no_resume.clone(),
            RunnerOptions {
                max_items: None,
                resume: false,
            },
        );
        let summary = r.run().await.unwrap();
        assert_eq!(summary.termination, Termination::NoEligible);
        assert_eq!(no_resume.executed(), vec!["l1_b_cfg_0.json"]);

        let resume = FakeDispatcher::default();
        let mut r = runner(&remote, "y", &["b"], resume.clone(), RunnerOptions::default());
        let summary = r.run().await.unwrap();
        assert_eq!(summary.termination, Termination::Exhausted);
        assert_eq!(summary.resumed, 1);
        assert_eq!(resume.executed(), vec![item.name()]);
    }

    #[tokio::test]
    async fn corrupt_manifest_halts_the_loop() {
        let remote = scenario_remote();
        let mut seed = remote.checkout().unwrap();
        seed.write("phase/p1.txt", b"l1_a_cfg_0.json\nl1_a_cfg_0.json\n")
            .unwrap();
        seed.publish("corrupt").unwrap();

        let dispatcher = FakeDispatcher::default();
        let mut r = runner(&remote, "x", &["a"], dispatcher.clone(), RunnerOptions::default());
        let err = r.run().await.unwrap_err();
        assert!(matches!(err, BenchError::ManifestCorruption { .. }));
        assert!(dispatcher.executed().is_empty());
    }

    #[tokio::test]
    async fn missing_manifest_counts_as_empty() {
        let remote = MemoryRemote::new();
        let mut r = runner(&remote, "x", &["a"], FakeDispatcher::default(), RunnerOptions::default());
        let summary = r.run().await.unwrap();
        assert_eq!(summary.termination, Termination::Exhausted);
    }

    #[test]
    fn two_hosts_drain_the_matrix_exactly_once() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let remote = scenario_remote();
            let x_dispatch = FakeDispatcher {
                delay_ms: 5,
                ..FakeDispatcher::default()
            };
            let y_dispatch = FakeDispatcher {
                delay_ms: 5,
                ..FakeDispatcher::default()
            };
            let mut x = runner(&remote, "x", &["a", "b"], x_dispatch.clone(), RunnerOptions::default());
            let mut y = runner(&remote, "y", &["b"], y_dispatch.clone(), RunnerOptions::default());

            let hx = tokio::spawn(async move { x.run().await });
            let hy = tokio::spawn(async move { y.run().await });
            hx.await.unwrap().unwrap();
            hy.await.unwrap().unwrap();

            let mut all: Vec<String> = x_dispatch.executed();
            all.extend(y_dispatch.executed());
            all.sort();
            let mut unique = all.clone();
            unique.dedup();
            assert_eq!(all, unique, "an item ran twice");
            assert_eq!(all.len(), 5);

            // x drains pairing a before touching b.
            let xs = x_dispatch.executed();
            let first_b = xs.iter().position(|n| n.contains("_b_"));
            let last_a = xs.iter().rposition(|n| n.contains("_a_"));
            if let (Some(first_b), Some(last_a)) = (first_b, last_a) {
                assert!(last_a < first_b, "x ran b before finishing a: {xs:?}");
            }
            assert_eq!(xs.iter().filter(|n| n.contains("_a_")).count(), 3);
            assert!(y_dispatch.executed().iter().all(|n| n.contains("_b_")));

            assert_eq!(result_names(&remote).len(), 5);
            assert!(!remote
                .files()
                .unwrap()
                .keys()
                .any(|k| k.starts_with("runs/claims/")));
            assert_eq!(manifest_text(&remote), "");
        });
    }

    #[tokio::test]
    async fn status_report_counts_per_phase() {
        let remote = scenario_remote();
        let layout = Layout::default();
        let mut x = runner(
            &remote,
            "x",
            &["a"],
            FakeDispatcher::default(),
            RunnerOptions {
                max_items: Some(1),
                resume: true,
            },
        );
        x.run().await.unwrap();

        let mut claims = ClaimManager::new(
            remote.checkout().unwrap(),
            "z",
            layout.clone(),
            RetryConfig::default(),
        );
        let held = WorkItem::new("l1", Pairing::solo("b"), "cfg", 0).unwrap();
        claims.try_claim("p1", &held).await.unwrap();

        let view = remote.checkout().unwrap();
        let mut other = phase();
        other.name = "p9".into();
        let report = status_report(&view, &layout, &policy("y", &["b"]), &[phase(), other]).unwrap();
        assert_eq!(
            report[0],
            PhaseStatus {
                phase: "p1".into(),
                queued: 4,
                claimed: 1,
                completed: 1,
                runnable_here: 1,
                allowed_here: true,
            }
        );
        assert_eq!(report[1].queued, 0);
        assert!(!report[1].allowed_here);
    }
}
