//! Interface de terminal do benchgrid: spinner e saída colorida.
//!
//! Usa as crates `indicatif` para o spinner de execução e `console` para
//! estilização com cores. O [`RunProgress`] acompanha visualmente o laço do
//! runner no terminal.

use std::time::Duration;

use chrono::Utc;
use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::claim::ClaimEntry;
use crate::policy::ResolvedPolicy;
use crate::runner::{PhaseStatus, RunEvent, RunObserver, RunSummary, Termination};

/// Indicador visual do laço de execução no terminal.
///
/// Exibe um spinner enquanto um item executa e linhas coloridas para
/// conclusão (verde), falha (vermelho) e claim perdido (amarelo).
#[derive(Clone)]
pub struct RunProgress {
    // Spinner do indicatif.
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
}

impl RunProgress {
    /// Inicia o spinner com o nome do host.
    pub fn start(host: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(format!("SYNC: {host}"));
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }

    /// Finaliza o spinner e exibe o resumo da execução.
    pub fn finish(&self, summary: &RunSummary) {
        self.pb.finish_and_clear();
        print_summary(summary);
    }

    /// Finaliza o spinner sem resumo, por exemplo após um erro.
    pub fn abandon(&self) {
        self.pb.finish_and_clear();
    }
}

impl RunObserver for RunProgress {
    fn on_event(&self, event: &RunEvent) {
        match event {
            RunEvent::Claimed { item, resumed } => {
                let verb = if *resumed { "resumed" } else { "claimed" };
                self.pb
                    .println(format!("  {} {verb} {item}", self.dim.apply_to("•")));
            }
            RunEvent::Lost { item, reason } => {
                self.pb.println(format!(
                    "  {} {item}: {reason}",
                    self.yellow.apply_to("↷")
                ));
            }
            RunEvent::Executing { item } => {
                self.pb.set_message(format!("EXECUTE: {item}"));
            }
            RunEvent::Completed { item, success } => {
                let note = if *success { "" } else { " (unsolved)" };
                self.pb.println(format!(
                    "  {} {item}{note}",
                    self.green.apply_to("✓")
                ));
                self.pb.set_message("SYNC");
            }
            RunEvent::Failed { item, error } => {
                self.pb
                    .println(format!("  {} {item}: {error}", self.red.apply_to("✗")));
                self.pb.set_message("SYNC");
            }
        }
    }
}

/// Imprime o resumo final com a cor do estado terminal.
pub fn print_summary(summary: &RunSummary) {
    let style = match summary.termination {
        Termination::Exhausted => Style::new().green().bold(),
        Termination::Stopped => Style::new().cyan().bold(),
        Termination::NoEligible => Style::new().yellow().bold(),
    };
    println!();
    println!("{}", style.apply_to(format!("─── {} ───", summary.termination)));
    println!(
        "  completed {}  failed {}  lost {}  resumed {}",
        summary.completed, summary.failed, summary.lost, summary.resumed
    );
}

/// Imprime uma linha por fase.
pub fn print_status(report: &[PhaseStatus]) {
    let bold = Style::new().bold();
    let dim = Style::new().dim();
    for phase in report {
        let name = if phase.allowed_here {
            bold.apply_to(phase.phase.clone())
        } else {
            dim.apply_to(phase.phase.clone())
        };
        println!(
            "{name}: {} queued, {} claimed, {} completed, {} runnable here",
            phase.queued, phase.claimed, phase.completed, phase.runnable_here
        );
    }
}

/// Imprime a política efetiva do host.
pub fn print_policy(policy: &ResolvedPolicy) {
    let yellow = Style::new().yellow();
    println!("host: {}", policy.host);
    if policy.is_default {
        println!("  {}", yellow.apply_to("no entry for this host, using default policy"));
    }
    if policy.pairings.is_empty() {
        println!("  pairings: (any)");
    } else {
        let tags: Vec<String> = policy.pairings.iter().map(|p| p.tag()).collect();
        println!("  pairings: {}", tags.join(" > "));
    }
    println!("  phases:   {}", policy.phases.join(", "));
}

/// Imprime os marcadores de claim com dono e idade.
pub fn print_claims(entries: &[ClaimEntry]) {
    if entries.is_empty() {
        println!("no claims");
        return;
    }
    let red = Style::new().red();
    let now = Utc::now();
    for entry in entries {
        match &entry.marker {
            Some(marker) => {
                let age = now - marker.claimed_at;
                println!(
                    "{}  {}  {}h{:02}m  {}",
                    entry.file,
                    marker.host,
                    age.num_hours(),
                    age.num_minutes() % 60,
                    marker.phase
                );
            }
            None => println!("{}  {}", entry.file, red.apply_to("unreadable marker")),
        }
    }
}
