use std::process::ExitCode;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{Level, error, warn};

use benchgrid::bridge::{CommandDispatcher, ExecutionBridge};
use benchgrid::claim::{ClaimManager, ClearOutcome};
use benchgrid::cli::{ClaimsAction, Cli, Command};
use benchgrid::config::BenchConfig;
use benchgrid::item::WorkItem;
use benchgrid::matrix::{PhaseDefinition, compile_all, write_manifests};
use benchgrid::policy::ResolvedPolicy;
use benchgrid::runner::{Runner, RunnerOptions, status_report};
use benchgrid::store::GitStore;
use benchgrid::sync::{publish_with_retry, synchronize};
use benchgrid::{host, telemetry, ui};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    telemetry::init_tracing(cli.json_logs, level);

    match dispatch(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            error!("{err:#}");
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}

async fn dispatch(cli: Cli) -> Result<u8> {
    let config = BenchConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    let host = host::resolve(cli.host.as_deref(), config.host.as_deref());

    match cli.command {
        Command::Compile { phase, no_publish } => compile(&config, &host, phase, no_publish).await,
        Command::Run {
            phase,
            max_items,
            no_resume,
        } => {
            let options = RunnerOptions {
                max_items,
                resume: !no_resume,
            };
            run(&config, &host, phase, options).await
        }
        Command::Status { phase } => status(&config, &host, phase).await,
        Command::Policy => {
            ui::print_policy(&resolve_policy(&config, &host, None)?);
            Ok(0)
        }
        Command::Claims { action } => claims(&config, &host, action).await,
    }
}

fn open_store(config: &BenchConfig) -> Result<GitStore> {
    GitStore::open(
        &config.store,
        config.remote_name(),
        config.branch.clone(),
        config.layout.managed_dirs(),
    )
    .with_context(|| format!("failed to open shared store at {}", config.store.display()))
}

fn resolve_policy(config: &BenchConfig, host: &str, phase: Option<&str>) -> Result<ResolvedPolicy> {
    let policy = config.policy.resolve(host, &config.phases)?;
    if policy.is_default {
        warn!(host, "no policy entry for this host, falling back to default");
    }
    Ok(match phase {
        Some(phase) => {
            config.phase(phase)?;
            policy.only_phase(phase)?
        }
        None => policy,
    })
}

fn selected_phases(config: &BenchConfig, phase: Option<&str>) -> Result<Vec<PhaseDefinition>> {
    Ok(match phase {
        Some(name) => vec![config.phase(name)?.clone()],
        None => config.phases.clone(),
    })
}

async fn compile(
    config: &BenchConfig,
    host: &str,
    phase: Option<String>,
    no_publish: bool,
) -> Result<u8> {
    let defs = selected_phases(config, phase.as_deref())?;
    if defs.is_empty() {
        bail!("no phases defined in configuration");
    }

    if no_publish {
        for manifest in compile_all(&defs)? {
            println!("# {} ({} items)", manifest.phase, manifest.len());
            print!("{}", manifest.render());
        }
        return Ok(0);
    }

    let mut store = open_store(config)?;
    let mut compiled = Vec::new();
    let message = format!("compile manifests by {host}");
    publish_with_retry(&mut store, &config.sync, &message, |store| {
        compiled = write_manifests(store, &config.layout, &defs)?;
        Ok(())
    })
    .await?;

    for manifest in &compiled {
        println!("{}: {} items", manifest.phase, manifest.len());
    }
    Ok(0)
}

async fn run(
    config: &BenchConfig,
    host: &str,
    phase: Option<String>,
    options: RunnerOptions,
) -> Result<u8> {
    let policy = resolve_policy(config, host, phase.as_deref())?;
    let dispatcher = CommandDispatcher::new(
        &config.dispatcher.command,
        config.dispatcher.timeout_secs,
        config.dispatcher.working_dir.clone(),
    )?;
    let claims = ClaimManager::new(
        open_store(config)?,
        host,
        config.layout.clone(),
        config.sync.clone(),
    );

    let progress = ui::RunProgress::start(host);
    let mut runner = Runner::new(claims, ExecutionBridge::new(dispatcher), policy, options)
        .with_observer(Box::new(progress.clone()));

    match runner.run().await {
        Ok(summary) => {
            progress.finish(&summary);
            Ok(summary.termination.exit_code() as u8)
        }
        Err(err) => {
            progress.abandon();
            Err(err.into())
        }
    }
}

async fn status(config: &BenchConfig, host: &str, phase: Option<String>) -> Result<u8> {
    let policy = resolve_policy(config, host, None)?;
    let defs = selected_phases(config, phase.as_deref())?;
    let mut store = open_store(config)?;
    synchronize(&mut store, &config.sync).await?;

    let report = status_report(&store, &config.layout, &policy, &defs)?;
    ui::print_status(&report);
    Ok(0)
}

async fn claims(config: &BenchConfig, host: &str, action: ClaimsAction) -> Result<u8> {
    let mut manager = ClaimManager::new(
        open_store(config)?,
        host,
        config.layout.clone(),
        config.sync.clone(),
    );

    match action {
        ClaimsAction::List => {
            manager.sync().await?;
            ui::print_claims(&manager.list()?);
        }
        ClaimsAction::Clear { item, force } => {
            let item = WorkItem::decode(&item)?;
            match manager.clear(&item, force).await? {
                ClearOutcome::Removed => println!("cleared claim on {}", item.name()),
                ClearOutcome::NotFound => println!("no claim on {}", item.name()),
                ClearOutcome::ForeignOwner(owner) => {
                    bail!("claim on {} belongs to {owner}; pass --force to remove it", item.name())
                }
            }
        }
        ClaimsAction::Prune => {
            let removed = manager.prune().await?;
            for file in &removed {
                println!("pruned {file}");
            }
            println!("{} orphan claims removed", removed.len());
        }
    }
    Ok(0)
}
