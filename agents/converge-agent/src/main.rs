//! Converge Agent CLI Entry Point
//!
//! This is the main entry point for the Converge Agent binary.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use converge_agent::agent::cycle::{CycleOrchestrator, CycleSettings};
use converge_agent::agent::lifecycle::{self, PidFile};
use converge_agent::agent::scheduler::Scheduler;
use converge_agent::agent::state::StageTracker;
use converge_agent::cli::config::Config;
use converge_agent::cli::logging;
use converge_agent::connection::client::HttpControlPlane;
use converge_agent::runtime::process::ProcessRunner;

#[derive(Parser)]
#[command(name = "converge-agent")]
#[command(author, version, about = "Converge Agent - keeps a host converged on its desired configuration")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/agent.toml", env = "CONVERGE_AGENT_CONFIG")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the agent and run cycles until signalled
    Start {
        /// Seconds between cycles; overrides the configured interval
        #[arg(short, long)]
        interval: Option<i64>,
    },
    /// Stop a running agent
    Stop,
    /// Run a single cycle in the foreground
    Once,
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start { interval } => {
            start_agent(&cli.config, cli.verbose, interval).await?;
        }
        Commands::Stop => {
            stop_agent(&cli.config)?;
        }
        Commands::Once => {
            run_once(&cli.config, cli.verbose).await?;
        }
        Commands::Version => {
            show_version();
        }
    }

    Ok(())
}

fn load(config_path: &Path, verbose: bool) -> Result<Config> {
    let config = Config::load(config_path)?;
    logging::init(&config.logging, verbose)?;
    info!(agent_id = %config.agent_id, server_id = %config.server_id, "Configuration loaded");
    Ok(config)
}

fn build_control_plane(config: &Config) -> Result<HttpControlPlane> {
    HttpControlPlane::new(&config.control_plane, &config.agent_id, &config.server_id)
}

fn orchestrator(
    control_plane: HttpControlPlane,
    config: &Config,
) -> CycleOrchestrator<HttpControlPlane, ProcessRunner> {
    CycleOrchestrator::new(
        Arc::new(control_plane),
        Arc::new(ProcessRunner),
        CycleSettings::from_config(config),
        StageTracker::new(),
    )
}

async fn prepare_workdir(config: &Config) -> Result<()> {
    tokio::fs::create_dir_all(&config.paths.workdir)
        .await
        .with_context(|| {
            format!(
                "Failed to create working directory {}",
                config.paths.workdir.display()
            )
        })
}

async fn start_agent(config_path: &Path, verbose: bool, interval: Option<i64>) -> Result<()> {
    let config = load(config_path, verbose)?;
    info!("Starting Converge Agent...");

    let _pid_file = PidFile::acquire(&config.paths.pid_file)
        .context("Failed to create PID file")?;
    prepare_workdir(&config).await?;

    let control_plane = build_control_plane(&config)?;
    control_plane
        .check_reachable()
        .await
        .context("Control plane is not reachable")?;
    info!(url = %config.control_plane.url, "Control plane reachable");

    let cancel = CancellationToken::new();
    let _signals = lifecycle::spawn_signal_listener(cancel.clone())?;

    let cycle = Arc::new(orchestrator(control_plane, &config));

    let mut schedule = config.schedule.clone();
    if let Some(interval) = interval {
        schedule.interval_secs = interval;
    }
    let scheduler = Scheduler::from_schedule(cycle.clone(), &schedule, cancel);
    let stats = scheduler.run().await;

    let stages = cycle.stages();
    if let Some(last) = stages.recent_transitions(1).first() {
        if let Some(reason) = &last.reason {
            warn!(stage = %last.from, at = %last.timestamp, reason = %reason, "Last cycle aborted");
        }
    }
    info!(
        cycles_started = stats.cycles_started,
        cycles_completed = stages.cycles_completed(),
        cycles_aborted = stages.cycles_aborted(),
        last_completed = ?stages.last_completed(),
        "Converge Agent stopped"
    );
    Ok(())
}

fn stop_agent(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)?;
    let pid = lifecycle::stop(&config.paths.pid_file).with_context(|| {
        format!(
            "Failed to stop agent using {}",
            config.paths.pid_file.display()
        )
    })?;
    println!("Sent SIGTERM to converge-agent (pid {})", pid);
    Ok(())
}

async fn run_once(config_path: &Path, verbose: bool) -> Result<()> {
    let config = load(config_path, verbose)?;
    prepare_workdir(&config).await?;

    let cancel = CancellationToken::new();
    let _signals = lifecycle::spawn_signal_listener(cancel.clone())?;

    let state = orchestrator(build_control_plane(&config)?, &config)
        .run_once(&cancel)
        .await
        .context("Cycle aborted")?;

    let executed = state.policies.iter().filter(|p| p.is_executed()).count();
    println!(
        "Cycle finished: {}/{} policies applied (attributes {})",
        executed,
        state.policies.len(),
        state.attributes.revision_id()
    );
    Ok(())
}

fn show_version() {
    println!("converge-agent {}", env!("CARGO_PKG_VERSION"));
    println!("Host agent for pull-based configuration convergence");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orchestrator_built_from_config() {
        let config: Config = toml::from_str(r#"agent_id = "agent-1""#).unwrap();
        let cycle = orchestrator(build_control_plane(&config).unwrap(), &config);

        assert_eq!(cycle.stages().cycles_completed(), 0);
        assert_eq!(cycle.stages().cycles_aborted(), 0);
    }
}
