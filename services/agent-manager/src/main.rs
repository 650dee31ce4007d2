//! Fleet agent manager
//!
//! Runs reconciliation passes that scale CI build-agent VMs to queue demand.
//! `plan` prints what a pass would do; `run` applies it once or in a loop.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use fleet_agent_manager::{
    Config, FileConfigSource, LastGoodConfigSource, Manager, ManagerSettings, TtlCache,
    WorldSnapshot,
};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Scale CI build-agent VMs to match queue demand.
#[derive(Debug, Parser)]
#[command(name = "agent-manager")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Fleet configuration document.
    #[arg(long, global = true, env = "FLEET_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// World snapshot for the in-memory collaborators.
    #[arg(long, global = true, env = "FLEET_SNAPSHOT_PATH")]
    snapshot: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Gather and plan, then print the plan without applying it.
    Plan,

    /// Apply plans.
    Run {
        /// Run a single pass and exit.
        #[arg(long)]
        once: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.as_str().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    if let Some(path) = cli.config {
        config.config_path = path;
    }
    if let Some(path) = cli.snapshot {
        config.snapshot_path = Some(path);
    }
    match cli.command {
        Some(Commands::Plan) => {
            config.dry_run = true;
            config.continuous = false;
        }
        Some(Commands::Run { once }) => config.continuous = !once,
        None => {}
    }

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let message = format!("{e:#}");
            error!(error = %message, "Agent manager failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<()> {
    info!(
        manager = %config.manager_name,
        config_path = %config.config_path.display(),
        dry_run = config.dry_run,
        continuous = config.continuous,
        "Starting agent manager"
    );

    let snapshot = match &config.snapshot_path {
        Some(path) => WorldSnapshot::from_path(path)?,
        None => WorldSnapshot::default(),
    };
    let world = snapshot.into_world();

    let manager = Manager::new(
        ManagerSettings::from(&config),
        Arc::new(LastGoodConfigSource::new(FileConfigSource::new(
            config.config_path.clone(),
        ))),
        world.collaborators(),
        Arc::new(TtlCache::default()),
    );

    if !config.continuous {
        let outcome = manager.run_once().await?;
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let manager = Arc::new(manager);
    let loop_handle = tokio::spawn({
        let manager = Arc::clone(&manager);
        async move { manager.run(shutdown_rx).await }
    });

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    let _ = shutdown_tx.send(true);
    if let Err(e) = loop_handle.await {
        error!(error = %e, "Reconciliation loop panicked");
    }

    info!("Agent manager shutdown complete");
    Ok(())
}
