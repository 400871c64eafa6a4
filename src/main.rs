//! agentman - lifecycle manager for ephemeral test agents
//!
//! Reads one command per line from stdin and stops every agent it started
//! on SIGINT, SIGTERM or end of input.

use agentman::command::CommandAdapter;
use agentman::config::{ManagerConfig, ProvisionerKind};
use agentman::signals::ShutdownSignals;
use agentman::AgentRegistry;
use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// agentman - ephemeral agent and cluster manager
#[derive(Parser)]
#[command(name = "agentman")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "Start, resize and stop throwaway agents and agent clusters", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Disable logging
    #[arg(short, long, conflicts_with = "debug")]
    quiet: bool,

    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Provisioner to use, overriding the configuration file
    #[arg(long, value_enum)]
    provisioner: Option<ProvisionerKind>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging; stdout is reserved for command output
    let filter = if cli.quiet {
        EnvFilter::new("off")
    } else if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &cli.config {
        Some(path) => ManagerConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ManagerConfig::default(),
    };
    if let Some(kind) = cli.provisioner {
        config.provisioner = kind;
    }

    info!("Booting up agentman with the {:?} provisioner", config.provisioner);

    // Blocking HTTP clients may not be built or dropped on runtime threads,
    // so everything touching the registry runs on the blocking pool.
    let adapter = tokio::task::spawn_blocking(move || {
        let registry = Arc::new(AgentRegistry::new(config.build_provisioner()?));
        CommandAdapter::new(registry, &config)
    })
    .await
    .context("Startup task panicked")?
    .context("Failed to initialize provisioner")?;
    let adapter = Arc::new(adapter);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut signals =
        ShutdownSignals::install().context("Failed to install signal handlers")?;

    loop {
        tokio::select! {
            name = signals.recv() => {
                info!("Saw {}, shutting down...", name);
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let worker = adapter.clone();
                    match tokio::task::spawn_blocking(move || worker.execute(&line)).await {
                        Ok(Ok(output)) if output.is_empty() => {}
                        Ok(Ok(output)) => println!("{}", output),
                        Ok(Err(e)) => println!("Error: {}", e),
                        Err(e) => error!("Command task failed: {}", e),
                    }
                }
                Ok(None) => {
                    info!("Input closed, shutting down...");
                    break;
                }
                Err(e) => {
                    error!("Unable to read from stdin: {}", e);
                    break;
                }
            }
        }
    }

    let result = tokio::task::spawn_blocking(move || adapter.shutdown())
        .await
        .context("Shutdown task panicked")?;

    // Exit directly: a pending stdin read would otherwise hold up runtime shutdown
    match result {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            error!("Did not shut down cleanly: {}", e);
            std::process::exit(1)
        }
    }
}
