//! skiff-probe - host agent for the Skiff console

use anyhow::Context;
use clap::Parser;
use skiff_probe::{Agent, ProbeConfig};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "skiff-probe")]
#[command(author, version, about = "Skiff host probe agent", long_about = None)]
struct Cli {
    /// Path to the agent config (YAML)
    #[arg(short, long, default_value = "/etc/skiff/probe.yaml")]
    config: PathBuf,

    /// Enroll with the configured token and exit
    #[arg(long)]
    enroll_only: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let config = ProbeConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let mut agent = Agent::new(config, Some(cli.config.clone()))?;

    if cli.enroll_only {
        if agent.config().is_enrolled() {
            info!(probe_id = agent.config().probe_id, "already enrolled");
        } else {
            agent.enroll().await.context("enrollment failed")?;
        }
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutting down");
            shutdown.cancel();
        }
    });

    agent.run(cancel).await?;
    Ok(())
}
