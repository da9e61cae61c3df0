// tracker-syncd: standalone sync daemon entry point.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracker_sync::config::{self, SyncSettings};

#[derive(Debug, Parser)]
#[command(name = "tracker-syncd", version, about = "Keep the local tracker store in sync")]
struct Args {
    /// Config file (defaults to ~/.tracker/config.toml).
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let settings = match args.config.or_else(config::config_path) {
        Some(path) => SyncSettings::load_or_default(&path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => SyncSettings::default(),
    };

    info!("starting standalone tracker sync daemon");
    tracker_sync::runtime::run_standalone(settings)
        .await
        .context("standalone sync daemon terminated unexpectedly")
}
