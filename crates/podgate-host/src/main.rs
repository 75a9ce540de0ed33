//! podgate - Main Entry Point

use anyhow::Context;
use clap::Parser;
use podgate_host::config::HostConfig;
use podgate_host::{serve, AppState};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "podgate")]
#[command(version)]
#[command(about = "Payment-gated pod host", long_about = None)]
struct Cli {
    /// Configuration file (TOML, JSON or YAML)
    #[arg(long, env = "PODGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overrides the configuration
    #[arg(long, env = "PODGATE_BIND")]
    bind: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    tracing::info!("podgate v{}", env!("CARGO_PKG_VERSION"));

    let mut config = HostConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }

    tracing::warn!("payments are simulated; no funds are collected");
    let state = AppState::development(config).context("building host state")?;

    serve(state).await.context("serving")?;
    Ok(())
}
