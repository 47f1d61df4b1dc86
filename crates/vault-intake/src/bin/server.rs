//! Intake server binary
//!
//! Run with: cargo run -p vault-intake --bin vault-intake-server -- --config intake.toml

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vault_intake::{config::IntakeConfig, server::IntakeServer};

#[derive(Debug, Parser)]
#[command(name = "vault-intake-server", version, about = "Document intake, triage and dispatch")]
struct Args {
    /// TOML configuration file (falls back to VAULT_INTAKE_CONFIG, then defaults)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Keep jobs in memory only
    #[arg(long)]
    no_persist: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vault_intake=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = IntakeConfig::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if args.no_persist {
        config.storage.enabled = false;
    }

    tracing::info!("Configuration loaded");
    tracing::info!("  - Min dispatch share: {}", config.queue.min_dispatch_share);
    tracing::info!("  - Max retries: {}", config.retry.max_retries);
    tracing::info!(
        "  - Breaker: {} failures in {}s, {}s cooldown",
        config.breaker.failure_threshold,
        config.breaker.window_secs,
        config.breaker.cooldown_secs
    );
    for backend in &config.backends {
        tracing::info!(
            "  - Backend {}: {} ({:?} / {:?})",
            backend.id,
            backend.url,
            backend.categories,
            backend.paths
        );
    }
    if config.backends.is_empty() {
        tracing::warn!("No extraction backends configured, using the local extractor for every category");
    }

    let server = IntakeServer::new(config)?;

    println!("\nServer starting...");
    println!("  API: http://{}", server.address());
    println!("  Health: http://{}/health", server.address());
    println!("  API Info: http://{}/api/info", server.address());
    println!("\nPress Ctrl+C to stop\n");

    server.start().await?;

    Ok(())
}
