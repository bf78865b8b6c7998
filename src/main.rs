use anyhow::{Context, Result};
use clap::Parser;
use environment_controller::config::{ControllerArgs, ControllerConfig};
use environment_controller::controller;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "environment_controller=info,kube=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let args = ControllerArgs::parse();
    let config = ControllerConfig::resolve(args)
        .context("Failed to resolve controller configuration")?;

    info!(
        "Starting environment controller for {} branch {}",
        config.source_url, config.branch
    );

    controller::run(config).await
}
