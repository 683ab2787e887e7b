use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tether_bot::config::BotConfig;
use tether_bot::db::pool::{create_pool, run_migrations};
use tether_bot::engine::registry::Registry;
use tether_bot::platform::OfflinePlatform;
use tether_bot::web::app_state::AppState;
use tether_bot::web::router::build_router;

#[derive(Parser)]
#[command(name = "tether", about = "Moderation bot state reconciliation engine")]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, default_value = "tether.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = BotConfig::load(&cli.config)?;

    let pool = create_pool(&config.database.url)
        .await
        .context("failed to connect to database")?;
    run_migrations(&pool)
        .await
        .context("failed to run database migrations")?;

    // No gateway is attached here; a platform client is plugged in at this seam.
    let platform = Arc::new(OfflinePlatform);

    let shutdown = CancellationToken::new();
    let (registry, tasks) = Registry::start(Some(pool), platform, &config, shutdown.clone());

    let guilds = registry.known_guild_ids().await?;
    let report = registry.recover(&guilds).await?;
    info!(
        guilds = report.guilds,
        restored = report.restored,
        expired = report.expired,
        "startup recovery complete"
    );

    let app = build_router(Arc::new(AppState { registry }));
    let listener = tokio::net::TcpListener::bind(&config.control.address)
        .await
        .with_context(|| format!("failed to bind control plane on {}", config.control.address))?;
    info!("Tether starting, control plane on {}", config.control.address);

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
            }
            signal.cancel();
        })
        .await
        .context("control plane error")?;

    shutdown.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            error!(error = %e, "background task failed");
        }
    }
    info!("Tether stopped");
    Ok(())
}
