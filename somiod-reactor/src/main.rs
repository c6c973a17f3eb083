//! SOMIOD Reactor - dashboard process
//!
//! Registers the dashboard, listens for notifications on the watched
//! container and reacts to readings until Ctrl-C.

use anyhow::{Context, Result};
use somiod_reactor::{runtime, Config};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // .env optionnel
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("somiod_reactor=info")),
        )
        .init();

    info!("SOMIOD reactor starting...");

    let config = Config::load().context("Failed to load configuration")?;

    runtime::run(config)
        .await
        .context("Reactor execution failed")?;

    Ok(())
}
