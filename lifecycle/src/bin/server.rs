//! Hub server binary
//!
//! Runs the accounting hub against the configured node backend until
//! Ctrl-C, or until the invoice settlement stream fails for good, in which
//! case the process exits non-zero so a supervisor can restart it.
//!
//! Configuration comes from an optional TOML file (first argument or
//! `HUB_CONFIG`) with `HUB_*` environment overrides on top.

use anyhow::Context;
use lifecycle::{Config, Hub};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("HUB_LOG_JSON").map_or(false, |v| v == "1" || v == "true");

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init();
    }
}

fn load_config() -> anyhow::Result<Config> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("HUB_CONFIG").ok());

    let config = match path {
        Some(path) => {
            info!("Loading config from: {}", path);
            Config::from_file(&path).with_context(|| format!("reading {}", path))?
        }
        None => Config::default(),
    };
    Ok(config.with_env_overrides()?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    info!("Starting hub server");

    let config = load_config()?;
    info!(
        data_dir = ?config.ledger.data_dir,
        nodes = ?config.node.nodes,
        fee_reserve = config.fees.reserve_enabled,
        "Configuration loaded"
    );

    let hub = Hub::from_config(config).context("building hub")?;
    let cancel = CancellationToken::new();
    let mut handle = hub.start(cancel.clone()).await.context("starting hub")?;

    let outcome = tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Shutdown signal received");
            Ok(())
        }
        joined = &mut handle.supervisor => match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!(error = %e, "Settlement stream lost; exiting");
                Err(anyhow::Error::new(e).context("invoice settlement stream failed"))
            }
            Err(e) => Err(anyhow::Error::new(e).context("settlement supervisor panicked")),
        },
    };

    cancel.cancel();
    hub.broker().shutdown();
    handle.join_tasks().await;
    info!("Hub server stopped");

    outcome
}
