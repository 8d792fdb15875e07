//! # keyless-agent
//!
//! Gateway agent for the keyless proximity access-control system.
//!
//! This binary:
//! - Runs the session loop (scan, authenticate, unlock, watch, re-lock)
//! - Drives the machine's lock output
//! - Serves a local read-only status API
//!
//! ## Running
//!
//! ```bash
//! # Development, without a radio
//! cargo run --package keyless-agent --no-default-features --features mock-bluetooth
//!
//! # Production (on the gateway)
//! KEYLESS_ENV=production ./keyless-agent
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::net::SocketAddr;

use anyhow::Context;
use keyless_agent::state::AppState;
use keyless_agent::{actuator, api, logging};
use keyless_core::config::StatusApiConfig;
use keyless_core::{Config, Orchestrator, RadioLink};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[cfg(not(any(feature = "bluetooth", feature = "mock-bluetooth")))]
compile_error!("enable the `bluetooth` or `mock-bluetooth` feature");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let production = logging::is_production(std::env::var(logging::ENV_VAR).ok().as_deref());
    logging::init(production)?;

    let config = Config::load().context("failed to load configuration")?;
    info!(
        rcu_id = %config.controller.rcu_id,
        version = env!("CARGO_PKG_VERSION"),
        production,
        "Starting keyless-agent"
    );
    match config.to_toml() {
        Ok(rendered) => debug!(config = %rendered, "Effective configuration"),
        Err(e) => warn!(error = %e, "Could not render configuration"),
    }

    let radio = open_radio(&config).await?;
    run(radio, config).await
}

#[cfg(feature = "bluetooth")]
async fn open_radio(config: &Config) -> anyhow::Result<keyless_core::BluezRadio> {
    keyless_core::BluezRadio::new(config.radio.adapter.as_deref())
        .await
        .context("failed to open the Bluetooth adapter")
}

#[cfg(all(not(feature = "bluetooth"), feature = "mock-bluetooth"))]
#[allow(clippy::unused_async)]
async fn open_radio(_config: &Config) -> anyhow::Result<keyless_core::MockRadio> {
    warn!("Running with the in-memory radio, no device will ever be found");
    Ok(keyless_core::MockRadio::new())
}

async fn run<R: RadioLink>(radio: R, config: Config) -> anyhow::Result<()> {
    let lock_output = actuator::from_config(&config.actuator);
    let status_api = config.status_api.clone();
    let rcu_id = config.controller.rcu_id.clone();

    let mut orchestrator = Orchestrator::new(radio, lock_output, config)?;
    let shutdown = CancellationToken::new();

    let server = status_api.enabled.then(|| {
        let state = AppState::new(rcu_id, orchestrator.status());
        tokio::spawn(serve(status_api, state, shutdown.clone()))
    });

    tokio::spawn(wait_for_signal(shutdown.clone()));

    orchestrator.run(shutdown.clone()).await;
    shutdown.cancel();

    if let Some(server) = server {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Status API failed"),
            Err(e) => error!(error = %e, "Status API task panicked"),
        }
    }

    info!("keyless-agent stopped");
    Ok(())
}

async fn serve(
    config: StatusApiConfig,
    state: AppState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let addr: SocketAddr = config
        .bind
        .parse()
        .with_context(|| format!("invalid status API address '{}'", config.bind))?;
    let listener = TcpListener::bind(addr).await?;

    info!(%addr, "Status API listening");

    axum::serve(listener, api::create_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

/// Cancel `shutdown` on Ctrl-C or SIGTERM.
async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Ctrl-C received, shutting down"),
        () = terminate => info!("SIGTERM received, shutting down"),
    }
    shutdown.cancel();
}
