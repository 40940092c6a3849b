//! Signaling relay: assigns ids and usernames to connected endpoints and forwards
//! negotiation envelopes between them over WebSocket.

pub mod cli;
pub mod config;
pub mod error;
pub mod handlers;
pub mod registry;
pub mod relay;
pub mod telemetry;
pub mod websocket;

use std::net::SocketAddr;
use std::future::Future;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tracing::info;

pub use crate::config::Config;
pub use crate::error::RelayError;
pub use crate::handlers::{router, AppState};
pub use crate::registry::Registry;
pub use crate::relay::Relay;

/// Build the relay for a configuration: a fixed id seed when given, the wall clock otherwise.
pub fn relay_for(config: &Config) -> Relay {
    let registry = match config.id_seed {
        Some(seed) => Registry::new(seed),
        None => Registry::seeded_from_clock(),
    };
    Relay::new(registry)
}

/// Serve the relay on an already-bound listener until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("relay server exited with error")
}

/// Bind the configured address and serve until ctrl-c.
pub async fn run(config: Config, metrics: Option<PrometheusHandle>) -> Result<()> {
    let relay = relay_for(&config);
    let state = AppState::new(relay, metrics);

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Parley relay listening on {}", addr);

    serve(listener, state, shutdown_signal()).await?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; draining connections"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("relay shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
