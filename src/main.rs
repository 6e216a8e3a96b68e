//! chat-gateway server entry point.
//!
//! Loads configuration, connects collaborators, and serves HTTP and
//! WebSocket traffic until SIGINT or SIGTERM.

use std::sync::Arc;

use anyhow::Context;

use chat_gateway::config::GatewayConfig;
use chat_gateway::server::{Collaborators, GatewayServer};
use chat_gateway::telemetry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = GatewayConfig::from_env()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    telemetry::init(config.log_format);
    tracing::info!(addr = %config.listen_addr, "starting chat-gateway");

    let collaborators = Collaborators::from_config(&config)
        .await
        .context("failed to connect collaborators")?;
    let server = Arc::new(GatewayServer::start(&config, collaborators));
    let app = server.router();

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "server listening");

    let draining = Arc::clone(&server);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            draining.shutdown().await;
        })
        .await
        .context("server error")?;

    tracing::info!("shutdown complete");
    Ok(())
}

/// Resolves on the first SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}
