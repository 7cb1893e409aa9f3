use anyhow::{Context, Result};
use relayscope::logger::init_tracing;
use relayscope::{Hooks, ProxyConfig, ProxyServer};
use std::sync::Arc;
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration (.env first)
    let config = ProxyConfig::from_env()?;
    init_tracing(config.log_format)?;

    info!("Starting relayscope {}...", relayscope::VERSION);

    let server = Arc::new(
        ProxyServer::bind(config, Hooks::new(), None)
            .await
            .context("Failed to start proxy")?,
    );
    info!(addr = %server.local_addr(), "Listening");

    let runner = Arc::clone(&server);
    let accept_loop = tokio::spawn(async move { runner.run().await });

    shutdown_signal().await;
    info!("Shutdown signal received");
    server.shutdown();

    accept_loop.await.context("Accept loop panicked")??;
    let stats = server.stats();
    info!(
        accepted = stats.accepted,
        failed = stats.failed,
        "Proxy stopped"
    );
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        },
        _ = terminate => {
            info!("Received SIGTERM");
        },
    }
}
