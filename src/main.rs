//! Multichain node - runs every configured chain instance in one process
//!
//! Chains share one coordination engine so that atomic transactions and
//! cross-chain calls between them are resolved in-process.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use multichain_coordinator::api::{self, AppState};
use multichain_coordinator::chain::{ChainRegistry, EnvelopeRouter};
use multichain_coordinator::config::Settings;
use multichain_coordinator::metrics::MetricsServer;
use multichain_coordinator::shutdown::Shutdown;
use multichain_coordinator::CoordinationEngine;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting multichain node v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains",
        settings.enabled_chains().len()
    );

    // Root cancellation scope for everything the node spawns
    let shutdown = Shutdown::new();

    // Initialize chain instances
    let registry = Arc::new(ChainRegistry::from_settings(&settings)?);
    info!("Initialized {} chain instances", registry.len());

    // Initialize coordination engine
    let engine = Arc::new(CoordinationEngine::new(
        registry.clone(),
        Arc::new(EnvelopeRouter),
        &settings.coordination,
        shutdown.clone(),
    ));

    // Start API server
    let api_handle = if settings.api.enabled {
        let state = AppState::new(engine.clone(), settings.node.instance_id.clone());
        let config = settings.api.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Block sealing and status loop
    let status_handle = tokio::spawn({
        let engine = engine.clone();
        let shutdown = shutdown.clone();
        let interval = settings.node.status_interval_secs;
        async move {
            if interval == 0 {
                return;
            }
            let mut ticker = tokio::time::interval(tokio::time::Duration::from_secs(interval));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        for (chain_id, height) in engine.commit_blocks() {
                            info!("Chain {} sealed block {}", chain_id, height);
                        }
                    }
                }
            }
        }
    });

    info!("Multichain node {} is running", settings.node.instance_id);
    if settings.api.enabled {
        info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    }
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Cancelling the root scope closes every coordination context
    engine.stop();

    if let Some(h) = api_handle {
        if tokio::time::timeout(tokio::time::Duration::from_secs(5), h)
            .await
            .is_err()
        {
            warn!("API server did not stop in time");
        }
    }
    status_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Multichain node stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,multichain_coordinator=debug,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
