//! NiuNiu transaction coordinator service
//!
//! Connects the configured wallet accounts to the chain and serves nonce-managed
//! contract submissions over HTTP.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use niuniu_tx::account::AccountSession;
use niuniu_tx::api::{self, AccountHandle, AppState};
use niuniu_tx::chain::EthereumClient;
use niuniu_tx::config::Settings;
use niuniu_tx::metrics::{self, MetricsServer};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting NiuNiu transaction coordinator v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for chain {} ({} accounts, {} contracts)",
        settings.chain.name,
        settings.wallet.accounts.len(),
        settings.contracts.len()
    );

    // Build one chain client per configured wallet
    let mut clients = Vec::new();
    let mut accounts = HashMap::new();
    for (name, account) in &settings.wallet.accounts {
        match EthereumClient::from_account(settings.chain.clone(), &settings.gas, account) {
            Ok(client) => {
                let client = Arc::new(client);
                info!("Account {} is {:?}", name, client.address());
                accounts.insert(
                    name.clone(),
                    AccountHandle {
                        address: client.address(),
                        chain: client.clone(),
                    },
                );
                clients.push(client);
            }
            Err(e) if name == &settings.wallet.active => {
                return Err(e).with_context(|| format!("Active account {} unavailable", name));
            }
            Err(e) => warn!("Skipping account {}: {}", name, e),
        }
    }

    let contracts = settings.contract_addresses()?;
    let state = AppState::new(Arc::new(AccountSession::new()), accounts, contracts);
    state.switch_account(&settings.wallet.active)?;
    info!("Connected account {}", settings.wallet.active);

    // Initialize metrics server
    let metrics_server = if settings.metrics.enabled {
        Some(MetricsServer::new(settings.metrics.port))
    } else {
        None
    };

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let state = state.clone();
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = metrics_server.map(|server| {
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        })
    });

    // Health check loop
    let health_handle = tokio::spawn({
        let interval = settings.service.health_check_interval_secs;
        let chain_id = settings.chain.chain_id;
        let clients = clients.clone();
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;

                let mut healthy = !clients.is_empty();
                for client in &clients {
                    if !client.health_check().await {
                        warn!("Chain {} health check failed for {:?}", chain_id, client.address());
                        healthy = false;
                    }
                }

                metrics::record_chain_health(chain_id, healthy);
                if healthy {
                    metrics::record_health_check();
                } else {
                    metrics::record_health_check_failure();
                }
            }
        }
    });

    info!(
        "NiuNiu coordinator {} is running",
        settings.service.instance_id
    );
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    if let Ok(account) = state.session.current() {
        let snapshot = account.allocator.snapshot();
        if snapshot.pending_count > 0 {
            warn!(
                "Stopping with {} unconfirmed nonces for {:?}",
                snapshot.pending_count, snapshot.address
            );
        }
    }

    // Abort background tasks
    api_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("NiuNiu coordinator stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,niuniu_tx=debug,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
