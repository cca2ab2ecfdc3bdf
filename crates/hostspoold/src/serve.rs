//! Serve mode: store, manager, and REST API in one process.

use std::net::SocketAddr;

use tracing::{info, warn};

use hostspool_core::PoolConfig;
use hostspool_manager::{HostsPoolManager, ManagerOptions, PoolError};
use hostspool_state::StateStore;

/// Store file name used under `--data-dir`.
pub const STORE_FILE: &str = "hostspool.redb";

/// Store the configured locations that are not known yet. Stored
/// locations win over the file so API edits survive restarts.
pub fn register_locations(
    manager: &HostsPoolManager,
    config: &PoolConfig,
) -> anyhow::Result<usize> {
    let mut created = 0;
    for location in &config.locations {
        match manager.create_location(location) {
            Ok(()) => created += 1,
            Err(PoolError::DuplicateName(_)) => {
                info!(location = %location.name, "location already stored, keeping stored version");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(created)
}

pub async fn run_serve(config: PoolConfig) -> anyhow::Result<()> {
    info!("hosts pool daemon starting");

    if let Some(parent) = config.store.path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = StateStore::open(&config.store.path)?;
    info!(path = ?config.store.path, "pool store opened");

    let options = ManagerOptions::from(&config.manager);
    if options.check_connections {
        info!(timeout = ?options.connection_timeout, "host connection probing enabled");
    } else {
        warn!("host connection probing disabled");
    }
    let manager = HostsPoolManager::new(store, options);

    let created = register_locations(&manager, &config)?;
    info!(
        configured = config.locations.len(),
        created, "locations registered"
    );

    let router = hostspool_api::build_router(manager);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.api.port));
    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
        })
        .await?;

    info!("hosts pool daemon stopped");
    Ok(())
}
