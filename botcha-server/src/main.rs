//! BOTCHA server binary.
//!
//! Reads configuration from `BOTCHA_CONFIG` (default `botcha.toml`) and
//! `BOTCHA_JWT_SECRET`, then serves the API until Ctrl-C.

#![allow(
    clippy::multiple_crate_versions,
    reason = "transitive dependencies from reqwest and rsa"
)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use botcha::store::MemoryStore;
use botcha_server::{
    AppState, ServerConfig,
    error::Result,
    observability::{LogFormat, init_observability},
    router,
};
use tokio::net::TcpListener;
use tracing::{error, info};

/// How often expired entries are dropped from the in-memory store.
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> std::process::ExitCode {
    init_observability(LogFormat::from_env());

    match run().await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "server failed");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let config = ServerConfig::load()?;
    let store = Arc::new(MemoryStore::new());
    let state = Arc::new(AppState::new(&config, Arc::clone(&store))?);

    let purge = tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            interval.tick().await;
            store.purge_expired().await;
        }
    });

    let listener = TcpListener::bind(config.bind).await?;
    info!(addr = %listener.local_addr()?, "botcha server listening");

    axum::serve(listener, router(state).into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    purge.abort();
    info!("botcha server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
