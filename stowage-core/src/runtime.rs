//! Node runtime for the standalone binary
//!
//! Wires identity, repository, engine and the REST server together, then
//! parks on ctrl-c.

use std::sync::Arc;
use thiserror::Error;
use tokio::signal;
use tracing::info;

use crate::api;
use crate::config::Config;
use crate::engine::NodeEngine;
use crate::exchange::{BlockExchange, OfflineExchange};
use crate::identity::{IdentityError, NodeIdentity, REPO_DIR};
use crate::repo::RepoStore;
use crate::store::{BlockStore, StoreError};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Run the node until ctrl-c.
pub async fn run_node(config: Config) -> Result<(), RuntimeError> {
    let identity = NodeIdentity::load_or_create(&config.data_dir)?;
    info!(peer_id = %identity.peer_id(), "node identity ready");

    let store: Arc<dyn BlockStore> = Arc::new(RepoStore::open(
        config.data_dir.join(REPO_DIR),
        config.storage_quota,
    )?);
    let exchange: Arc<dyn BlockExchange> =
        Arc::new(OfflineExchange::new(&identity, &config.listen_addrs));
    let engine = NodeEngine::new(store, exchange)
        .with_block_ttl(std::time::Duration::from_secs(config.block_ttl));
    info!("initialized block repository and engine");

    let router = api::create_router(engine.clone(), config.api_cors_allowed_origin.as_deref());
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.api_port)).await?;
    info!(addr = %listener.local_addr()?, "rest api listening");

    tokio::select! {
        result = axum::serve(listener, router) => { result?; }
        _ = signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
        }
    }

    engine.stop().await;
    info!("node stopped");
    Ok(())
}
