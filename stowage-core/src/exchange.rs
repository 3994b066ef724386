//! Block exchange interface
//!
//! The peer-to-peer transport is an external collaborator; the engine only
//! sees this contract. Blocks can be requested by CID or by dataset position,
//! peers can be dialled, and the local node advertises its peer id and peer
//! record. Retries and backoff live behind this interface, never in the
//! engine.

use async_trait::async_trait;
use cid::Cid;
use thiserror::Error;
use tracing::debug;

use crate::block::Block;
use crate::identity::NodeIdentity;

#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("Block not found on the network: {0}")]
    NotFound(String),

    #[error("Network failure: {0}")]
    Network(String),
}

pub type Result<T> = std::result::Result<T, ExchangeError>;

/// Contract between the engine and the peer-to-peer layer.
#[async_trait]
pub trait BlockExchange: Send + Sync {
    /// Request a block by CID from connected peers.
    async fn want_block(&self, cid: &Cid) -> Result<Block>;

    /// Request a dataset block by `(tree_cid, index)` from connected peers.
    async fn want_block_indexed(&self, tree_cid: &Cid, index: u64) -> Result<Block>;

    /// Dial a peer at the given addresses.
    async fn connect(&self, peer_id: &str, addrs: &[String]) -> Result<()>;

    fn local_peer_id(&self) -> String;

    /// The node's encoded peer record.
    fn spr(&self) -> String;
}

/// Exchange with no peers. Every want misses; dials are accepted and logged.
///
/// Stands in wherever the node runs without a transport, and doubles as the
/// reference for the error contract.
pub struct OfflineExchange {
    peer_id: String,
    spr: String,
}

impl OfflineExchange {
    pub fn new(identity: &NodeIdentity, listen_addrs: &[String]) -> Self {
        Self {
            peer_id: identity.peer_id().to_string(),
            spr: identity.peer_record(listen_addrs),
        }
    }
}

#[async_trait]
impl BlockExchange for OfflineExchange {
    async fn want_block(&self, cid: &Cid) -> Result<Block> {
        Err(ExchangeError::NotFound(cid.to_string()))
    }

    async fn want_block_indexed(&self, tree_cid: &Cid, index: u64) -> Result<Block> {
        Err(ExchangeError::NotFound(format!("{}/{}", tree_cid, index)))
    }

    async fn connect(&self, peer_id: &str, addrs: &[String]) -> Result<()> {
        debug!(peer_id, ?addrs, "connect requested with no transport attached");
        Ok(())
    }

    fn local_peer_id(&self) -> String {
        self.peer_id.clone()
    }

    fn spr(&self) -> String {
        self.spr.clone()
    }
}
