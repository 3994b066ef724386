//! Block store abstraction
//!
//! The store owns block bytes. Alongside plain CID-addressed blocks it keeps
//! a per-dataset index: `put_cid_and_proof` records `(tree_cid, index) ->
//! (cid, proof)` so dataset blocks can be addressed by position, plus TTL
//! metadata per indexed block. Quota is accounted at put time; re-putting an
//! existing block is a no-op and never counts twice.
//!
//! Backends: [`MemoryStore`] here, and the durable RocksDB repository in
//! [`crate::repo`].

use async_trait::async_trait;
use bytes::Bytes;
use cid::Cid;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::time::SystemTime;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::block::{Block, BlockError};
use crate::cid::is_manifest;
use crate::merkle::MerkleProof;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Block not found: {0}")]
    NotFound(String),

    #[error("Storage quota exceeded: {used} bytes used + {incoming} incoming > {max} max")]
    QuotaExceeded { used: u64, incoming: u64, max: u64 },

    #[error("I/O failure: {0}")]
    Io(String),

    #[error("Invalid block: {0}")]
    InvalidBlock(#[from] BlockError),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Which blocks `list_blocks` yields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    All,
    Manifests,
}

/// Storage accounting snapshot for the space endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpaceReport {
    pub total_blocks: u64,
    pub quota_max_bytes: u64,
    pub quota_used_bytes: u64,
    pub quota_reserved_bytes: u64,
}

/// Capability interface over block repositories.
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Store a block. Idempotent: an identical CID is a no-op and does not
    /// count against quota twice.
    async fn put(&self, block: Block) -> Result<()>;

    /// Fetch a block by CID, verifying bytes against the CID on the way out.
    async fn get(&self, cid: &Cid) -> Result<Block>;

    /// Fetch a dataset block by `(tree_cid, index)`.
    async fn get_indexed(&self, tree_cid: &Cid, index: u64) -> Result<Block>;

    async fn has(&self, cid: &Cid) -> Result<bool>;

    /// Delete a block. Deleting an absent CID succeeds.
    async fn delete(&self, cid: &Cid) -> Result<()>;

    /// Delete a dataset block and its index entry. Absent entries succeed.
    async fn delete_indexed(&self, tree_cid: &Cid, index: u64) -> Result<()>;

    /// Record the dataset index entry for a block together with its proof.
    async fn put_cid_and_proof(
        &self,
        tree_cid: &Cid,
        index: u64,
        cid: Cid,
        proof: MerkleProof,
    ) -> Result<()>;

    /// Look up the CID and proof recorded for `(tree_cid, index)`.
    async fn get_cid_and_proof(&self, tree_cid: &Cid, index: u64) -> Result<(Cid, MerkleProof)>;

    /// Enumerate stored CIDs. Snapshot semantics: every yielded CID was
    /// fetchable when the iterator was created, modulo concurrent deletes.
    async fn list_blocks(&self, kind: ListKind) -> Result<BoxStream<'static, Cid>>;

    /// Update TTL metadata for an indexed block.
    async fn ensure_expiry(&self, tree_cid: &Cid, index: u64, expiry: SystemTime) -> Result<()>;

    async fn total_blocks(&self) -> Result<u64>;

    fn quota_max_bytes(&self) -> u64;

    async fn quota_used_bytes(&self) -> Result<u64>;

    async fn quota_reserved_bytes(&self) -> Result<u64>;

    async fn space(&self) -> Result<SpaceReport> {
        Ok(SpaceReport {
            total_blocks: self.total_blocks().await?,
            quota_max_bytes: self.quota_max_bytes(),
            quota_used_bytes: self.quota_used_bytes().await?,
            quota_reserved_bytes: self.quota_reserved_bytes().await?,
        })
    }
}

#[derive(Default)]
struct MemoryState {
    blocks: HashMap<Cid, Bytes>,
    index: HashMap<(Cid, u64), (Cid, MerkleProof)>,
    expiry: HashMap<(Cid, u64), SystemTime>,
    used: u64,
    reserved: u64,
}

/// In-memory block store. Backs tests and ephemeral nodes.
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    quota_max: u64,
}

impl MemoryStore {
    /// Unlimited quota.
    pub fn new() -> Self {
        Self::with_quota(0)
    }

    /// `quota_max` of 0 means unlimited.
    pub fn with_quota(quota_max: u64) -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
            quota_max,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlockStore for MemoryStore {
    async fn put(&self, block: Block) -> Result<()> {
        let mut state = self.state.write().await;
        if state.blocks.contains_key(&block.cid) {
            debug!(cid = %block.cid, "block already stored");
            return Ok(());
        }

        let size = block.size() as u64;
        if self.quota_max > 0 && state.used + state.reserved + size > self.quota_max {
            return Err(StoreError::QuotaExceeded {
                used: state.used,
                incoming: size,
                max: self.quota_max,
            });
        }

        state.blocks.insert(block.cid, block.data);
        state.used += size;
        Ok(())
    }

    async fn get(&self, cid: &Cid) -> Result<Block> {
        let state = self.state.read().await;
        let data = state
            .blocks
            .get(cid)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(cid.to_string()))?;
        Ok(Block::verified(*cid, data)?)
    }

    async fn get_indexed(&self, tree_cid: &Cid, index: u64) -> Result<Block> {
        let cid = {
            let state = self.state.read().await;
            state
                .index
                .get(&(*tree_cid, index))
                .map(|(cid, _)| *cid)
                .ok_or_else(|| StoreError::NotFound(format!("{}/{}", tree_cid, index)))?
        };
        self.get(&cid).await
    }

    async fn has(&self, cid: &Cid) -> Result<bool> {
        Ok(self.state.read().await.blocks.contains_key(cid))
    }

    async fn delete(&self, cid: &Cid) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(data) = state.blocks.remove(cid) {
            state.used = state.used.saturating_sub(data.len() as u64);
        }
        Ok(())
    }

    async fn delete_indexed(&self, tree_cid: &Cid, index: u64) -> Result<()> {
        let removed = {
            let mut state = self.state.write().await;
            state.expiry.remove(&(*tree_cid, index));
            state.index.remove(&(*tree_cid, index))
        };
        if let Some((cid, _)) = removed {
            self.delete(&cid).await?;
        }
        Ok(())
    }

    async fn put_cid_and_proof(
        &self,
        tree_cid: &Cid,
        index: u64,
        cid: Cid,
        proof: MerkleProof,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        state.index.insert((*tree_cid, index), (cid, proof));
        Ok(())
    }

    async fn get_cid_and_proof(&self, tree_cid: &Cid, index: u64) -> Result<(Cid, MerkleProof)> {
        let state = self.state.read().await;
        state
            .index
            .get(&(*tree_cid, index))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("{}/{}", tree_cid, index)))
    }

    async fn list_blocks(&self, kind: ListKind) -> Result<BoxStream<'static, Cid>> {
        let snapshot: Vec<Cid> = {
            let state = self.state.read().await;
            state
                .blocks
                .keys()
                .filter(|cid| match kind {
                    ListKind::All => true,
                    ListKind::Manifests => is_manifest(cid),
                })
                .copied()
                .collect()
        };
        Ok(stream::iter(snapshot).boxed())
    }

    async fn ensure_expiry(&self, tree_cid: &Cid, index: u64, expiry: SystemTime) -> Result<()> {
        let mut state = self.state.write().await;
        state.expiry.insert((*tree_cid, index), expiry);
        Ok(())
    }

    async fn total_blocks(&self) -> Result<u64> {
        Ok(self.state.read().await.blocks.len() as u64)
    }

    fn quota_max_bytes(&self) -> u64 {
        self.quota_max
    }

    async fn quota_used_bytes(&self) -> Result<u64> {
        Ok(self.state.read().await.used)
    }

    async fn quota_reserved_bytes(&self) -> Result<u64> {
        Ok(self.state.read().await.reserved)
    }
}
