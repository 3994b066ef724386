//! Node engine
//!
//! Ties the chunker, Merkle machinery, block store and block exchange into
//! the four dataset operations: store a stream, retrieve a stream, prefetch
//! in sliding-window batches, and delete. The engine is single-threaded
//! cooperative: every operation is an async task on the caller's runtime,
//! and long-running background work is tracked in a task set so `stop` can
//! cancel it deterministically.

use bytes::Bytes;
use ::cid::Cid;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::block::{Block, BlockError};
use crate::chunker::Chunker;
use crate::cid::{self, CidError};
use crate::exchange::{BlockExchange, ExchangeError};
use crate::manifest::{Manifest, ManifestError, DEFAULT_BLOCK_SIZE};
use crate::merkle::{CompressorId, MerkleError, MerkleTree, Node, OFFLOAD_THRESHOLD};
use crate::store::{BlockStore, ListKind, SpaceReport, StoreError};

/// Default sliding-window size for batched fetches.
pub const DEFAULT_BATCH_SIZE: usize = 1024;

/// Hard cap on blocks handed to a single `on_batch` call.
pub const MAX_ON_BATCH_BLOCKS: usize = 128;

/// Dataset deletion yields to the scheduler after this much accumulated work.
const DELETE_YIELD_EVERY: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not a manifest CID: {0}")]
    NotAManifest(Cid),

    #[error("{failed} blocks failed to fetch")]
    BlocksFailed { failed: usize },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Network failure: {0}")]
    Network(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Merkle(#[from] MerkleError),

    #[error(transparent)]
    Block(#[from] BlockError),

    #[error(transparent)]
    Cid(#[from] CidError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Per-block callback fired as `store` writes blocks.
pub type OnBlockStored<'a> = Box<dyn FnMut(&[u8]) + Send + 'a>;

/// Batched-fetch callback; an error aborts the whole fetch.
pub type OnBatch<'a> = Box<dyn FnMut(&[Block]) -> Result<()> + Send + 'a>;

/// Options for storing a dataset.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub block_size: u32,
    pub filename: Option<String>,
    pub mimetype: Option<String>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            filename: None,
            mimetype: None,
        }
    }
}

/// Default TTL stamped on dataset blocks (30 days).
pub const DEFAULT_BLOCK_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// The node engine. Cheap to clone; clones share the store, exchange and
/// background task set.
#[derive(Clone)]
pub struct NodeEngine {
    store: Arc<dyn BlockStore>,
    exchange: Arc<dyn BlockExchange>,
    block_ttl: Duration,
    tasks: Arc<Mutex<JoinSet<()>>>,
}

impl NodeEngine {
    pub fn new(store: Arc<dyn BlockStore>, exchange: Arc<dyn BlockExchange>) -> Self {
        Self {
            store,
            exchange,
            block_ttl: DEFAULT_BLOCK_TTL,
            tasks: Arc::new(Mutex::new(JoinSet::new())),
        }
    }

    pub fn with_block_ttl(mut self, block_ttl: Duration) -> Self {
        self.block_ttl = block_ttl;
        self
    }

    pub fn store_handle(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    pub fn exchange_handle(&self) -> &Arc<dyn BlockExchange> {
        &self.exchange
    }

    /// Chunk `reader` into blocks, build the Merkle tree over the block
    /// hashes, persist per-index proofs, and publish the manifest.
    ///
    /// Blocks written before a failure are not rolled back; orphan collection
    /// is the repository's concern.
    pub async fn store<R>(
        &self,
        reader: R,
        opts: StoreOptions,
        mut on_block_stored: Option<OnBlockStored<'_>>,
    ) -> Result<Cid>
    where
        R: AsyncRead + Unpin,
    {
        if opts.block_size == 0 {
            return Err(EngineError::InvalidArgument(
                "block size must be non-zero".into(),
            ));
        }

        let mut chunker = Chunker::with_chunk_size(reader, opts.block_size as usize);
        let mut cids: Vec<Cid> = Vec::new();

        while let Some(chunk) = chunker.next_chunk().await? {
            let cid = cid::block_cid(&chunk)?;
            let block = Block::trusted(cid, chunk);
            self.store.put(block.clone()).await?;
            if let Some(cb) = on_block_stored.as_mut() {
                cb(&block.data);
            }
            cids.push(cid);
        }
        let dataset_size = chunker.offset();

        if cids.is_empty() {
            return Err(EngineError::InvalidArgument("empty dataset".into()));
        }

        let leaves: Vec<Node> = cids
            .iter()
            .map(|c| {
                let mut node = [0u8; 32];
                node.copy_from_slice(c.hash().digest());
                node
            })
            .collect();

        let tree = if leaves.len() >= OFFLOAD_THRESHOLD {
            MerkleTree::build_offloaded(leaves, CompressorId::Sha256).await?
        } else {
            MerkleTree::build(&leaves, CompressorId::Sha256)?
        };
        let tree_cid = tree.root_cid()?;

        let expiry = SystemTime::now() + self.block_ttl;
        for (index, block_cid) in cids.iter().enumerate() {
            let proof = tree.get_proof(index)?;
            self.store
                .put_cid_and_proof(&tree_cid, index as u64, *block_cid, proof)
                .await?;
            self.store
                .ensure_expiry(&tree_cid, index as u64, expiry)
                .await?;
        }

        let manifest = Manifest::new(
            tree_cid,
            dataset_size,
            opts.block_size,
            opts.filename,
            opts.mimetype,
        );
        let manifest_block = manifest.to_block()?;
        let manifest_cid = manifest_block.cid;
        self.store.put(manifest_block).await?;

        info!(cid = %manifest_cid, blocks = cids.len(), dataset_size, "stored dataset");
        Ok(manifest_cid)
    }

    /// Fetch and decode a manifest, reaching to the network when the block
    /// is not local. Rejects non-manifest CIDs.
    pub async fn fetch_manifest(&self, cid: &Cid) -> Result<Manifest> {
        self.manifest_at(cid, false).await
    }

    async fn manifest_at(&self, cid: &Cid, local_only: bool) -> Result<Manifest> {
        if !cid::is_manifest(cid) {
            return Err(EngineError::NotAManifest(*cid));
        }
        let block = fetch_block_with(&self.store, &self.exchange, cid, local_only).await?;
        Ok(Manifest::from_block(&block)?)
    }

    /// Retrieve a dataset (or a single block) as a lazy byte stream.
    ///
    /// For manifests the stream yields block bytes in index order, truncating
    /// the final block so the total equals `dataset_size`. When `local` is
    /// false a background batched fetch warms the local store from peers
    /// while the stream is consumed.
    pub async fn retrieve(
        &self,
        cid: &Cid,
        local: bool,
    ) -> Result<BoxStream<'static, Result<Bytes>>> {
        if !cid::is_manifest(cid) {
            let block = fetch_block_with(&self.store, &self.exchange, cid, local).await?;
            return Ok(stream::once(async move { Ok::<_, EngineError>(block.data) }).boxed());
        }

        let manifest = self.manifest_at(cid, local).await?;

        if !local {
            let engine = self.clone();
            let warm = manifest.clone();
            self.tasks.lock().await.spawn(async move {
                if let Err(e) = engine
                    .fetch_batched_manifest(&warm, DEFAULT_BATCH_SIZE, None, false)
                    .await
                {
                    debug!(error = %e, "background dataset warm-up incomplete");
                }
            });
        }

        struct ReadState {
            store: Arc<dyn BlockStore>,
            exchange: Arc<dyn BlockExchange>,
            tree_cid: Cid,
            blocks_count: u64,
            index: u64,
            remaining: u64,
            local: bool,
        }

        let state = ReadState {
            store: self.store.clone(),
            exchange: self.exchange.clone(),
            tree_cid: manifest.tree_cid,
            blocks_count: manifest.blocks_count() as u64,
            index: 0,
            remaining: manifest.dataset_size,
            local,
        };

        Ok(stream::try_unfold(state, |mut st| async move {
            if st.index >= st.blocks_count || st.remaining == 0 {
                return Ok(None);
            }
            let block = fetch_indexed_with(
                &st.store,
                &st.exchange,
                &st.tree_cid,
                st.index,
                st.local,
            )
            .await?;

            let take = (block.data.len() as u64).min(st.remaining) as usize;
            let data = block.data.slice(..take);
            st.index += 1;
            st.remaining -= take as u64;
            Ok(Some((data, st)))
        })
        .boxed())
    }

    /// Sliding-window prefetch over a manifest's block indices.
    pub async fn fetch_batched_manifest(
        &self,
        manifest: &Manifest,
        batch_size: usize,
        on_batch: Option<OnBatch<'_>>,
        fetch_local: bool,
    ) -> Result<()> {
        self.fetch_batched(
            &manifest.tree_cid,
            0..manifest.blocks_count() as u64,
            batch_size,
            on_batch,
            fetch_local,
        )
        .await
    }

    /// Sliding-window prefetch over arbitrary block indices.
    ///
    /// Keeps up to `batch_size` requests in flight and consumes completions
    /// in completion order. Once `ceil(batch_size * 0.75)` requests of the
    /// current window complete, up to that many more are issued; indices
    /// skipped by the `fetch_local` filter are never issued and do not count.
    /// Completed blocks are buffered for `on_batch` in groups of at most
    /// `min(batch_size, 128)`; a single `on_batch` error fails the operation.
    /// Individual block failures are counted and reported at the end as an
    /// aggregate error; this layer never retries.
    pub async fn fetch_batched<I>(
        &self,
        tree_cid: &Cid,
        mut indices: I,
        batch_size: usize,
        mut on_batch: Option<OnBatch<'_>>,
        fetch_local: bool,
    ) -> Result<()>
    where
        I: Iterator<Item = u64> + Send,
    {
        if batch_size == 0 {
            return Err(EngineError::InvalidArgument(
                "batch size must be non-zero".into(),
            ));
        }

        let refill_threshold = (batch_size * 3).div_ceil(4);
        let refill_size = refill_threshold.max(1);
        let flush_size = batch_size.min(MAX_ON_BATCH_BLOCKS);

        let mut in_flight: FuturesUnordered<BoxFuture<'_, (u64, Result<Block>)>> =
            FuturesUnordered::new();
        self.issue_requests(&mut in_flight, &mut indices, tree_cid, batch_size, fetch_local)
            .await?;

        let mut completed_in_window = 0usize;
        let mut failed = 0usize;
        let mut buffer: Vec<Block> = Vec::new();

        while let Some((index, result)) = in_flight.next().await {
            match result {
                Ok(block) => {
                    if on_batch.is_some() {
                        buffer.push(block);
                        if buffer.len() >= flush_size {
                            if let Some(cb) = on_batch.as_mut() {
                                cb(&buffer)?;
                            }
                            buffer.clear();
                        }
                    }
                }
                Err(e) => {
                    failed += 1;
                    debug!(index, error = %e, "block fetch failed");
                }
            }

            completed_in_window += 1;
            if completed_in_window >= refill_threshold {
                self.issue_requests(
                    &mut in_flight,
                    &mut indices,
                    tree_cid,
                    refill_size,
                    fetch_local,
                )
                .await?;
                completed_in_window = 0;
            }
        }

        if !buffer.is_empty() {
            if let Some(cb) = on_batch.as_mut() {
                cb(&buffer)?;
            }
        }

        if failed > 0 {
            Err(EngineError::BlocksFailed { failed })
        } else {
            Ok(())
        }
    }

    async fn issue_requests<'a, I>(
        &'a self,
        in_flight: &mut FuturesUnordered<BoxFuture<'a, (u64, Result<Block>)>>,
        indices: &mut I,
        tree_cid: &Cid,
        limit: usize,
        fetch_local: bool,
    ) -> Result<()>
    where
        I: Iterator<Item = u64> + Send,
    {
        let mut issued = 0;
        while issued < limit {
            let Some(index) = indices.next() else { break };
            if !fetch_local && self.has_indexed_local(tree_cid, index).await? {
                continue;
            }
            let tree = *tree_cid;
            in_flight.push(Box::pin(async move {
                (
                    index,
                    fetch_indexed_with(&self.store, &self.exchange, &tree, index, false).await,
                )
            }));
            issued += 1;
        }
        Ok(())
    }

    async fn has_indexed_local(&self, tree_cid: &Cid, index: u64) -> Result<bool> {
        match self.store.get_cid_and_proof(tree_cid, index).await {
            Ok((cid, _)) => Ok(self.store.has(&cid).await?),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a block, or a whole dataset when `cid` names a manifest.
    ///
    /// Dataset deletion tolerates missing blocks and yields to the scheduler
    /// every 100 ms of accumulated work; the first unexpected error is
    /// reported after the sweep finishes.
    pub async fn delete(&self, cid: &Cid) -> Result<()> {
        if !cid::is_manifest(cid) {
            return Ok(self.store.delete(cid).await?);
        }

        if !self.store.has(cid).await? {
            return Ok(());
        }

        let manifest = Manifest::from_block(&self.store.get(cid).await?)?;
        let mut first_error: Option<EngineError> = None;
        let mut last_yield = Instant::now();

        for index in 0..manifest.blocks_count() as u64 {
            if let Err(e) = self.store.delete_indexed(&manifest.tree_cid, index).await {
                warn!(index, error = %e, "dataset block deletion failed");
                if first_error.is_none() {
                    first_error = Some(e.into());
                }
            }
            if last_yield.elapsed() >= DELETE_YIELD_EVERY {
                tokio::task::yield_now().await;
                last_yield = Instant::now();
            }
        }

        self.store.delete(cid).await?;
        info!(cid = %cid, blocks = manifest.blocks_count(), "deleted dataset");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Decode every stored manifest and hand it to `callback`.
    pub async fn iterate_manifests<F>(&self, mut callback: F) -> Result<()>
    where
        F: FnMut(&Cid, &Manifest) + Send,
    {
        let mut cids = self.store.list_blocks(ListKind::Manifests).await?;
        while let Some(cid) = cids.next().await {
            match self.store.get(&cid).await {
                Ok(block) => match Manifest::from_block(&block) {
                    Ok(manifest) => callback(&cid, &manifest),
                    Err(e) => warn!(cid = %cid, error = %e, "skipping undecodable manifest"),
                },
                // Deleted between snapshot and fetch.
                Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Fetch a single block by CID; `local` restricts to the local store.
    pub async fn block_by_cid(&self, cid: &Cid, local: bool) -> Result<Block> {
        fetch_block_with(&self.store, &self.exchange, cid, local).await
    }

    /// Fetch a dataset block by position; `local` restricts to the local
    /// store.
    pub async fn block_at(&self, tree_cid: &Cid, index: u64, local: bool) -> Result<Block> {
        fetch_indexed_with(&self.store, &self.exchange, tree_cid, index, local).await
    }

    /// Local-store presence check; never touches the network.
    pub async fn has_local_block(&self, cid: &Cid) -> Result<bool> {
        Ok(self.store.has(cid).await?)
    }

    /// Fetch a dataset from the network into the local store, in the
    /// background. Returns once the manifest itself is available.
    pub async fn prefetch(&self, cid: &Cid) -> Result<Manifest> {
        let manifest = self.fetch_manifest(cid).await?;
        let engine = self.clone();
        let warm = manifest.clone();
        self.tasks.lock().await.spawn(async move {
            match engine
                .fetch_batched_manifest(&warm, DEFAULT_BATCH_SIZE, None, false)
                .await
            {
                Ok(()) => debug!(tree = %warm.tree_cid, "dataset prefetch complete"),
                Err(e) => warn!(tree = %warm.tree_cid, error = %e, "dataset prefetch failed"),
            }
        });
        Ok(manifest)
    }

    pub async fn space(&self) -> Result<SpaceReport> {
        Ok(self.store.space().await?)
    }

    /// Cancel tracked background work and wait for it to wind down.
    pub async fn stop(&self) {
        let mut tasks = self.tasks.lock().await;
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
}

/// Fetch a block by CID, falling back to the exchange unless `local_only`.
async fn fetch_block_with(
    store: &Arc<dyn BlockStore>,
    exchange: &Arc<dyn BlockExchange>,
    cid: &Cid,
    local_only: bool,
) -> Result<Block> {
    match store.get(cid).await {
        Ok(block) => Ok(block),
        Err(StoreError::NotFound(missing)) => {
            if local_only {
                return Err(EngineError::NotFound(missing));
            }
            let fetched = map_exchange(exchange.want_block(cid).await)?;
            let block = Block::verified(*cid, fetched.data)?;
            store.put(block.clone()).await?;
            Ok(block)
        }
        Err(e) => Err(e.into()),
    }
}

/// Fetch a dataset block by position, falling back to the exchange unless
/// `local_only`.
async fn fetch_indexed_with(
    store: &Arc<dyn BlockStore>,
    exchange: &Arc<dyn BlockExchange>,
    tree_cid: &Cid,
    index: u64,
    local_only: bool,
) -> Result<Block> {
    match store.get_indexed(tree_cid, index).await {
        Ok(block) => Ok(block),
        Err(StoreError::NotFound(missing)) => {
            if local_only {
                return Err(EngineError::NotFound(missing));
            }
            let block = map_exchange(exchange.want_block_indexed(tree_cid, index).await)?;
            let block = Block::verified(block.cid, block.data)?;
            store.put(block.clone()).await?;
            Ok(block)
        }
        Err(e) => Err(e.into()),
    }
}

fn map_exchange(result: std::result::Result<Block, ExchangeError>) -> Result<Block> {
    result.map_err(|e| match e {
        ExchangeError::NotFound(s) => EngineError::NotFound(s),
        ExchangeError::Network(s) => EngineError::Network(s),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::OfflineExchange;
    use crate::identity::NodeIdentity;
    use crate::store::MemoryStore;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    async fn test_engine() -> (NodeEngine, TempDir) {
        let dir = TempDir::new().unwrap();
        let identity = NodeIdentity::load_or_create(&dir.path().join("node")).unwrap();
        let store: Arc<dyn BlockStore> = Arc::new(MemoryStore::new());
        let exchange: Arc<dyn BlockExchange> = Arc::new(OfflineExchange::new(&identity, &[]));
        (NodeEngine::new(store, exchange), dir)
    }

    async fn drain(mut stream: BoxStream<'static, Result<Bytes>>) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    fn opts(block_size: u32) -> StoreOptions {
        StoreOptions {
            block_size,
            ..StoreOptions::default()
        }
    }

    #[tokio::test]
    async fn test_store_retrieve_roundtrip() {
        let (engine, _dir) = test_engine().await;

        for (len, block_size) in [
            (12usize, 65536u32),
            (1024, 1024),
            (1025, 512),
            (200_000, 65536),
            (1, 1),
        ] {
            let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let manifest_cid = engine
                .store(Cursor::new(data.clone()), opts(block_size), None)
                .await
                .unwrap();
            assert!(cid::is_manifest(&manifest_cid));

            let stream = engine.retrieve(&manifest_cid, true).await.unwrap();
            assert_eq!(drain(stream).await, data, "len={} bs={}", len, block_size);
        }
    }

    #[tokio::test]
    async fn test_store_records_metadata() {
        let (engine, _dir) = test_engine().await;
        let manifest_cid = engine
            .store(
                Cursor::new(b"Hello World!".to_vec()),
                StoreOptions {
                    block_size: 65536,
                    filename: Some("hello_world.txt".into()),
                    mimetype: Some("text/plain".into()),
                },
                None,
            )
            .await
            .unwrap();

        let manifest = engine.fetch_manifest(&manifest_cid).await.unwrap();
        assert_eq!(manifest.dataset_size, 12);
        assert_eq!(manifest.block_size, 65536);
        assert_eq!(manifest.filename.as_deref(), Some("hello_world.txt"));
        assert_eq!(manifest.mimetype.as_deref(), Some("text/plain"));
        assert_eq!(manifest.blocks_count(), 1);
    }

    #[tokio::test]
    async fn test_store_fires_block_callback() {
        let (engine, _dir) = test_engine().await;
        let stored = AtomicUsize::new(0);
        let data = vec![7u8; 5000];

        engine
            .store(
                Cursor::new(data),
                opts(1024),
                Some(Box::new(|chunk: &[u8]| {
                    stored.fetch_add(chunk.len(), Ordering::SeqCst);
                })),
            )
            .await
            .unwrap();

        assert_eq!(stored.load(Ordering::SeqCst), 5000);
    }

    #[tokio::test]
    async fn test_store_rejects_empty_and_zero_block_size() {
        let (engine, _dir) = test_engine().await;

        let empty = engine
            .store(Cursor::new(Vec::new()), opts(1024), None)
            .await;
        assert!(matches!(empty, Err(EngineError::InvalidArgument(_))));

        let zero = engine
            .store(Cursor::new(b"data".to_vec()), opts(0), None)
            .await;
        assert!(matches!(zero, Err(EngineError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_fetch_manifest_rejects_non_manifest() {
        let (engine, _dir) = test_engine().await;
        let block_cid = cid::block_cid(b"raw").unwrap();
        assert!(matches!(
            engine.fetch_manifest(&block_cid).await,
            Err(EngineError::NotAManifest(_))
        ));
    }

    #[tokio::test]
    async fn test_retrieve_single_block() {
        let (engine, _dir) = test_engine().await;
        let block = Block::new(&b"standalone block"[..]).unwrap();
        engine.store_handle().put(block.clone()).await.unwrap();

        let stream = engine.retrieve(&block.cid, true).await.unwrap();
        assert_eq!(drain(stream).await, b"standalone block");
    }

    #[tokio::test]
    async fn test_delete_dataset() {
        let (engine, _dir) = test_engine().await;
        let data = vec![9u8; 10_000];
        let manifest_cid = engine
            .store(Cursor::new(data), opts(1024), None)
            .await
            .unwrap();
        let manifest = engine.fetch_manifest(&manifest_cid).await.unwrap();

        // Remember a leaf CID to check it goes away with the dataset.
        let (leaf_cid, _) = engine
            .store_handle()
            .get_cid_and_proof(&manifest.tree_cid, 0)
            .await
            .unwrap();

        engine.delete(&manifest_cid).await.unwrap();

        assert!(!engine.has_local_block(&manifest_cid).await.unwrap());
        assert!(!engine.has_local_block(&leaf_cid).await.unwrap());
        assert_eq!(engine.store_handle().total_blocks().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_absent_manifest_is_ok() {
        let (engine, _dir) = test_engine().await;
        let manifest = Manifest::new(
            cid::dataset_root_cid(cid::SHA256_CODEC, &[3; 32]).unwrap(),
            10,
            10,
            None,
            None,
        );
        let absent_cid = manifest.to_block().unwrap().cid;
        engine.delete(&absent_cid).await.unwrap();
    }

    #[tokio::test]
    async fn test_fetch_batched_invariants() {
        let (engine, _dir) = test_engine().await;
        // 300 one-byte-block leaves keeps the arithmetic visible.
        let data = vec![5u8; 300];
        let manifest_cid = engine.store(Cursor::new(data), opts(1), None).await.unwrap();
        let manifest = engine.fetch_manifest(&manifest_cid).await.unwrap();

        let mut calls = Vec::new();
        engine
            .fetch_batched_manifest(
                &manifest,
                DEFAULT_BATCH_SIZE,
                Some(Box::new(|blocks: &[Block]| {
                    calls.push(blocks.len());
                    Ok(())
                })),
                true,
            )
            .await
            .unwrap();

        let total: usize = calls.iter().sum();
        assert_eq!(total, 300);
        assert!(calls.iter().all(|&n| n <= MAX_ON_BATCH_BLOCKS));
        assert!(calls.iter().any(|&n| n == MAX_ON_BATCH_BLOCKS));
    }

    #[tokio::test]
    async fn test_fetch_batched_on_batch_error_aborts() {
        let (engine, _dir) = test_engine().await;
        let data = vec![1u8; 400];
        let manifest_cid = engine.store(Cursor::new(data), opts(1), None).await.unwrap();
        let manifest = engine.fetch_manifest(&manifest_cid).await.unwrap();

        let calls = AtomicUsize::new(0);
        let result = engine
            .fetch_batched_manifest(
                &manifest,
                DEFAULT_BATCH_SIZE,
                Some(Box::new(|_: &[Block]| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(EngineError::Internal("sink full".into()))
                })),
                true,
            )
            .await;

        assert!(matches!(result, Err(EngineError::Internal(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fetch_batched_counts_failed_blocks() {
        let (engine, _dir) = test_engine().await;
        // Distinct block contents so every index maps to its own CID.
        let data: Vec<u8> = (0..64).map(|i| i as u8).collect();
        let manifest_cid = engine.store(Cursor::new(data), opts(8), None).await.unwrap();
        let manifest = engine.fetch_manifest(&manifest_cid).await.unwrap();

        // Drop two dataset blocks; the offline exchange cannot recover them.
        engine
            .store_handle()
            .delete_indexed(&manifest.tree_cid, 1)
            .await
            .unwrap();
        engine
            .store_handle()
            .delete_indexed(&manifest.tree_cid, 5)
            .await
            .unwrap();

        let result = engine
            .fetch_batched_manifest(&manifest, 4, None, true)
            .await;
        match result {
            Err(EngineError::BlocksFailed { failed }) => assert_eq!(failed, 2),
            other => panic!("expected BlocksFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_batched_skips_local_when_asked() {
        let (engine, _dir) = test_engine().await;
        let data = vec![3u8; 100];
        let manifest_cid = engine.store(Cursor::new(data), opts(10), None).await.unwrap();
        let manifest = engine.fetch_manifest(&manifest_cid).await.unwrap();

        // Everything is local, so with the filter on nothing is issued and
        // on_batch never fires.
        let calls = AtomicUsize::new(0);
        engine
            .fetch_batched_manifest(
                &manifest,
                4,
                Some(Box::new(|_: &[Block]| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })),
                false,
            )
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_iterate_manifests() {
        let (engine, _dir) = test_engine().await;
        for i in 0..3u8 {
            engine
                .store(Cursor::new(vec![i; 100]), opts(50), None)
                .await
                .unwrap();
        }

        let mut seen = 0;
        engine
            .iterate_manifests(|cid, manifest| {
                assert!(cid::is_manifest(cid));
                assert_eq!(manifest.dataset_size, 100);
                seen += 1;
            })
            .await
            .unwrap();
        assert_eq!(seen, 3);
    }

    #[tokio::test]
    async fn test_stop_cancels_background_tasks() {
        let (engine, _dir) = test_engine().await;
        engine.tasks.lock().await.spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        engine.stop().await;
        assert!(engine.tasks.lock().await.is_empty());
    }
}
