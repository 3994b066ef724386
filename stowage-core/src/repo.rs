//! Durable block repository backed by RocksDB
//!
//! Column families:
//! - `blocks`: CID bytes -> raw block bytes
//! - `dataset-index`: tree CID bytes ++ big-endian index -> length-prefixed
//!   block CID ++ encoded proof
//! - `ttl`: same composite key -> unix expiry seconds
//! - `meta`: accounting counters (`quota-used`, `quota-reserved`,
//!   `total-blocks`)
//!
//! RocksDB calls are blocking, so every operation hops to the blocking pool.
//! Mutations take the store's write lock first; counter updates stay
//! consistent with the key writes they describe.

use async_trait::async_trait;
use cid::Cid;
use futures::stream::{self, BoxStream, StreamExt};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, DB};
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::debug;

use crate::block::Block;
use crate::cid::is_manifest;
use crate::merkle::MerkleProof;
use crate::store::{BlockStore, ListKind, Result, StoreError};

const CF_BLOCKS: &str = "blocks";
const CF_INDEX: &str = "dataset-index";
const CF_TTL: &str = "ttl";
const CF_META: &str = "meta";

const KEY_QUOTA_USED: &[u8] = b"quota-used";
const KEY_QUOTA_RESERVED: &[u8] = b"quota-reserved";
const KEY_TOTAL_BLOCKS: &[u8] = b"total-blocks";

/// RocksDB-backed [`BlockStore`], durable across restarts.
pub struct RepoStore {
    db: Arc<DB>,
    quota_max: u64,
    write_lock: Mutex<()>,
}

fn io_err(e: rocksdb::Error) -> StoreError {
    StoreError::Io(e.to_string())
}

fn join_err(e: tokio::task::JoinError) -> StoreError {
    StoreError::Io(format!("blocking task failed: {}", e))
}

fn cf<'a>(db: &'a DB, name: &str) -> Result<&'a ColumnFamily> {
    db.cf_handle(name)
        .ok_or_else(|| StoreError::Io(format!("missing column family '{}'", name)))
}

fn index_key(tree_cid: &Cid, index: u64) -> Vec<u8> {
    let mut key = tree_cid.to_bytes();
    key.extend_from_slice(&index.to_be_bytes());
    key
}

fn read_counter(db: &DB, name: &[u8]) -> Result<u64> {
    let meta = cf(db, CF_META)?;
    let value = db.get_cf(meta, name).map_err(io_err)?;
    Ok(value
        .and_then(|v| v.get(..8).map(|b| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(b);
            u64::from_le_bytes(buf)
        }))
        .unwrap_or(0))
}

fn write_counter(batch: &mut WriteBatch, meta: &ColumnFamily, name: &[u8], value: u64) {
    batch.put_cf(meta, name, value.to_le_bytes());
}

impl RepoStore {
    /// Open (or create) the repository at `path`. `quota_max` of 0 means
    /// unlimited.
    pub fn open(path: impl AsRef<Path>, quota_max: u64) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cfs = [CF_BLOCKS, CF_INDEX, CF_TTL, CF_META]
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&opts, path.as_ref(), cfs).map_err(io_err)?;
        debug!(path = %path.as_ref().display(), "opened block repository");

        Ok(Self {
            db: Arc::new(db),
            quota_max,
            write_lock: Mutex::new(()),
        })
    }

    async fn read_counter_async(&self, name: &'static [u8]) -> Result<u64> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || read_counter(&db, name))
            .await
            .map_err(join_err)?
    }

    /// Delete a block key and roll the counters back, inside one batch.
    fn delete_block_locked(db: &DB, batch: &mut WriteBatch, cid: &Cid) -> Result<()> {
        let blocks = cf(db, CF_BLOCKS)?;
        let key = cid.to_bytes();
        if let Some(data) = db.get_cf(blocks, &key).map_err(io_err)? {
            batch.delete_cf(blocks, &key);
            let meta = cf(db, CF_META)?;
            let used = read_counter(db, KEY_QUOTA_USED)?.saturating_sub(data.len() as u64);
            let total = read_counter(db, KEY_TOTAL_BLOCKS)?.saturating_sub(1);
            write_counter(batch, meta, KEY_QUOTA_USED, used);
            write_counter(batch, meta, KEY_TOTAL_BLOCKS, total);
        }
        Ok(())
    }
}

#[async_trait]
impl BlockStore for RepoStore {
    async fn put(&self, block: Block) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let db = self.db.clone();
        let quota_max = self.quota_max;

        tokio::task::spawn_blocking(move || {
            let blocks = cf(&db, CF_BLOCKS)?;
            let key = block.cid.to_bytes();
            if db.get_cf(blocks, &key).map_err(io_err)?.is_some() {
                debug!(cid = %block.cid, "block already stored");
                return Ok(());
            }

            let size = block.size() as u64;
            let used = read_counter(&db, KEY_QUOTA_USED)?;
            let reserved = read_counter(&db, KEY_QUOTA_RESERVED)?;
            if quota_max > 0 && used + reserved + size > quota_max {
                return Err(StoreError::QuotaExceeded {
                    used,
                    incoming: size,
                    max: quota_max,
                });
            }

            let meta = cf(&db, CF_META)?;
            let total = read_counter(&db, KEY_TOTAL_BLOCKS)?;
            let mut batch = WriteBatch::default();
            batch.put_cf(blocks, &key, &block.data);
            write_counter(&mut batch, meta, KEY_QUOTA_USED, used + size);
            write_counter(&mut batch, meta, KEY_TOTAL_BLOCKS, total + 1);
            db.write(batch).map_err(io_err)
        })
        .await
        .map_err(join_err)?
    }

    async fn get(&self, cid: &Cid) -> Result<Block> {
        let db = self.db.clone();
        let claimed = *cid;
        let data = tokio::task::spawn_blocking(move || {
            let blocks = cf(&db, CF_BLOCKS)?;
            db.get_cf(blocks, claimed.to_bytes()).map_err(io_err)
        })
        .await
        .map_err(join_err)??
        .ok_or_else(|| StoreError::NotFound(cid.to_string()))?;

        Ok(Block::verified(claimed, data)?)
    }

    async fn get_indexed(&self, tree_cid: &Cid, index: u64) -> Result<Block> {
        let (cid, _) = self.get_cid_and_proof(tree_cid, index).await?;
        self.get(&cid).await
    }

    async fn has(&self, cid: &Cid) -> Result<bool> {
        let db = self.db.clone();
        let key = cid.to_bytes();
        tokio::task::spawn_blocking(move || {
            let blocks = cf(&db, CF_BLOCKS)?;
            Ok(db.get_cf(blocks, &key).map_err(io_err)?.is_some())
        })
        .await
        .map_err(join_err)?
    }

    async fn delete(&self, cid: &Cid) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let db = self.db.clone();
        let cid = *cid;
        tokio::task::spawn_blocking(move || {
            let mut batch = WriteBatch::default();
            Self::delete_block_locked(&db, &mut batch, &cid)?;
            db.write(batch).map_err(io_err)
        })
        .await
        .map_err(join_err)?
    }

    async fn delete_indexed(&self, tree_cid: &Cid, index: u64) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let db = self.db.clone();
        let key = index_key(tree_cid, index);
        tokio::task::spawn_blocking(move || {
            let index_cf = cf(&db, CF_INDEX)?;
            let ttl = cf(&db, CF_TTL)?;
            let mut batch = WriteBatch::default();

            if let Some(value) = db.get_cf(index_cf, &key).map_err(io_err)? {
                if let Ok((cid, _)) = decode_index_value(&value) {
                    Self::delete_block_locked(&db, &mut batch, &cid)?;
                }
                batch.delete_cf(index_cf, &key);
                batch.delete_cf(ttl, &key);
            }

            db.write(batch).map_err(io_err)
        })
        .await
        .map_err(join_err)?
    }

    async fn put_cid_and_proof(
        &self,
        tree_cid: &Cid,
        index: u64,
        cid: Cid,
        proof: MerkleProof,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let db = self.db.clone();
        let key = index_key(tree_cid, index);
        tokio::task::spawn_blocking(move || {
            let index_cf = cf(&db, CF_INDEX)?;
            db.put_cf(index_cf, &key, encode_index_value(&cid, &proof))
                .map_err(io_err)
        })
        .await
        .map_err(join_err)?
    }

    async fn get_cid_and_proof(&self, tree_cid: &Cid, index: u64) -> Result<(Cid, MerkleProof)> {
        let db = self.db.clone();
        let key = index_key(tree_cid, index);
        let missing = format!("{}/{}", tree_cid, index);
        let value = tokio::task::spawn_blocking(move || {
            let index_cf = cf(&db, CF_INDEX)?;
            db.get_cf(index_cf, &key).map_err(io_err)
        })
        .await
        .map_err(join_err)??
        .ok_or(StoreError::NotFound(missing))?;

        decode_index_value(&value)
    }

    async fn list_blocks(&self, kind: ListKind) -> Result<BoxStream<'static, Cid>> {
        let db = self.db.clone();
        let snapshot = tokio::task::spawn_blocking(move || {
            let blocks = cf(&db, CF_BLOCKS)?;
            let mut cids = Vec::new();
            for entry in db.iterator_cf(blocks, IteratorMode::Start) {
                let (key, _) = entry.map_err(io_err)?;
                if let Ok(cid) = Cid::try_from(key.as_ref()) {
                    let keep = match kind {
                        ListKind::All => true,
                        ListKind::Manifests => is_manifest(&cid),
                    };
                    if keep {
                        cids.push(cid);
                    }
                }
            }
            Ok::<_, StoreError>(cids)
        })
        .await
        .map_err(join_err)??;

        Ok(stream::iter(snapshot).boxed())
    }

    async fn ensure_expiry(&self, tree_cid: &Cid, index: u64, expiry: SystemTime) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let db = self.db.clone();
        let key = index_key(tree_cid, index);
        let secs = expiry
            .duration_since(UNIX_EPOCH)
            .map_err(|e| StoreError::Io(format!("expiry before epoch: {}", e)))?
            .as_secs();
        tokio::task::spawn_blocking(move || {
            let ttl = cf(&db, CF_TTL)?;
            db.put_cf(ttl, &key, secs.to_le_bytes()).map_err(io_err)
        })
        .await
        .map_err(join_err)?
    }

    async fn total_blocks(&self) -> Result<u64> {
        self.read_counter_async(KEY_TOTAL_BLOCKS).await
    }

    fn quota_max_bytes(&self) -> u64 {
        self.quota_max
    }

    async fn quota_used_bytes(&self) -> Result<u64> {
        self.read_counter_async(KEY_QUOTA_USED).await
    }

    async fn quota_reserved_bytes(&self) -> Result<u64> {
        self.read_counter_async(KEY_QUOTA_RESERVED).await
    }
}

fn encode_index_value(cid: &Cid, proof: &MerkleProof) -> Vec<u8> {
    let cid_bytes = cid.to_bytes();
    let proof_bytes = proof.to_bytes();
    let mut value = Vec::with_capacity(4 + cid_bytes.len() + proof_bytes.len());
    value.extend_from_slice(&(cid_bytes.len() as u32).to_le_bytes());
    value.extend_from_slice(&cid_bytes);
    value.extend_from_slice(&proof_bytes);
    value
}

fn decode_index_value(value: &[u8]) -> Result<(Cid, MerkleProof)> {
    let malformed = |what: &str| StoreError::Io(format!("malformed index entry: {}", what));

    let len_bytes = value.get(..4).ok_or_else(|| malformed("length prefix"))?;
    let mut buf = [0u8; 4];
    buf.copy_from_slice(len_bytes);
    let cid_len = u32::from_le_bytes(buf) as usize;

    let cid_bytes = value
        .get(4..4 + cid_len)
        .ok_or_else(|| malformed("CID bytes"))?;
    let cid = Cid::try_from(cid_bytes).map_err(|e| malformed(&format!("CID: {}", e)))?;

    let proof = MerkleProof::from_bytes(&value[4 + cid_len..])
        .map_err(|e| malformed(&format!("proof: {}", e)))?;

    Ok((cid, proof))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merkle::{CompressorId, MerkleTree};
    use tempfile::TempDir;

    fn tree_cid_and_proof(block: &Block) -> (Cid, MerkleProof) {
        let mut leaf = [0u8; 32];
        leaf.copy_from_slice(block.cid.hash().digest());
        let tree = MerkleTree::build(&[leaf], CompressorId::Sha256).unwrap();
        (tree.root_cid().unwrap(), tree.get_proof(0).unwrap())
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = RepoStore::open(dir.path(), 0).unwrap();

        let block = Block::new(&b"persist me"[..]).unwrap();
        store.put(block.clone()).await.unwrap();

        assert_eq!(store.get(&block.cid).await.unwrap(), block);
        assert!(store.has(&block.cid).await.unwrap());
    }

    #[tokio::test]
    async fn test_durable_across_reopen() {
        let dir = TempDir::new().unwrap();
        let block = Block::new(&b"survives restart"[..]).unwrap();

        {
            let store = RepoStore::open(dir.path(), 0).unwrap();
            store.put(block.clone()).await.unwrap();
        }

        let store = RepoStore::open(dir.path(), 0).unwrap();
        assert_eq!(store.get(&block.cid).await.unwrap(), block);
        assert_eq!(store.total_blocks().await.unwrap(), 1);
        assert_eq!(
            store.quota_used_bytes().await.unwrap(),
            block.size() as u64
        );
    }

    #[tokio::test]
    async fn test_idempotent_put_counts_once() {
        let dir = TempDir::new().unwrap();
        let store = RepoStore::open(dir.path(), 0).unwrap();

        let block = Block::new(&b"only once"[..]).unwrap();
        store.put(block.clone()).await.unwrap();
        store.put(block.clone()).await.unwrap();

        assert_eq!(store.total_blocks().await.unwrap(), 1);
        assert_eq!(store.quota_used_bytes().await.unwrap(), block.size() as u64);
    }

    #[tokio::test]
    async fn test_quota_enforced() {
        let dir = TempDir::new().unwrap();
        let store = RepoStore::open(dir.path(), 16).unwrap();

        store.put(Block::new(vec![1u8; 10]).unwrap()).await.unwrap();
        assert!(matches!(
            store.put(Block::new(vec![2u8; 10]).unwrap()).await,
            Err(StoreError::QuotaExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_absent_ok() {
        let dir = TempDir::new().unwrap();
        let store = RepoStore::open(dir.path(), 0).unwrap();
        let cid = crate::cid::block_cid(b"ghost").unwrap();
        store.delete(&cid).await.unwrap();
    }

    #[tokio::test]
    async fn test_indexed_roundtrip_and_delete() {
        let dir = TempDir::new().unwrap();
        let store = RepoStore::open(dir.path(), 0).unwrap();

        let block = Block::new(&b"indexed block"[..]).unwrap();
        store.put(block.clone()).await.unwrap();

        let (tree_cid, proof) = tree_cid_and_proof(&block);
        store
            .put_cid_and_proof(&tree_cid, 0, block.cid, proof.clone())
            .await
            .unwrap();

        assert_eq!(store.get_indexed(&tree_cid, 0).await.unwrap(), block);
        let (cid, stored_proof) = store.get_cid_and_proof(&tree_cid, 0).await.unwrap();
        assert_eq!(cid, block.cid);
        assert_eq!(stored_proof, proof);

        store.delete_indexed(&tree_cid, 0).await.unwrap();
        assert!(!store.has(&block.cid).await.unwrap());
        assert_eq!(store.total_blocks().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_blocks_filters_manifests() {
        let dir = TempDir::new().unwrap();
        let store = RepoStore::open(dir.path(), 0).unwrap();

        let raw = Block::new(&b"raw block"[..]).unwrap();
        let manifest =
            Block::with_codec(&b"manifest block"[..], crate::cid::MANIFEST_CODEC).unwrap();
        store.put(raw).await.unwrap();
        store.put(manifest.clone()).await.unwrap();

        let manifests: Vec<Cid> = store
            .list_blocks(ListKind::Manifests)
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(manifests, vec![manifest.cid]);
    }

    #[tokio::test]
    async fn test_ensure_expiry_writes() {
        let dir = TempDir::new().unwrap();
        let store = RepoStore::open(dir.path(), 0).unwrap();
        let tree_cid = crate::cid::dataset_root_cid(crate::cid::SHA256_CODEC, &[1; 32]).unwrap();
        store
            .ensure_expiry(&tree_cid, 3, SystemTime::now() + std::time::Duration::from_secs(60))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_corrupted_bytes_fail_verification() {
        let dir = TempDir::new().unwrap();
        let block = Block::new(vec![7u8; 256]).unwrap();

        {
            let store = RepoStore::open(dir.path(), 0).unwrap();
            store.put(block.clone()).await.unwrap();
        }

        // Flip one stored byte underneath the repository.
        {
            let mut opts = Options::default();
            opts.create_missing_column_families(true);
            let cfs = [CF_BLOCKS, CF_INDEX, CF_TTL, CF_META]
                .iter()
                .map(|n| ColumnFamilyDescriptor::new(*n, Options::default()))
                .collect::<Vec<_>>();
            let db = DB::open_cf_descriptors(&opts, dir.path(), cfs).unwrap();
            let blocks = db.cf_handle(CF_BLOCKS).unwrap();
            let key = block.cid.to_bytes();
            let mut data = db.get_cf(blocks, &key).unwrap().unwrap();
            data[17] ^= 0xff;
            db.put_cf(blocks, &key, data).unwrap();
        }

        let store = RepoStore::open(dir.path(), 0).unwrap();
        assert!(matches!(
            store.get(&block.cid).await,
            Err(StoreError::InvalidBlock(_))
        ));
    }
}
