//! Download sessions
//!
//! A session steps a cursor over a dataset's blocks. The manifest is fetched
//! lazily on the first chunk read; `stream` drains the whole dataset through
//! a progress callback and optionally mirrors it into a file. Cancellation
//! halts emissions between chunks.

use bytes::Bytes;
use ::cid::Cid;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::cid::{self, CidError};
use crate::engine::{EngineError, NodeEngine};
use crate::manifest::Manifest;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Unknown download session: {0}")]
    UnknownSession(String),

    #[error("Invalid state: session {session} is {state}, cannot {op}")]
    InvalidState {
        session: String,
        state: &'static str,
        op: &'static str,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Cid(#[from] CidError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DownloadError>;

/// Per-chunk progress callback; an error halts the stream.
pub type DownloadProgress<'a> = Box<dyn FnMut(&[u8]) -> Result<()> + Send + 'a>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DownloadState {
    Initialized,
    Streaming,
    Cancelled,
    Completed,
}

impl DownloadState {
    fn name(self) -> &'static str {
        match self {
            DownloadState::Initialized => "initialized",
            DownloadState::Streaming => "streaming",
            DownloadState::Cancelled => "cancelled",
            DownloadState::Completed => "completed",
        }
    }
}

struct DownloadSession {
    cid: Cid,
    chunk_size: u32,
    local: bool,
    filepath: Option<PathBuf>,
    /// Fetched lazily at the first chunk read.
    manifest: Option<Manifest>,
    cursor: u64,
    state: DownloadState,
}

/// Manages download sessions over the engine.
#[derive(Clone)]
pub struct DownloadManager {
    engine: NodeEngine,
    sessions: Arc<Mutex<HashMap<String, DownloadSession>>>,
}

impl DownloadManager {
    pub fn new(engine: NodeEngine) -> Self {
        Self {
            engine,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Record a session. Returns the opaque session id.
    pub async fn init(
        &self,
        cid: &str,
        chunk_size: u32,
        local: bool,
        filepath: Option<String>,
    ) -> Result<String> {
        if chunk_size == 0 {
            return Err(DownloadError::InvalidArgument(
                "chunk size must be non-zero".into(),
            ));
        }
        let cid = cid::parse_cid(cid)?;

        let id = hex::encode(rand::random::<[u8; 16]>());
        let session = DownloadSession {
            cid,
            chunk_size,
            local,
            filepath: filepath.map(PathBuf::from),
            manifest: None,
            cursor: 0,
            state: DownloadState::Initialized,
        };
        self.sessions.lock().await.insert(id.clone(), session);
        debug!(session = %id, cid = %cid, chunk_size, local, "download session opened");
        Ok(id)
    }

    /// Return the next chunk (at most the session's chunk size) and step the
    /// byte cursor, or `None` once the dataset is drained (the session then
    /// completes).
    pub async fn chunk(&self, id: &str) -> Result<Option<Bytes>> {
        // Snapshot what the fetch needs without holding the lock across IO.
        let (target, chunk_size, local, manifest, offset) = {
            let mut sessions = self.sessions.lock().await;
            let session = sessions
                .get_mut(id)
                .ok_or_else(|| DownloadError::UnknownSession(id.to_string()))?;
            match session.state {
                DownloadState::Initialized => session.state = DownloadState::Streaming,
                DownloadState::Streaming => {}
                state => {
                    return Err(DownloadError::InvalidState {
                        session: id.to_string(),
                        state: state.name(),
                        op: "read a chunk",
                    })
                }
            }
            (
                session.cid,
                u64::from(session.chunk_size),
                session.local,
                session.manifest.clone(),
                session.cursor,
            )
        };

        // Single-block target: step through the block's bytes.
        if !cid::is_manifest(&target) {
            let block = self.engine.block_by_cid(&target, local).await?;
            let len = block.data.len() as u64;
            if offset >= len {
                self.complete(id).await;
                return Ok(None);
            }
            let take = chunk_size.min(len - offset) as usize;
            self.advance(id, offset + take as u64).await;
            return Ok(Some(block.data.slice(offset as usize..offset as usize + take)));
        }

        let manifest = match manifest {
            Some(m) => m,
            None => {
                let m = if local {
                    let block = self.engine.block_by_cid(&target, true).await?;
                    Manifest::from_block(&block).map_err(EngineError::from)?
                } else {
                    self.engine.fetch_manifest(&target).await?
                };
                let mut sessions = self.sessions.lock().await;
                if let Some(session) = sessions.get_mut(id) {
                    session.manifest = Some(m.clone());
                }
                m
            }
        };

        if offset >= manifest.dataset_size {
            self.complete(id).await;
            return Ok(None);
        }

        let block_size = u64::from(manifest.block_size);
        let block_index = offset / block_size;
        let within = (offset % block_size) as usize;

        let block = self
            .engine
            .block_at(&manifest.tree_cid, block_index, local)
            .await?;

        // Never cross a block boundary, and truncate to the dataset size.
        let block_end = ((block_index + 1) * block_size).min(manifest.dataset_size);
        let take = chunk_size.min(block_end - offset) as usize;

        self.advance(id, offset + take as u64).await;
        Ok(Some(block.data.slice(within..within + take)))
    }

    /// Drain the dataset through `on_chunk`, mirroring into the session's
    /// file when one was given.
    pub async fn stream(&self, id: &str, mut on_chunk: DownloadProgress<'_>) -> Result<u64> {
        let filepath = {
            let sessions = self.sessions.lock().await;
            let session = sessions
                .get(id)
                .ok_or_else(|| DownloadError::UnknownSession(id.to_string()))?;
            session.filepath.clone()
        };

        let mut file = match filepath {
            Some(path) => Some(tokio::fs::File::create(path).await?),
            None => None,
        };

        let mut delivered: u64 = 0;
        loop {
            match self.chunk(id).await {
                Ok(Some(data)) => {
                    if let Some(f) = file.as_mut() {
                        f.write_all(&data).await?;
                    }
                    on_chunk(&data)?;
                    delivered += data.len() as u64;
                }
                Ok(None) => break,
                // Cancellation between chunks ends the stream quietly.
                Err(DownloadError::InvalidState {
                    state: "cancelled", ..
                }) => break,
                Err(e) => return Err(e),
            }
        }

        if let Some(f) = file.as_mut() {
            f.flush().await?;
        }
        info!(session = %id, delivered, "download stream finished");
        Ok(delivered)
    }

    /// Halt emissions for a session.
    pub async fn cancel(&self, id: &str) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| DownloadError::UnknownSession(id.to_string()))?;
        match session.state {
            DownloadState::Initialized | DownloadState::Streaming => {
                session.state = DownloadState::Cancelled;
                Ok(())
            }
            state => Err(DownloadError::InvalidState {
                session: id.to_string(),
                state: state.name(),
                op: "cancel",
            }),
        }
    }

    /// Fetch and render a manifest as JSON, without a session.
    pub async fn manifest_json(&self, cid: &str) -> Result<String> {
        let cid = cid::parse_cid(cid)?;
        let manifest = self.engine.fetch_manifest(&cid).await?;
        serde_json::to_string(&manifest.view())
            .map_err(|e| DownloadError::Engine(EngineError::Internal(e.to_string())))
    }

    async fn advance(&self, id: &str, cursor: u64) {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get_mut(id) {
            session.cursor = cursor;
        }
    }

    async fn complete(&self, id: &str) {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get_mut(id) {
            session.state = DownloadState::Completed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StoreOptions;
    use crate::exchange::{BlockExchange, OfflineExchange};
    use crate::identity::NodeIdentity;
    use crate::store::{BlockStore, MemoryStore};
    use std::io::Cursor;
    use tempfile::TempDir;

    async fn setup(data: &[u8], block_size: u32) -> (DownloadManager, String, TempDir) {
        let dir = TempDir::new().unwrap();
        let identity = NodeIdentity::load_or_create(&dir.path().join("node")).unwrap();
        let store: Arc<dyn BlockStore> = Arc::new(MemoryStore::new());
        let exchange: Arc<dyn BlockExchange> = Arc::new(OfflineExchange::new(&identity, &[]));
        let engine = NodeEngine::new(store, exchange);

        let manifest_cid = engine
            .store(
                Cursor::new(data.to_vec()),
                StoreOptions {
                    block_size,
                    filename: Some("data.bin".into()),
                    mimetype: Some("application/octet-stream".into()),
                },
                None,
            )
            .await
            .unwrap();

        (
            DownloadManager::new(engine),
            manifest_cid.to_string(),
            dir,
        )
    }

    #[tokio::test]
    async fn test_chunk_stepping_drains_dataset() {
        let data: Vec<u8> = (0..2500).map(|i| (i % 256) as u8).collect();
        let (downloads, cid, _dir) = setup(&data, 1024).await;

        let id = downloads.init(&cid, 1024, true, None).await.unwrap();

        let mut out = Vec::new();
        while let Some(chunk) = downloads.chunk(&id).await.unwrap() {
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, data);

        // Completed: no further reads.
        assert!(matches!(
            downloads.chunk(&id).await,
            Err(DownloadError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_final_chunk_truncated() {
        let data = vec![42u8; 1500];
        let (downloads, cid, _dir) = setup(&data, 1024).await;

        let id = downloads.init(&cid, 1024, true, None).await.unwrap();
        let first = downloads.chunk(&id).await.unwrap().unwrap();
        let second = downloads.chunk(&id).await.unwrap().unwrap();
        assert_eq!(first.len(), 1024);
        assert_eq!(second.len(), 476);
        assert_eq!(downloads.chunk(&id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_chunk_size_below_block_size() {
        let data: Vec<u8> = (0..2048).map(|i| (i % 256) as u8).collect();
        let (downloads, cid, _dir) = setup(&data, 1024).await;

        // 700-byte chunks over 1024-byte blocks: emissions never cross a
        // block boundary.
        let id = downloads.init(&cid, 700, true, None).await.unwrap();
        let mut out = Vec::new();
        let mut sizes = Vec::new();
        while let Some(chunk) = downloads.chunk(&id).await.unwrap() {
            sizes.push(chunk.len());
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, data);
        assert_eq!(sizes, vec![700, 324, 700, 324]);
    }

    #[tokio::test]
    async fn test_stream_with_file_mirror() {
        let data: Vec<u8> = (0..5000).map(|i| (i % 251) as u8).collect();
        let (downloads, cid, dir) = setup(&data, 512).await;

        let out_path = dir.path().join("mirrored.bin");
        let id = downloads
            .init(
                &cid,
                512,
                true,
                Some(out_path.to_string_lossy().into_owned()),
            )
            .await
            .unwrap();

        let mut streamed = Vec::new();
        let delivered = downloads
            .stream(
                &id,
                Box::new(|chunk| {
                    streamed.extend_from_slice(chunk);
                    Ok(())
                }),
            )
            .await
            .unwrap();

        assert_eq!(delivered, 5000);
        assert_eq!(streamed, data);
        assert_eq!(std::fs::read(&out_path).unwrap(), data);
    }

    #[tokio::test]
    async fn test_cancel_halts_emissions() {
        let data = vec![1u8; 4096];
        let (downloads, cid, _dir) = setup(&data, 1024).await;

        let id = downloads.init(&cid, 1024, true, None).await.unwrap();
        downloads.chunk(&id).await.unwrap().unwrap();
        downloads.cancel(&id).await.unwrap();

        assert!(matches!(
            downloads.chunk(&id).await,
            Err(DownloadError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_manifest_json_shape() {
        let (downloads, cid, _dir) = setup(b"Hello World!", 65536).await;

        let json = downloads.manifest_json(&cid).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["datasetSize"], 12);
        assert_eq!(value["blockSize"], 65536);
        assert_eq!(value["protected"], false);
        assert_eq!(value["filename"], "data.bin");
    }

    #[tokio::test]
    async fn test_init_rejects_bad_cid_and_zero_chunk() {
        let (downloads, cid, _dir) = setup(b"x", 16).await;

        assert!(matches!(
            downloads.init("garbage-cid", 16, true, None).await,
            Err(DownloadError::Cid(_))
        ));
        assert!(matches!(
            downloads.init(&cid, 0, true, None).await,
            Err(DownloadError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let (downloads, _cid, _dir) = setup(b"x", 16).await;
        assert!(matches!(
            downloads.chunk("missing").await,
            Err(DownloadError::UnknownSession(_))
        ));
    }
}
