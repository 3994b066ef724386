//! Upload sessions
//!
//! A session accumulates chunks from a foreign caller and, on finalize,
//! drives them through the engine as one logical stream; the resulting
//! manifest CID is identical to what a direct `store` of the concatenation
//! would produce. Sessions are kept in a map under opaque random ids, so
//! concurrent sessions never interfere.
//!
//! ```text
//!         upload_init
//!    ( )  ───────────▶  Open
//! Open    + upload_chunk(data) ─▶ Open (data appended)
//! Open    + upload_file / upload_finalize ─▶ Finalizing ─▶ Completed
//! Open    + upload_cancel ─▶ Cancelled
//! anything else ─▶ InvalidState
//! ```

use cid::Cid;
use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::engine::{EngineError, NodeEngine, StoreOptions};
use crate::manifest::DEFAULT_BLOCK_SIZE;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Unknown upload session: {0}")]
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
    Engine(#[from] EngineError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, UploadError>;

/// Cumulative-bytes progress callback.
pub type UploadProgress<'a> = Box<dyn FnMut(u64) + Send + 'a>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UploadState {
    Open,
    Finalizing,
    Cancelled,
    Completed,
}

impl UploadState {
    fn name(self) -> &'static str {
        match self {
            UploadState::Open => "open",
            UploadState::Finalizing => "finalizing",
            UploadState::Cancelled => "cancelled",
            UploadState::Completed => "completed",
        }
    }
}

struct UploadSession {
    /// Filepath for `upload_file`, or a plain name used as the manifest
    /// filename.
    name: Option<String>,
    chunk_size: u32,
    buffer: Vec<u8>,
    state: UploadState,
}

/// Manages upload sessions over the engine.
#[derive(Clone)]
pub struct UploadManager {
    engine: NodeEngine,
    sessions: Arc<Mutex<HashMap<String, UploadSession>>>,
}

impl UploadManager {
    pub fn new(engine: NodeEngine) -> Self {
        Self {
            engine,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Open a session. Returns the opaque session id.
    pub async fn init(&self, filepath: Option<String>, chunk_size: u32) -> Result<String> {
        if chunk_size == 0 {
            return Err(UploadError::InvalidArgument(
                "chunk size must be non-zero".into(),
            ));
        }

        let id = hex::encode(rand::random::<[u8; 16]>());
        let session = UploadSession {
            name: filepath,
            chunk_size,
            buffer: Vec::new(),
            state: UploadState::Open,
        };
        self.sessions.lock().await.insert(id.clone(), session);
        debug!(session = %id, chunk_size, "upload session opened");
        Ok(id)
    }

    /// Append bytes to an open session.
    pub async fn chunk(&self, id: &str, data: &[u8]) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| UploadError::UnknownSession(id.to_string()))?;
        if session.state != UploadState::Open {
            return Err(UploadError::InvalidState {
                session: id.to_string(),
                state: session.state.name(),
                op: "append a chunk",
            });
        }
        session.buffer.extend_from_slice(data);
        Ok(())
    }

    /// Drive the accumulated bytes through the engine and complete the
    /// session, returning the manifest CID.
    pub async fn finalize(&self, id: &str) -> Result<Cid> {
        let (buffer, name, chunk_size) = self.begin_finalize(id, "finalize").await?;

        let filename = name.as_deref().map(basename);
        let result = self
            .engine
            .store(
                Cursor::new(buffer),
                StoreOptions {
                    block_size: chunk_size,
                    filename,
                    mimetype: None,
                },
                None,
            )
            .await;

        self.end_finalize(id, &result).await;
        Ok(result?)
    }

    /// Stream the session's file through the engine.
    ///
    /// Progress is emitted per stored block, but only when the engine block
    /// size does not exceed the session chunk size; coarser chunking would
    /// over-report.
    pub async fn file(&self, id: &str, mut progress: Option<UploadProgress<'_>>) -> Result<Cid> {
        let (_, name, chunk_size) = self.begin_finalize(id, "upload a file").await?;

        let path = match name {
            Some(ref path) => path.clone(),
            None => {
                let failed: Result<Cid> = Err(UploadError::InvalidArgument(
                    "session has no filepath".into(),
                ));
                self.end_finalize(id, &failed).await;
                return failed;
            }
        };

        let emit_progress = DEFAULT_BLOCK_SIZE <= chunk_size;
        let mut total: u64 = 0;
        let on_block: Option<crate::engine::OnBlockStored<'_>> = if emit_progress {
            progress.as_mut().map(|cb| {
                Box::new(move |chunk: &[u8]| {
                    total += chunk.len() as u64;
                    cb(total);
                }) as crate::engine::OnBlockStored<'_>
            })
        } else {
            None
        };

        let result = match tokio::fs::File::open(&path).await {
            Ok(file) => {
                self.engine
                    .store(
                        file,
                        StoreOptions {
                            block_size: DEFAULT_BLOCK_SIZE,
                            filename: Some(basename(&path)),
                            mimetype: None,
                        },
                        on_block,
                    )
                    .await
                    .map_err(UploadError::from)
            }
            Err(e) => Err(UploadError::Io(e)),
        };

        self.end_finalize(id, &result).await;
        result
    }

    /// Cancel an open session and discard its buffered bytes.
    pub async fn cancel(&self, id: &str) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| UploadError::UnknownSession(id.to_string()))?;
        if session.state != UploadState::Open {
            return Err(UploadError::InvalidState {
                session: id.to_string(),
                state: session.state.name(),
                op: "cancel",
            });
        }
        session.state = UploadState::Cancelled;
        session.buffer = Vec::new();
        info!(session = %id, "upload session cancelled");
        Ok(())
    }

    /// Move an open session to Finalizing and take its buffered state. The
    /// map lock is not held while the engine runs.
    async fn begin_finalize(
        &self,
        id: &str,
        op: &'static str,
    ) -> Result<(Vec<u8>, Option<String>, u32)> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| UploadError::UnknownSession(id.to_string()))?;
        if session.state != UploadState::Open {
            return Err(UploadError::InvalidState {
                session: id.to_string(),
                state: session.state.name(),
                op,
            });
        }
        session.state = UploadState::Finalizing;
        let buffer = std::mem::take(&mut session.buffer);
        Ok((buffer, session.name.clone(), session.chunk_size))
    }

    async fn end_finalize<T, E>(&self, id: &str, result: &std::result::Result<T, E>) {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get_mut(id) {
            session.state = match result {
                Ok(_) => UploadState::Completed,
                Err(_) => UploadState::Cancelled,
            };
        }
    }
}

fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}
