//! FFI request pipeline
//!
//! One worker thread per context, owning its own single-threaded runtime and
//! the whole node (engine, repository, sessions). Foreign threads submit
//! requests through a lock-guarded single-producer/single-consumer slot and
//! block only until the worker acknowledges ownership of the request; the
//! request itself executes asynchronously on the worker's event loop and
//! reports through the completion callback.
//!
//! Callbacks run on the worker thread and must not block: a blocking
//! callback stalls every subsequent request. Message buffers handed to a
//! callback are valid only for the duration of the call; callees copy.

use serde_json::json;
use std::cell::{Cell, RefCell};
use std::ffi::{c_char, c_void};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex as StdMutex};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::api;
use crate::config::Config;
use crate::download::{DownloadManager, DownloadProgress};
use crate::engine::NodeEngine;
use crate::exchange::{BlockExchange, OfflineExchange};
use crate::identity::{NodeIdentity, REPO_DIR};
use crate::logging;
use crate::repo::RepoStore;
use crate::store::BlockStore;
use crate::upload::{UploadManager, UploadProgress};

/// Synchronous and callback return codes.
pub const RET_OK: i32 = 0;
pub const RET_ERR: i32 = 1;
pub const RET_MISSING_CALLBACK: i32 = 2;
pub const RET_PROGRESS: i32 = 3;

/// Completion callback: `(code, msg, msg_len, user_data)`. The message
/// buffer is NUL-terminated, but `msg_len` is authoritative (progress
/// payloads may be binary).
pub type CompletionCallback =
    extern "C" fn(code: i32, msg: *const c_char, len: usize, user_data: *mut c_void);

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Failed to start pipeline worker: {0}")]
    Init(String),

    #[error("Request dispatch failed: {0}")]
    DispatchFailed(String),
}

/// A callback pointer paired with its opaque user data.
///
/// The user data is owned by the foreign caller; sending it to the worker
/// thread is the whole point of the pipeline.
#[derive(Clone, Copy)]
pub struct CallbackSlot {
    callback: CompletionCallback,
    user_data: *mut c_void,
}

unsafe impl Send for CallbackSlot {}

impl CallbackSlot {
    pub fn new(callback: CompletionCallback, user_data: *mut c_void) -> Self {
        Self {
            callback,
            user_data,
        }
    }

    fn invoke(&self, code: i32, msg: &[u8]) {
        // NUL-terminated copy; the pointer is dead once the callback returns.
        let mut buf = Vec::with_capacity(msg.len() + 1);
        buf.extend_from_slice(msg);
        buf.push(0);
        (self.callback)(code, buf.as_ptr() as *const c_char, msg.len(), self.user_data);
    }

    pub fn report(&self, code: i32, msg: &[u8]) {
        self.invoke(code, msg);
    }

    pub fn ok(&self, msg: &[u8]) {
        self.invoke(RET_OK, msg);
    }

    pub fn err(&self, msg: &str) {
        self.invoke(RET_ERR, msg.as_bytes());
    }

    pub fn progress(&self, msg: &[u8]) {
        self.invoke(RET_PROGRESS, msg);
    }
}

/// Operations a foreign caller can submit.
pub enum Request {
    /// Internal wake-up for destroy; never acknowledged.
    Shutdown,

    Start,
    Stop,
    Close,

    Version,
    Revision,
    Repo,
    DebugInfo,
    Spr,
    PeerId,
    LogLevel { level: String },

    Connect { peer_id: String, addrs: Vec<String> },

    UploadInit { filepath: Option<String>, chunk_size: u32 },
    UploadChunk { session_id: String, data: Vec<u8> },
    UploadFinalize { session_id: String },
    UploadCancel { session_id: String },
    UploadFile { session_id: String },

    DownloadInit { cid: String, chunk_size: u32, local: bool },
    DownloadStream {
        cid: String,
        chunk_size: u32,
        local: bool,
        filepath: Option<String>,
    },
    DownloadChunk { session_id: String },
    DownloadCancel { session_id: String },
    DownloadManifest { cid: String },

    List,
    Space,
    Delete { cid: String },
    Fetch { cid: String },
    Exists { cid: String },
}

/// A request together with its completion callback.
pub struct Envelope {
    pub request: Request,
    pub callback: Option<CallbackSlot>,
}

struct SubmitSlot {
    req_tx: SyncSender<Envelope>,
    ack_rx: Receiver<()>,
}

/// Handle to a worker thread. Owned by the FFI context.
pub struct RequestPipeline {
    slot: StdMutex<SubmitSlot>,
    running: Arc<AtomicBool>,
    ack_timeout: Option<Duration>,
    worker: Option<JoinHandle<()>>,
}

impl RequestPipeline {
    /// Spawn the worker and build the node it owns. Blocks until the worker
    /// reports that the node context is ready.
    pub fn new(config: Config) -> Result<Self, PipelineError> {
        let (req_tx, req_rx) = sync_channel::<Envelope>(1);
        let (ack_tx, ack_rx) = sync_channel::<()>(1);
        let (init_tx, init_rx) = std::sync::mpsc::channel::<Result<(), String>>();
        let running = Arc::new(AtomicBool::new(true));
        let worker_running = running.clone();

        let worker = std::thread::Builder::new()
            .name("stowage-pipeline".to_string())
            .spawn(move || worker_main(config, req_rx, ack_tx, worker_running, init_tx))
            .map_err(|e| PipelineError::Init(e.to_string()))?;

        match init_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                slot: StdMutex::new(SubmitSlot { req_tx, ack_rx }),
                running,
                ack_timeout: None,
                worker: Some(worker),
            }),
            Ok(Err(msg)) => {
                let _ = worker.join();
                Err(PipelineError::Init(msg))
            }
            Err(_) => {
                let _ = worker.join();
                Err(PipelineError::Init("worker exited during startup".into()))
            }
        }
    }

    /// Bound the acknowledgement wait (default: infinite).
    pub fn set_ack_timeout(&mut self, timeout: Option<Duration>) {
        self.ack_timeout = timeout;
    }

    /// Submit a request and wait for the worker to take ownership of it.
    /// The completion callback fires later, on the worker thread.
    pub fn submit(&self, envelope: Envelope) -> Result<(), PipelineError> {
        let slot = self
            .slot
            .lock()
            .map_err(|_| PipelineError::DispatchFailed("submit lock poisoned".into()))?;

        if !self.running.load(Ordering::SeqCst) {
            return Err(PipelineError::DispatchFailed("pipeline is shut down".into()));
        }

        slot.req_tx
            .try_send(envelope)
            .map_err(|_| PipelineError::DispatchFailed("request slot unavailable".into()))?;

        match self.ack_timeout {
            None => slot
                .ack_rx
                .recv()
                .map_err(|_| PipelineError::DispatchFailed("no acknowledgement".into())),
            Some(timeout) => slot
                .ack_rx
                .recv_timeout(timeout)
                .map_err(|_| PipelineError::DispatchFailed("acknowledgement timed out".into())),
        }
    }

    /// Stop the worker and join it. Requests in flight are dropped without
    /// callbacks.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Ok(slot) = self.slot.lock() {
            let _ = slot.req_tx.try_send(Envelope {
                request: Request::Shutdown,
                callback: None,
            });
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for RequestPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Created,
    Started,
    Stopped,
}

/// Everything the worker owns: configuration, identity, engine, sessions and
/// the REST server handle.
struct WorkerContext {
    config: Config,
    engine: NodeEngine,
    uploads: UploadManager,
    downloads: DownloadManager,
    state: Cell<NodeState>,
    api_task: RefCell<Option<tokio::task::JoinHandle<()>>>,
}

impl WorkerContext {
    fn create(config: Config) -> Result<Self, String> {
        let identity =
            NodeIdentity::load_or_create(&config.data_dir).map_err(|e| e.to_string())?;
        let store: Arc<dyn BlockStore> = Arc::new(
            RepoStore::open(config.data_dir.join(REPO_DIR), config.storage_quota)
                .map_err(|e| e.to_string())?,
        );
        let exchange: Arc<dyn BlockExchange> =
            Arc::new(OfflineExchange::new(&identity, &config.listen_addrs));
        let engine = NodeEngine::new(store, exchange)
            .with_block_ttl(Duration::from_secs(config.block_ttl));

        Ok(Self {
            config,
            uploads: UploadManager::new(engine.clone()),
            downloads: DownloadManager::new(engine.clone()),
            engine,
            state: Cell::new(NodeState::Created),
            api_task: RefCell::new(None),
        })
    }

    async fn stop_node(&self) {
        if let Some(handle) = self.api_task.borrow_mut().take() {
            handle.abort();
        }
        self.engine.stop().await;
        self.state.set(NodeState::Stopped);
    }
}

fn worker_main(
    config: Config,
    req_rx: Receiver<Envelope>,
    ack_tx: SyncSender<()>,
    running: Arc<AtomicBool>,
    init_tx: std::sync::mpsc::Sender<Result<(), String>>,
) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .max_blocking_threads(config.worker_threads().max(1))
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            let _ = init_tx.send(Err(format!("runtime: {}", e)));
            return;
        }
    };
    let local = tokio::task::LocalSet::new();

    local.block_on(&rt, async move {
        let ctx = match WorkerContext::create(config) {
            Ok(ctx) => Rc::new(ctx),
            Err(e) => {
                let _ = init_tx.send(Err(e));
                return;
            }
        };
        let _ = init_tx.send(Ok(()));
        info!("pipeline worker ready");

        let mut req_rx = req_rx;
        loop {
            // Park on the request slot off the event loop so in-flight
            // request tasks keep making progress.
            let (rx_back, received) = match tokio::task::spawn_blocking(move || {
                let received = req_rx.recv();
                (req_rx, received)
            })
            .await
            {
                Ok(pair) => pair,
                Err(_) => break,
            };
            req_rx = rx_back;

            let envelope = match received {
                Ok(envelope) => envelope,
                Err(_) => break,
            };
            if !running.load(Ordering::SeqCst) || matches!(envelope.request, Request::Shutdown) {
                break;
            }

            let task_ctx = ctx.clone();
            tokio::task::spawn_local(async move {
                process(task_ctx, envelope).await;
            });

            // The request is owned; unblock the foreign thread.
            let _ = ack_tx.try_send(());
            tokio::task::yield_now().await;
        }

        ctx.stop_node().await;
        debug!("pipeline worker exiting");
    });
}

async fn process(ctx: Rc<WorkerContext>, envelope: Envelope) {
    let Envelope { request, callback } = envelope;
    match dispatch(&ctx, request, callback.as_ref()).await {
        Ok(msg) => {
            if let Some(cb) = callback {
                cb.ok(&msg);
            }
        }
        Err(msg) => {
            if let Some(cb) = callback {
                cb.err(&msg);
            }
        }
    }
}

fn err_str(e: impl std::fmt::Display) -> String {
    e.to_string()
}

async fn dispatch(
    ctx: &Rc<WorkerContext>,
    request: Request,
    callback: Option<&CallbackSlot>,
) -> Result<Vec<u8>, String> {
    match request {
        Request::Shutdown => Ok(Vec::new()),

        Request::Start => match ctx.state.get() {
            NodeState::Started => Ok(b"already started".to_vec()),
            _ => {
                // Claim the state before the first await so a concurrent
                // start sees it and no-ops.
                ctx.state.set(NodeState::Started);
                let listener =
                    match tokio::net::TcpListener::bind(("0.0.0.0", ctx.config.api_port)).await
                    {
                        Ok(listener) => listener,
                        Err(e) => {
                            ctx.state.set(NodeState::Stopped);
                            return Err(e.to_string());
                        }
                    };
                let addr = listener.local_addr().map_err(err_str)?;
                let router = api::create_router(
                    ctx.engine.clone(),
                    ctx.config.api_cors_allowed_origin.as_deref(),
                );
                let handle = tokio::task::spawn_local(async move {
                    if let Err(e) = axum::serve(listener, router).await {
                        error!(error = %e, "rest server terminated");
                    }
                });
                *ctx.api_task.borrow_mut() = Some(handle);
                info!(%addr, "node started");
                Ok(format!("started; api listening on {}", addr).into_bytes())
            }
        },

        Request::Stop => {
            ctx.stop_node().await;
            Ok(b"stopped".to_vec())
        }

        Request::Close => {
            ctx.stop_node().await;
            Ok(b"closed".to_vec())
        }

        Request::Version => Ok(env!("CARGO_PKG_VERSION").as_bytes().to_vec()),

        Request::Revision => Ok(option_env!("STOWAGE_REVISION")
            .unwrap_or("unknown")
            .as_bytes()
            .to_vec()),

        Request::Repo => Ok(ctx
            .config
            .data_dir
            .display()
            .to_string()
            .into_bytes()),

        Request::DebugInfo => {
            let space = ctx.engine.space().await.map_err(err_str)?;
            let info = json!({
                "version": env!("CARGO_PKG_VERSION"),
                "revision": option_env!("STOWAGE_REVISION").unwrap_or("unknown"),
                "peerId": ctx.engine.exchange_handle().local_peer_id(),
                "spr": ctx.engine.exchange_handle().spr(),
                "space": space,
            });
            serde_json::to_vec(&info).map_err(err_str)
        }

        Request::Spr => Ok(ctx.engine.exchange_handle().spr().into_bytes()),

        Request::PeerId => Ok(ctx.engine.exchange_handle().local_peer_id().into_bytes()),

        Request::LogLevel { level } => {
            logging::set_level(&level)?;
            Ok(Vec::new())
        }

        Request::Connect { peer_id, addrs } => {
            ctx.engine
                .exchange_handle()
                .connect(&peer_id, &addrs)
                .await
                .map_err(err_str)?;
            Ok(b"connected".to_vec())
        }

        Request::UploadInit {
            filepath,
            chunk_size,
        } => ctx
            .uploads
            .init(filepath, chunk_size)
            .await
            .map(String::into_bytes)
            .map_err(err_str),

        Request::UploadChunk { session_id, data } => ctx
            .uploads
            .chunk(&session_id, &data)
            .await
            .map(|_| Vec::new())
            .map_err(err_str),

        Request::UploadFinalize { session_id } => ctx
            .uploads
            .finalize(&session_id)
            .await
            .map(|cid| cid.to_string().into_bytes())
            .map_err(err_str),

        Request::UploadCancel { session_id } => ctx
            .uploads
            .cancel(&session_id)
            .await
            .map(|_| Vec::new())
            .map_err(err_str),

        Request::UploadFile { session_id } => {
            let progress = callback.copied().map(|cb| {
                Box::new(move |total: u64| {
                    cb.progress(total.to_string().as_bytes());
                }) as UploadProgress<'static>
            });
            ctx.uploads
                .file(&session_id, progress)
                .await
                .map(|cid| cid.to_string().into_bytes())
                .map_err(err_str)
        }

        Request::DownloadInit {
            cid,
            chunk_size,
            local,
        } => ctx
            .downloads
            .init(&cid, chunk_size, local, None)
            .await
            .map(String::into_bytes)
            .map_err(err_str),

        Request::DownloadStream {
            cid,
            chunk_size,
            local,
            filepath,
        } => {
            let id = ctx
                .downloads
                .init(&cid, chunk_size, local, filepath)
                .await
                .map_err(err_str)?;
            let cb = callback.copied();
            let on_chunk: DownloadProgress<'_> = Box::new(move |chunk: &[u8]| {
                if let Some(cb) = cb {
                    cb.progress(chunk);
                }
                Ok(())
            });
            ctx.downloads
                .stream(&id, on_chunk)
                .await
                .map(|delivered| delivered.to_string().into_bytes())
                .map_err(err_str)
        }

        Request::DownloadChunk { session_id } => {
            match ctx.downloads.chunk(&session_id).await.map_err(err_str)? {
                Some(bytes) => Ok(bytes.to_vec()),
                None => Ok(Vec::new()),
            }
        }

        Request::DownloadCancel { session_id } => ctx
            .downloads
            .cancel(&session_id)
            .await
            .map(|_| Vec::new())
            .map_err(err_str),

        Request::DownloadManifest { cid } => ctx
            .downloads
            .manifest_json(&cid)
            .await
            .map(String::into_bytes)
            .map_err(err_str),

        Request::List => {
            let mut content: Vec<serde_json::Value> = Vec::new();
            ctx.engine
                .iterate_manifests(|cid, manifest| {
                    content.push(json!({
                        "cid": cid.to_string(),
                        "manifest": manifest.view(),
                    }));
                })
                .await
                .map_err(err_str)?;
            serde_json::to_vec(&json!({ "content": content })).map_err(err_str)
        }

        Request::Space => {
            let space = ctx.engine.space().await.map_err(err_str)?;
            serde_json::to_vec(&space).map_err(err_str)
        }

        Request::Delete { cid } => {
            let cid = crate::cid::parse_cid(&cid).map_err(err_str)?;
            ctx.engine.delete(&cid).await.map_err(err_str)?;
            Ok(Vec::new())
        }

        Request::Fetch { cid } => {
            let cid = crate::cid::parse_cid(&cid).map_err(err_str)?;
            let manifest = ctx.engine.prefetch(&cid).await.map_err(err_str)?;
            serde_json::to_vec(&manifest.view()).map_err(err_str)
        }

        Request::Exists { cid } => {
            let cid = crate::cid::parse_cid(&cid).map_err(err_str)?;
            let exists = ctx.engine.has_local_block(&cid).await.map_err(err_str)?;
            Ok(if exists { b"true".to_vec() } else { b"false".to_vec() })
        }
    }
}
