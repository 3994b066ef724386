//! C ABI surface
//!
//! Thin adapters from C calls onto the request pipeline. Synchronous return
//! codes: 0 = submitted OK, 1 = error, 2 = missing callback. Results arrive
//! through the completion callback on the worker thread; PROGRESS (3)
//! callbacks may precede the terminal OK/ERR. Callback message buffers are
//! valid only during the call.

use std::ffi::{c_char, c_int, c_void, CStr};
use std::sync::Once;

use crate::config::Config;
use crate::logging;
use crate::pipeline::{
    CallbackSlot, CompletionCallback, Envelope, Request, RequestPipeline, RET_ERR,
    RET_MISSING_CALLBACK, RET_OK,
};

/// Opaque context handed across the FFI.
pub struct StowageCtx {
    pipeline: RequestPipeline,
}

static RUNTIME_INIT: Once = Once::new();

fn runtime_init() {
    RUNTIME_INIT.call_once(|| {
        logging::init("info");
    });
}

/// # Safety
/// `ptr` must be null or a valid NUL-terminated string.
unsafe fn string_arg(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        None
    } else {
        Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
    }
}

fn clamp_chunk_size(chunk_size: u64) -> u32 {
    chunk_size.min(u64::from(u32::MAX)) as u32
}

/// # Safety
/// `ctx` must be a pointer returned by [`stowage_new`] and not yet destroyed.
unsafe fn dispatch(
    ctx: *mut StowageCtx,
    request: Request,
    callback: Option<CompletionCallback>,
    user_data: *mut c_void,
) -> c_int {
    let Some(callback) = callback else {
        return RET_MISSING_CALLBACK;
    };
    if ctx.is_null() {
        return RET_ERR;
    }
    let ctx = &*ctx;
    match ctx.pipeline.submit(Envelope {
        request,
        callback: Some(CallbackSlot::new(callback, user_data)),
    }) {
        Ok(()) => RET_OK,
        Err(_) => RET_ERR,
    }
}

/// Create a node context from a JSON config (null = defaults). Returns null
/// on failure, reporting the reason through the callback when one is given.
///
/// # Safety
/// `config_json` must be null or a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn stowage_new(
    config_json: *const c_char,
    callback: Option<CompletionCallback>,
    user_data: *mut c_void,
) -> *mut StowageCtx {
    runtime_init();

    let report = |code: i32, msg: &str| {
        if let Some(cb) = callback {
            CallbackSlot::new(cb, user_data).report(code, msg.as_bytes());
        }
    };

    let config = match string_arg(config_json) {
        Some(json) => match Config::from_json(&json) {
            Ok(config) => config,
            Err(e) => {
                report(RET_ERR, &e.to_string());
                return std::ptr::null_mut();
            }
        },
        None => Config::default(),
    };

    match RequestPipeline::new(config) {
        Ok(pipeline) => {
            report(RET_OK, "context created");
            Box::into_raw(Box::new(StowageCtx { pipeline }))
        }
        Err(e) => {
            report(RET_ERR, &e.to_string());
            std::ptr::null_mut()
        }
    }
}

/// Tear down a context: stop the worker, join it, free everything. After
/// this returns OK, no callbacks for earlier requests will arrive.
///
/// # Safety
/// `ctx` must be a pointer returned by [`stowage_new`], destroyed at most
/// once, with no other thread using it concurrently.
#[no_mangle]
pub unsafe extern "C" fn stowage_destroy(
    ctx: *mut StowageCtx,
    callback: Option<CompletionCallback>,
    user_data: *mut c_void,
) -> c_int {
    if ctx.is_null() {
        return RET_ERR;
    }
    drop(Box::from_raw(ctx));
    if let Some(cb) = callback {
        CallbackSlot::new(cb, user_data).report(RET_OK, b"destroyed");
    }
    RET_OK
}

macro_rules! simple_request {
    ($(#[$doc:meta])* $name:ident, $request:expr) => {
        $(#[$doc])*
        /// # Safety
        /// `ctx` must be a live pointer returned by [`stowage_new`].
        #[no_mangle]
        pub unsafe extern "C" fn $name(
            ctx: *mut StowageCtx,
            callback: Option<CompletionCallback>,
            user_data: *mut c_void,
        ) -> c_int {
            dispatch(ctx, $request, callback, user_data)
        }
    };
}

simple_request!(
    /// Start the node (REST server, background services).
    stowage_start,
    Request::Start
);
simple_request!(
    /// Stop the node, cancelling background work.
    stowage_stop,
    Request::Stop
);
simple_request!(
    /// Close the node; equivalent to stop, kept for lifecycle symmetry.
    stowage_close,
    Request::Close
);
simple_request!(
    /// Library version via callback.
    stowage_version,
    Request::Version
);
simple_request!(
    /// Source revision via callback.
    stowage_revision,
    Request::Revision
);
simple_request!(
    /// Data directory path via callback.
    stowage_repo,
    Request::Repo
);
simple_request!(
    /// Debug/info JSON via callback.
    stowage_debug,
    Request::DebugInfo
);
simple_request!(
    /// Encoded peer record via callback.
    stowage_spr,
    Request::Spr
);
simple_request!(
    /// Local peer id via callback.
    stowage_peer_id,
    Request::PeerId
);
simple_request!(
    /// Stored-manifest listing JSON via callback.
    stowage_list,
    Request::List
);
simple_request!(
    /// Storage accounting JSON via callback.
    stowage_space,
    Request::Space
);

/// Set the log level: TRACE, DEBUG, INFO, NOTICE, WARN, ERROR or FATAL.
///
/// # Safety
/// `ctx` must be a live context; `level` a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn stowage_log_level(
    ctx: *mut StowageCtx,
    level: *const c_char,
    callback: Option<CompletionCallback>,
    user_data: *mut c_void,
) -> c_int {
    let Some(level) = string_arg(level) else {
        return RET_ERR;
    };
    dispatch(ctx, Request::LogLevel { level }, callback, user_data)
}

/// Dial a peer at the given addresses.
///
/// # Safety
/// `peer_id` must be a valid NUL-terminated string; `addresses` must point
/// to `count` valid NUL-terminated strings (or be null with count 0).
#[no_mangle]
pub unsafe extern "C" fn stowage_connect(
    ctx: *mut StowageCtx,
    peer_id: *const c_char,
    addresses: *const *const c_char,
    count: usize,
    callback: Option<CompletionCallback>,
    user_data: *mut c_void,
) -> c_int {
    let Some(peer_id) = string_arg(peer_id) else {
        return RET_ERR;
    };
    let mut addrs = Vec::with_capacity(count);
    if !addresses.is_null() {
        for i in 0..count {
            if let Some(addr) = string_arg(*addresses.add(i)) {
                addrs.push(addr);
            }
        }
    }
    dispatch(ctx, Request::Connect { peer_id, addrs }, callback, user_data)
}

/// Open an upload session; the session id arrives via the callback.
///
/// # Safety
/// `ctx` must be a live context; `filepath` null or a valid string.
#[no_mangle]
pub unsafe extern "C" fn stowage_upload_init(
    ctx: *mut StowageCtx,
    filepath: *const c_char,
    chunk_size: u64,
    callback: Option<CompletionCallback>,
    user_data: *mut c_void,
) -> c_int {
    dispatch(
        ctx,
        Request::UploadInit {
            filepath: string_arg(filepath),
            chunk_size: clamp_chunk_size(chunk_size),
        },
        callback,
        user_data,
    )
}

/// Append bytes to an upload session. The buffer is copied before return.
///
/// # Safety
/// `session_id` must be a valid string; `bytes` must point to `len` bytes.
#[no_mangle]
pub unsafe extern "C" fn stowage_upload_chunk(
    ctx: *mut StowageCtx,
    session_id: *const c_char,
    bytes: *const u8,
    len: usize,
    callback: Option<CompletionCallback>,
    user_data: *mut c_void,
) -> c_int {
    let Some(session_id) = string_arg(session_id) else {
        return RET_ERR;
    };
    let data = if bytes.is_null() {
        Vec::new()
    } else {
        std::slice::from_raw_parts(bytes, len).to_vec()
    };
    dispatch(
        ctx,
        Request::UploadChunk { session_id, data },
        callback,
        user_data,
    )
}

macro_rules! session_request {
    ($(#[$doc:meta])* $name:ident, $variant:ident) => {
        $(#[$doc])*
        /// # Safety
        /// `ctx` must be a live context; `session_id` a valid string.
        #[no_mangle]
        pub unsafe extern "C" fn $name(
            ctx: *mut StowageCtx,
            session_id: *const c_char,
            callback: Option<CompletionCallback>,
            user_data: *mut c_void,
        ) -> c_int {
            let Some(session_id) = string_arg(session_id) else {
                return RET_ERR;
            };
            dispatch(ctx, Request::$variant { session_id }, callback, user_data)
        }
    };
}

session_request!(
    /// Finalize an upload session; the manifest CID arrives via the callback.
    stowage_upload_finalize,
    UploadFinalize
);
session_request!(
    /// Cancel an upload session, discarding buffered bytes.
    stowage_upload_cancel,
    UploadCancel
);
session_request!(
    /// Stream the session's file through the node, with PROGRESS callbacks.
    stowage_upload_file,
    UploadFile
);
session_request!(
    /// Read the next chunk of a download session via the callback.
    stowage_download_chunk,
    DownloadChunk
);
session_request!(
    /// Cancel a download session.
    stowage_download_cancel,
    DownloadCancel
);

/// Open a download session for `cid`; the session id arrives via the
/// callback.
///
/// # Safety
/// `ctx` must be a live context; `cid` a valid NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn stowage_download_init(
    ctx: *mut StowageCtx,
    cid: *const c_char,
    chunk_size: u64,
    local: bool,
    callback: Option<CompletionCallback>,
    user_data: *mut c_void,
) -> c_int {
    let Some(cid) = string_arg(cid) else {
        return RET_ERR;
    };
    dispatch(
        ctx,
        Request::DownloadInit {
            cid,
            chunk_size: clamp_chunk_size(chunk_size),
            local,
        },
        callback,
        user_data,
    )
}

/// Stream a dataset: every chunk arrives as a PROGRESS callback, optionally
/// mirrored to `filepath`; the terminal OK carries the byte count.
///
/// # Safety
/// `ctx` must be a live context; `cid` a valid string; `filepath` null or a
/// valid string.
#[no_mangle]
pub unsafe extern "C" fn stowage_download_stream(
    ctx: *mut StowageCtx,
    cid: *const c_char,
    chunk_size: u64,
    local: bool,
    filepath: *const c_char,
    callback: Option<CompletionCallback>,
    user_data: *mut c_void,
) -> c_int {
    let Some(cid) = string_arg(cid) else {
        return RET_ERR;
    };
    dispatch(
        ctx,
        Request::DownloadStream {
            cid,
            chunk_size: clamp_chunk_size(chunk_size),
            local,
            filepath: string_arg(filepath),
        },
        callback,
        user_data,
    )
}

macro_rules! cid_request {
    ($(#[$doc:meta])* $name:ident, $variant:ident) => {
        $(#[$doc])*
        /// # Safety
        /// `ctx` must be a live context; `cid` a valid NUL-terminated string.
        #[no_mangle]
        pub unsafe extern "C" fn $name(
            ctx: *mut StowageCtx,
            cid: *const c_char,
            callback: Option<CompletionCallback>,
            user_data: *mut c_void,
        ) -> c_int {
            let Some(cid) = string_arg(cid) else {
                return RET_ERR;
            };
            dispatch(ctx, Request::$variant { cid }, callback, user_data)
        }
    };
}

cid_request!(
    /// Fetch a manifest as JSON via the callback.
    stowage_download_manifest,
    DownloadManifest
);
cid_request!(
    /// Delete a block or a whole dataset.
    stowage_delete,
    Delete
);
cid_request!(
    /// Fetch a dataset from the network into the local store.
    stowage_fetch,
    Fetch
);
cid_request!(
    /// Local presence check; "true"/"false" via the callback.
    stowage_exists,
    Exists
);
