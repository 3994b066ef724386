//! REST API wrapping the node engine
//!
//! The endpoints are thin adapters over the engine; no dataset logic lives
//! here. CORS headers derive from the configured allowed origin.

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::io::Cursor;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::engine::{EngineError, NodeEngine, StoreOptions};
use crate::logging;
use crate::manifest::ManifestView;

/// API state shared across handlers
#[derive(Clone)]
pub struct ApiState {
    pub engine: NodeEngine,
}

/// Create the REST router.
pub fn create_router(engine: NodeEngine, cors_allowed_origin: Option<&str>) -> Router {
    let state = ApiState { engine };

    let cors = match cors_allowed_origin {
        Some("*") => CorsLayer::new().allow_origin(Any).allow_methods(Any),
        Some(origin) => match origin.parse::<HeaderValue>() {
            Ok(value) => CorsLayer::new().allow_origin(value).allow_methods(Any),
            Err(_) => CorsLayer::new(),
        },
        None => CorsLayer::new(),
    };

    Router::new()
        .route("/api/stowage/v1/data", post(upload_data).get(list_data))
        .route("/api/stowage/v1/data/:cid", get(get_data).delete(delete_data))
        .route("/api/stowage/v1/data/:cid/network", post(fetch_network))
        .route(
            "/api/stowage/v1/data/:cid/network/stream",
            get(stream_network),
        )
        .route(
            "/api/stowage/v1/data/:cid/network/manifest",
            get(network_manifest),
        )
        .route("/api/stowage/v1/data/:cid/exists", get(data_exists))
        .route("/api/stowage/v1/space", get(space))
        .route("/api/stowage/v1/spr", get(spr))
        .route("/api/stowage/v1/peerid", get(peer_id))
        .route("/api/stowage/v1/connect/:peer_id", get(connect_peer))
        .route("/api/stowage/v1/debug/info", get(debug_info))
        .route("/api/stowage/v1/debug/chronicles/loglevel", post(set_log_level))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Validate an upload's Content-Type. The top-level type must be a
/// registered one; `hello/world` parses as a MIME but names no real type.
fn validate_mimetype(value: &str) -> Result<String, ApiError> {
    let invalid = || ApiError::InvalidMime(value.to_string());
    let mime: mime::Mime = value.parse().map_err(|_| invalid())?;
    const KNOWN: &[&str] = &[
        "application",
        "audio",
        "font",
        "image",
        "message",
        "model",
        "multipart",
        "text",
        "video",
    ];
    if !KNOWN.contains(&mime.type_().as_str()) {
        return Err(invalid());
    }
    Ok(mime.essence_str().to_string())
}

/// Pull a filename out of a Content-Disposition header.
fn filename_from_disposition(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::CONTENT_DISPOSITION)?.to_str().ok()?;
    value.split(';').find_map(|part| {
        let part = part.trim();
        part.strip_prefix("filename=")
            .map(|name| name.trim_matches('"').to_string())
    })
}

/// Store an uploaded body as a dataset (POST /api/stowage/v1/data).
/// Returns the manifest CID as plain text.
async fn upload_data(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: bytes::Bytes,
) -> Result<String, ApiError> {
    let mimetype = match headers.get(header::CONTENT_TYPE) {
        Some(value) => {
            let value = value
                .to_str()
                .map_err(|_| ApiError::InvalidMime("<unreadable>".to_string()))?;
            Some(validate_mimetype(value)?)
        }
        None => None,
    };
    let filename = filename_from_disposition(&headers);

    if body.is_empty() {
        return Err(ApiError::BadRequest("Empty upload body".to_string()));
    }

    info!(bytes = body.len(), "api: storing dataset");
    let cid = state
        .engine
        .store(
            Cursor::new(body),
            StoreOptions {
                filename,
                mimetype,
                ..StoreOptions::default()
            },
            None,
        )
        .await?;

    Ok(cid.to_string())
}

/// List stored manifests (GET /api/stowage/v1/data).
async fn list_data(State(state): State<ApiState>) -> Result<Json<serde_json::Value>, ApiError> {
    let mut content: Vec<serde_json::Value> = Vec::new();
    state
        .engine
        .iterate_manifests(|cid, manifest| {
            content.push(json!({
                "cid": cid.to_string(),
                "manifest": manifest.view(),
            }));
        })
        .await?;
    Ok(Json(json!({ "content": content })))
}

/// Stream a locally stored dataset (GET /api/stowage/v1/data/:cid).
async fn get_data(
    State(state): State<ApiState>,
    Path(cid): Path<String>,
) -> Result<Response, ApiError> {
    stream_dataset(state, &cid, true).await
}

/// Stream a dataset, fetching from the network as needed
/// (GET /api/stowage/v1/data/:cid/network/stream).
async fn stream_network(
    State(state): State<ApiState>,
    Path(cid): Path<String>,
) -> Result<Response, ApiError> {
    stream_dataset(state, &cid, false).await
}

async fn stream_dataset(state: ApiState, cid: &str, local: bool) -> Result<Response, ApiError> {
    let cid = crate::cid::parse_cid(cid).map_err(EngineError::from)?;
    let stream = state.engine.retrieve(&cid, local).await?;
    let body = Body::from_stream(stream.map(|chunk| chunk.map_err(std::io::Error::other)));
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        body,
    )
        .into_response())
}

/// Delete a dataset or block (DELETE /api/stowage/v1/data/:cid).
async fn delete_data(
    State(state): State<ApiState>,
    Path(cid): Path<String>,
) -> Result<StatusCode, ApiError> {
    let cid = crate::cid::parse_cid(&cid).map_err(EngineError::from)?;
    state.engine.delete(&cid).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Start a background network fetch (POST /api/stowage/v1/data/:cid/network).
async fn fetch_network(
    State(state): State<ApiState>,
    Path(cid): Path<String>,
) -> Result<Json<ManifestView>, ApiError> {
    let cid = crate::cid::parse_cid(&cid).map_err(EngineError::from)?;
    let manifest = state.engine.prefetch(&cid).await?;
    Ok(Json(manifest.view()))
}

/// Fetch a manifest (GET /api/stowage/v1/data/:cid/network/manifest).
async fn network_manifest(
    State(state): State<ApiState>,
    Path(cid): Path<String>,
) -> Result<Json<ManifestView>, ApiError> {
    let cid = crate::cid::parse_cid(&cid).map_err(EngineError::from)?;
    let manifest = state.engine.fetch_manifest(&cid).await?;
    Ok(Json(manifest.view()))
}

/// Local presence check (GET /api/stowage/v1/data/:cid/exists).
async fn data_exists(
    State(state): State<ApiState>,
    Path(cid): Path<String>,
) -> Result<Json<bool>, ApiError> {
    let cid = crate::cid::parse_cid(&cid).map_err(EngineError::from)?;
    Ok(Json(state.engine.has_local_block(&cid).await?))
}

/// Storage accounting (GET /api/stowage/v1/space).
async fn space(State(state): State<ApiState>) -> Result<Json<crate::store::SpaceReport>, ApiError> {
    Ok(Json(state.engine.space().await?))
}

async fn spr(State(state): State<ApiState>) -> String {
    state.engine.exchange_handle().spr()
}

async fn peer_id(State(state): State<ApiState>) -> String {
    state.engine.exchange_handle().local_peer_id()
}

/// Dial a peer (GET /api/stowage/v1/connect/:peer_id?addrs=...).
async fn connect_peer(
    State(state): State<ApiState>,
    Path(peer_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<String, ApiError> {
    let addrs: Vec<String> = params
        .get("addrs")
        .map(|joined| joined.split(',').map(str::to_string).collect())
        .unwrap_or_default();
    state
        .engine
        .exchange_handle()
        .connect(&peer_id, &addrs)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok("Successfully connected to peer".to_string())
}

async fn debug_info(State(state): State<ApiState>) -> Result<Json<serde_json::Value>, ApiError> {
    let space = state.engine.space().await?;
    Ok(Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "revision": option_env!("STOWAGE_REVISION").unwrap_or("unknown"),
        "peerId": state.engine.exchange_handle().local_peer_id(),
        "spr": state.engine.exchange_handle().spr(),
        "space": space,
    })))
}

#[derive(Deserialize)]
struct LogLevelParams {
    level: String,
}

/// Swap the log level (POST /api/stowage/v1/debug/chronicles/loglevel).
async fn set_log_level(Query(params): Query<LogLevelParams>) -> Result<StatusCode, ApiError> {
    logging::set_level(&params.level).map_err(ApiError::BadRequest)?;
    Ok(StatusCode::OK)
}

/// API error type
#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    InvalidMime(String),
    NotFound(String),
    Internal(String),
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::NotFound(what) => ApiError::NotFound(what),
            EngineError::NotAManifest(cid) => {
                ApiError::BadRequest(format!("CID {} is not a manifest", cid))
            }
            EngineError::InvalidArgument(msg) => ApiError::BadRequest(msg),
            EngineError::Cid(e) => ApiError::BadRequest(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::InvalidMime(value) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("The MIME type '{}' is not valid.", value),
            )
                .into_response(),
            ApiError::NotFound(what) => {
                (StatusCode::NOT_FOUND, format!("Not found: {}", what)).into_response()
            }
            ApiError::Internal(msg) => {
                error!("api error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response()
            }
        }
    }
}
