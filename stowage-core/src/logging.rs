//! Tracing setup with a runtime-reloadable level filter
//!
//! Initialized once per process, either by the binary or by the FFI layer.
//! The reload handle backs the FFI `log_level` request and the REST loglevel
//! endpoint.

use std::sync::OnceLock;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Registry};

static RELOAD: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();

/// Initialize the global subscriber. Safe to call more than once; later calls
/// are no-ops.
pub fn init(level: &str) {
    let (filter, handle) = reload::Layer::new(EnvFilter::new(normalize(level)));
    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());
    if subscriber.try_init().is_ok() {
        let _ = RELOAD.set(handle);
    }
}

/// Swap the active level filter.
pub fn set_level(level: &str) -> Result<(), String> {
    let handle = RELOAD
        .get()
        .ok_or_else(|| "logging not initialized".to_string())?;
    let filter =
        EnvFilter::try_new(normalize(level)).map_err(|e| format!("invalid level: {}", e))?;
    handle.reload(filter).map_err(|e| e.to_string())
}

/// Map foreign level names onto tracing levels. NOTICE sits between INFO and
/// WARN upstream; FATAL above ERROR.
fn normalize(level: &str) -> String {
    match level.to_ascii_uppercase().as_str() {
        "TRACE" => "trace",
        "DEBUG" => "debug",
        "INFO" | "NOTICE" => "info",
        "WARN" => "warn",
        "ERROR" | "FATAL" => "error",
        _ => return level.to_string(),
    }
    .to_string()
}
