//! Configuration management
//!
//! The node is configured with a JSON document (the FFI `new` payload, or a
//! file named on the CLI) plus CLI flag overrides. Decoding is strict:
//! unknown fields are rejected so operator typos fail at creation instead of
//! being silently ignored.

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Parser, Debug)]
#[command(name = "stowage")]
#[command(about = "Content-addressed storage node in Rust", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the storage node
    Start(StartCommand),
}

#[derive(Parser, Debug, Clone)]
pub struct StartCommand {
    /// Data directory for keys and the block repository
    #[arg(long, default_value = "./data")]
    pub data_dir: PathBuf,

    /// HTTP port for the REST API
    #[arg(long, default_value_t = 8080)]
    pub api_port: u16,

    /// UDP port for peer discovery
    #[arg(long, default_value_t = 8090)]
    pub disc_port: u16,

    /// Listen multiaddr (can be specified multiple times)
    #[arg(long)]
    pub listen_addrs: Vec<String>,

    /// Bootstrap node record (can be specified multiple times)
    #[arg(long)]
    pub bootstrap_node: Vec<String>,

    /// Storage quota in bytes (0 = unlimited)
    #[arg(long, default_value_t = 0)]
    pub storage_quota: u64,

    /// Default block TTL in seconds
    #[arg(long, default_value_t = 30 * 24 * 60 * 60)]
    pub block_ttl: u64,

    /// Logging level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Allowed CORS origin for the REST API
    #[arg(long)]
    pub api_cors_allowed_origin: Option<String>,

    /// Optional JSON config file; CLI flags override its values
    #[arg(long)]
    pub config_file: Option<PathBuf>,
}

/// Node configuration. JSON keys are kebab-case.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    pub data_dir: PathBuf,
    pub log_level: String,
    pub api_port: u16,
    pub disc_port: u16,
    pub listen_addrs: Vec<String>,
    pub bootstrap_node: Vec<String>,
    pub nat: Option<String>,
    pub storage_quota: u64,
    pub block_ttl: u64,
    pub num_threads: usize,
    pub block_retries: u32,
    pub api_cors_allowed_origin: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: PathBuf::from("./data"),
            log_level: "info".to_string(),
            api_port: 8080,
            disc_port: 8090,
            listen_addrs: vec!["/ip4/0.0.0.0/tcp/8070".to_string()],
            bootstrap_node: Vec::new(),
            nat: None,
            storage_quota: 0,
            block_ttl: 30 * 24 * 60 * 60,
            num_threads: 0,
            block_retries: 3,
            api_cors_allowed_origin: None,
        }
    }
}

impl Config {
    /// Parse config from CLI arguments.
    pub fn from_cli() -> Result<Self, ConfigError> {
        let cli = Cli::parse();
        match cli.command {
            Commands::Start(cmd) => Self::from_start_command(cmd),
        }
    }

    /// Build config from a start command, loading the config file first when
    /// one is named.
    pub fn from_start_command(cmd: StartCommand) -> Result<Self, ConfigError> {
        let mut config = match &cmd.config_file {
            Some(path) => Self::load_from_file(path)?,
            None => Config::default(),
        };

        config.data_dir = cmd.data_dir;
        config.api_port = cmd.api_port;
        config.disc_port = cmd.disc_port;
        config.storage_quota = cmd.storage_quota;
        config.block_ttl = cmd.block_ttl;
        config.log_level = cmd.log_level;
        if !cmd.listen_addrs.is_empty() {
            config.listen_addrs = cmd.listen_addrs;
        }
        if !cmd.bootstrap_node.is_empty() {
            config.bootstrap_node = cmd.bootstrap_node;
        }
        if cmd.api_cors_allowed_origin.is_some() {
            config.api_cors_allowed_origin = cmd.api_cors_allowed_origin;
        }
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON config document (strict: unknown fields are rejected).
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("data-dir must not be empty".into()));
        }
        Ok(())
    }

    /// Worker pool size for CPU-bound work: `num-threads`, or
    /// `min(cpu count, 16)` when unset.
    pub fn worker_threads(&self) -> usize {
        if self.num_threads > 0 {
            self.num_threads
        } else {
            num_cpus::get().min(16)
        }
    }
}
