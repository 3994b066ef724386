//! Stowage - content-addressed storage node
//!
//! Clients upload byte streams; the node chunks, hashes and Merkle-commits
//! them into datasets retrievable by CID.

use std::error::Error;
use stowage_core::{logging, run_node, Config};

fn main() -> Result<(), Box<dyn Error>> {
    // Parse CLI arguments and build config
    let config = Config::from_cli()?;

    // Initialize logging
    logging::init(&config.log_level);

    tracing::info!("Starting stowage node...");

    // CPU-bound work (Merkle builds, repository IO) runs on the blocking
    // pool, capped at min(cpu count, 16) unless num-threads overrides it.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .max_blocking_threads(config.worker_threads().max(1))
        .build()?;

    runtime.block_on(run_node(config))?;
    Ok(())
}
