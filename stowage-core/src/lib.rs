//! Stowage Core
//!
//! Content-addressed storage node: chunking, Merkle trees, block
//! repositories, the dataset engine, upload/download sessions, the REST
//! surface and the FFI request pipeline.

pub mod api;
pub mod block;
pub mod chunker;
pub mod cid;
pub mod config;
pub mod download;
pub mod engine;
pub mod exchange;
pub mod ffi;
pub mod identity;
pub mod logging;
pub mod manifest;
pub mod merkle;
pub mod pipeline;
pub mod repo;
pub mod runtime;
pub mod store;
pub mod upload;

pub use block::{Block, BlockError};
pub use chunker::Chunker;
pub use config::Config;
pub use download::{DownloadError, DownloadManager};
pub use engine::{
    EngineError, NodeEngine, OnBatch, OnBlockStored, StoreOptions, DEFAULT_BATCH_SIZE,
    MAX_ON_BATCH_BLOCKS,
};
pub use exchange::{BlockExchange, ExchangeError, OfflineExchange};
pub use identity::{IdentityError, NodeIdentity};
pub use manifest::{Manifest, ManifestError, DEFAULT_BLOCK_SIZE};
pub use merkle::{CompressorId, MerkleError, MerkleProof, MerkleTree};
pub use pipeline::{PipelineError, RequestPipeline};
pub use repo::RepoStore;
pub use runtime::run_node;
pub use store::{BlockStore, ListKind, MemoryStore, SpaceReport, StoreError};
pub use upload::{UploadError, UploadManager};

// Re-export the CID type for external use.
pub use ::cid::Cid;
