//! rseed - an origin-facing seed engine
//!
//! This library implements the seed-task lifecycle of a peer-to-peer file
//! distribution fabric: on demand for a (URL, metadata) tuple it produces a
//! locally cached, piece-addressed artifact and streams piece-completion
//! events to subscribers while the fetch is still in progress. Peers pull
//! pieces from the engine rather than from the upstream origin.
//!
//! # Modules
//!
//! - [`engine`] - Trigger coordinator, cache detector, piece pipeline
//! - [`task`] - Seed tasks, fingerprint-keyed registry
//! - [`storage`] - Disk driver, piece/metadata formats, task namespace
//! - [`progress`] - Piece-event fan-out to subscribers
//! - [`source`] - Origin adapters (HTTP included, others pluggable)
//! - [`gc`] - Space reclamation for cold tasks
//! - [`bandwidth`] - Token-bucket rate limiting and the digest reader
//! - [`fingerprint`] - Deterministic task identity
//! - [`config`] / [`constants`] - Tuning
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use rseed::{
//!     ClientRegistry, Config, DiskDriver, GcSupervisor, HttpResourceClient, SeedEngine,
//!     SeedRequest, StorageManager,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::default();
//! let clients = Arc::new(
//!     ClientRegistry::new()
//!         .register("http", Arc::new(HttpResourceClient::new()?))
//!         .register("https", Arc::new(HttpResourceClient::new()?)),
//! );
//! let storage = Arc::new(StorageManager::new(DiskDriver::new(
//!     &config.storage.base_dir,
//!     config.storage.capacity,
//! )));
//! let engine = SeedEngine::new(config.clone(), clients, storage);
//! let gc = GcSupervisor::new(&engine, config.gc.clone());
//! let _gc_loop = gc.spawn();
//!
//! let (task_id, mut pieces) = engine
//!     .register(SeedRequest::new("http://example.com/artifact.bin"))
//!     .await?;
//! while let Some(piece) = pieces.recv().await {
//!     println!("piece {} ready ({} bytes)", piece.piece_num, piece.piece_len);
//! }
//! let task = engine.get_task(&task_id)?;
//! println!("final status: {:?}", task.status);
//! # Ok(())
//! # }
//! ```

pub mod bandwidth;
pub mod config;
pub mod constants;
pub mod digest;
pub mod engine;
pub mod fingerprint;
pub mod gc;
pub mod locker;
pub mod progress;
pub mod source;
pub mod storage;
pub mod task;

pub use bandwidth::{LimitedDigestReader, RateLimiter};
pub use config::{Config, GcConfig, PieceConfig, ProgressConfig, StorageConfig};
pub use digest::{DeclaredDigest, DigestAccumulator, DigestAlgorithm};
pub use engine::{
    BufferPool, CacheDetector, CacheResult, DownloadMetadata, EngineError, MetadataStore,
    PieceWriter, SeedEngine,
};
pub use fingerprint::{canonical_url, fingerprint};
pub use gc::GcSupervisor;
pub use locker::LockerPool;
pub use progress::{PieceEvent, ProgressBroker};
pub use source::{
    ByteStream, ClientRegistry, ExpireInfo, HttpResourceClient, ResourceClient, SourceError,
    SourceRequest,
};
pub use storage::{
    DiskDriver, FileMetadata, PieceMetaRecord, PieceRange, PieceStyle, StorageError,
    StorageManager,
};
pub use task::{SeedRequest, SeedTask, TaskError, TaskRegistry, TaskStatus};
