//! Disk storage for seed tasks.
//!
//! Three layers: [`DiskDriver`] performs raw byte-level file operations
//! under one base directory; the metadata types ([`FileMetadata`],
//! [`PieceMetaRecord`]) define the persisted formats; [`StorageManager`]
//! names everything per task and exposes the operations the rest of the
//! engine uses.
//!
//! # On-disk layout
//!
//! ```text
//! <base>/download/<id[..3]>/<id>           payload (positional writes)
//! <base>/download/<id[..3]>/<id>.meta      task metadata, JSON
//! <base>/download/<id[..3]>/<id>.piece     piece log, one record per line
//! <base>/upload/<id[..3]>/<id>             symlink to the payload
//! ```
//!
//! Piece-log lines may appear in any order; consumers sort by piece number
//! before use.

mod driver;
mod error;
mod manager;
mod meta;

pub use driver::{DiskDriver, StorageInfo};
pub use error::StorageError;
pub use manager::StorageManager;
pub use meta::{FileMetadata, PieceMetaRecord, PieceRange, PieceStyle};
