//! Write-ahead log of recording segments.
//!
//! The [`WalStore`] owns the catalog document and every frame file; other
//! components only reach the catalog through its methods.

pub mod catalog;
pub mod entry;
pub mod frame_file;
pub mod store;

pub use catalog::{Catalog, CatalogFiles, CatalogSource, CATALOG_VERSION};
pub use entry::{Codec, DeviceInfo, EntryStatus, StorageLocation, WalEntry};
pub use store::{FlushReport, StoreStats, SweepReport, WalStore};

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the catalog and frame files
#[derive(Error, Debug)]
pub enum WalError {
    /// Filesystem operation failed
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Catalog could not be encoded or decoded
    #[error("catalog serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// No entry with this id
    #[error("unknown WAL entry: {0}")]
    UnknownEntry(String),

    /// Entry has no frame file yet
    #[error("WAL entry {0} has no backing file")]
    NoBackingFile(String),

    /// Entry bytes are not on disk
    #[error("WAL entry {0} is not stored on disk")]
    NotOnDisk(String),

    /// Blocking writer task panicked or was cancelled
    #[error("catalog writer task failed: {0}")]
    Task(String),
}

impl WalError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        WalError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type WalResult<T> = std::result::Result<T, WalError>;
