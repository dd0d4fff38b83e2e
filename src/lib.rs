//! WAL Sync - durable capture and transfer of wearable audio
//!
//! This crate moves Opus audio from a recording device into a crash-tolerant
//! local write-ahead log and on to an upload target. It features:
//!
//! - A JSON catalog of recording segments with a rolling backup
//! - Append-friendly binary frame files, one per segment
//! - Timer-driven chunking of live frame streams
//! - Backlog transfer from device storage over BLE or the device's WiFi AP
//! - A sequential, idempotent upload queue
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use wal_sync::{clock::SystemClock, wal::WalStore, upload::{OutboxUploader, UploadQueue}};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(WalStore::open("/tmp/wal-sync/wals", Arc::new(SystemClock)).await?);
//!
//!     // Push everything already on disk into the outbox
//!     let uploader = Arc::new(OutboxUploader::new("/tmp/wal-sync/outbox"));
//!     let queue = UploadQueue::new(store.clone(), uploader, None);
//!     if let Some(report) = queue.sync_all().await {
//!         println!("uploaded {} entries", report.uploaded);
//!     }
//!     Ok(())
//! }
//! ```

pub mod chunker;
pub mod cli;
pub mod clock;
pub mod config;
pub mod logging;
pub mod protocol;
pub mod service;
pub mod sync;
pub mod upload;
pub mod wal;

// Re-export commonly used types for convenience
pub use chunker::{ChunkerConfig, RecordingChunker};
pub use config::Settings;
pub use protocol::{is_valid_frame, Frame};
pub use service::WalSyncService;
pub use sync::{SyncError, SyncEvent, SyncOutcome, SyncProgress};
pub use upload::{AudioUploader, UploadError, UploadQueue};
pub use wal::{Codec, DeviceInfo, EntryStatus, StorageLocation, WalEntry, WalError, WalStore};

use thiserror::Error;

/// Errors that can occur anywhere in the sync engine
#[derive(Error, Debug)]
pub enum Error {
    /// Catalog or frame file failure
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Transfer session failure
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    /// Upload failure
    #[error("Upload error: {0}")]
    Upload(#[from] UploadError),
}

/// Result type alias for wal-sync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
