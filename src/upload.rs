//! Drives fully materialized entries to the cloud, one at a time.
//!
//! There is no retry policy here: an entry that fails stays `miss` and the
//! next `sync_all` pass picks it up again.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::protocol::Frame;
use crate::wal::frame_file;
use crate::wal::{Codec, WalEntry, WalError, WalStore};

/// Errors from a single entry upload
#[derive(Error, Debug)]
pub enum UploadError {
    /// The backend answered but did not take the audio
    #[error("Upload rejected: {0}")]
    Rejected(String),

    /// The backend could not be reached
    #[error("Upload transport error: {0}")]
    Transport(String),

    #[error("Outbox I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Manifest serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Wal(#[from] WalError),
}

/// Everything the backend needs to ingest one entry.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub user_id: Option<String>,
    pub entry: WalEntry,
    pub frames: Vec<Frame>,
}

/// The cloud ingestion backend. `Ok` means the audio was accepted.
#[async_trait]
pub trait AudioUploader: Send + Sync {
    async fn upload(&self, request: &UploadRequest) -> Result<(), UploadError>;
}

/// Counts from one `sync_all` pass
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct UploadReport {
    pub uploaded: usize,
    pub skipped: usize,
    pub failed: usize,
}

enum EntryUpload {
    Uploaded,
    Skipped,
}

/// Sequential upload driver over the store's uploadable entries.
pub struct UploadQueue {
    store: Arc<WalStore>,
    uploader: Arc<dyn AudioUploader>,
    user_id: Option<String>,
    running: AtomicBool,
}

struct RunningFlag<'a>(&'a AtomicBool);

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl UploadQueue {
    pub fn new(store: Arc<WalStore>, uploader: Arc<dyn AudioUploader>, user_id: Option<String>) -> Self {
        Self {
            store,
            uploader,
            user_id,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Upload every `miss` + `disk` entry in catalog order. Returns `None`
    /// without doing anything if a pass is already running.
    pub async fn sync_all(&self) -> Option<UploadReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Upload already in progress");
            return None;
        }
        let _running = RunningFlag(&self.running);

        let entries = self.store.uploadable().await;
        if entries.is_empty() {
            debug!("Nothing to upload");
            return Some(UploadReport::default());
        }
        info!("Uploading {} WAL entries", entries.len());

        let mut report = UploadReport::default();
        for entry in entries {
            match self.upload_entry(&entry).await {
                Ok(EntryUpload::Uploaded) => report.uploaded += 1,
                Ok(EntryUpload::Skipped) => report.skipped += 1,
                Err(e) => {
                    error!(entry_id = %entry.id, "Upload failed: {}", e);
                    report.failed += 1;
                }
            }
        }

        info!(
            uploaded = report.uploaded,
            skipped = report.skipped,
            failed = report.failed,
            "Upload pass finished"
        );
        Some(report)
    }

    async fn upload_entry(&self, entry: &WalEntry) -> Result<EntryUpload, UploadError> {
        let frames = self.store.read_frames(entry).await?;
        if frames.is_empty() {
            warn!(entry_id = %entry.id, "No frames recovered from file, skipping");
            return Ok(EntryUpload::Skipped);
        }

        let request = UploadRequest {
            user_id: self.user_id.clone(),
            entry: entry.clone(),
            frames,
        };
        self.uploader.upload(&request).await?;
        self.store
            .mark_synced(&entry.id, request.frames.len() as u64)
            .await?;
        info!(entry_id = %entry.id, frames = request.frames.len(), "Uploaded");
        Ok(EntryUpload::Uploaded)
    }
}

/// Sidecar describing an entry dropped into the outbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxManifest {
    pub entry_id: String,
    pub user_id: Option<String>,
    pub device: String,
    pub device_model: String,
    pub codec: Codec,
    pub sample_rate: u32,
    pub channels: u16,
    pub timer_start: i64,
    pub seconds: u64,
    pub frames: usize,
    pub audio_file: String,
    pub queued_at: DateTime<Utc>,
}

/// Hands entries to a local directory that a separate shipper drains.
///
/// The frame file lands first and the manifest last, both via rename, so a
/// manifest always refers to a complete audio file.
pub struct OutboxUploader {
    dir: PathBuf,
}

impl OutboxUploader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl AudioUploader for OutboxUploader {
    async fn upload(&self, request: &UploadRequest) -> Result<(), UploadError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| UploadError::Io {
                path: self.dir.clone(),
                source,
            })?;

        let audio_file = request.entry.derived_file_name();
        let audio_path = self.dir.join(&audio_file);
        frame_file::write_frames(&audio_path, &request.frames).await?;

        let manifest = OutboxManifest {
            entry_id: request.entry.id.clone(),
            user_id: request.user_id.clone(),
            device: request.entry.device.clone(),
            device_model: request.entry.device_model.clone(),
            codec: request.entry.codec,
            sample_rate: request.entry.sample_rate,
            channels: request.entry.channels,
            timer_start: request.entry.timer_start,
            seconds: request.entry.seconds,
            frames: request.frames.len(),
            audio_file: audio_file.clone(),
            queued_at: Utc::now(),
        };
        let json = serde_json::to_vec_pretty(&manifest)?;

        let manifest_path = audio_path.with_extension("json");
        let tmp = audio_path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|source| UploadError::Io {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, &manifest_path)
            .await
            .map_err(|source| UploadError::Io {
                path: manifest_path.clone(),
                source,
            })?;

        debug!(entry_id = %request.entry.id, path = %manifest_path.display(), "Queued in outbox");
        Ok(())
    }
}
