use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::catalog::{Catalog, CatalogFiles, CatalogSource};
use super::entry::{Codec, DeviceInfo, EntryStatus, StorageLocation, WalEntry};
use super::frame_file;
use super::{WalError, WalResult};
use crate::clock::Clock;
use crate::protocol::Frame;

const SECONDS_PER_DAY: i64 = 86_400;

/// Owner of the catalog and the frame files.
///
/// Every mutation takes the state lock, applies the change, and saves the
/// catalog before releasing it, so two writers never interleave on one entry.
pub struct WalStore {
    dir: PathBuf,
    files: CatalogFiles,
    clock: Arc<dyn Clock>,
    state: Mutex<StoreState>,
}

struct StoreState {
    catalog: Catalog,
    /// Frames cut by the chunker that have not reached their file yet.
    resident: HashMap<String, Vec<Frame>>,
}

/// Result of a resident-frame flush
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushReport {
    pub written: usize,
    pub failed: usize,
    pub recovered: usize,
    pub corrupted: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub removed: usize,
    pub files_deleted: usize,
}

/// Catalog summary for status output
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub total: usize,
    pub in_progress: usize,
    pub miss: usize,
    pub synced: usize,
    pub corrupted: usize,
    pub memory: usize,
    pub disk: usize,
    pub sdcard: usize,
    pub flash_page: usize,
    pub uploadable: usize,
    pub resident_frames: usize,
    pub bytes_on_disk: u64,
}

impl WalStore {
    /// Open (or create) a store rooted at `dir`. A damaged catalog never fails
    /// this call; see [`CatalogFiles::load`].
    pub async fn open(dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> WalResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| WalError::io(&dir, e))?;

        let files = CatalogFiles::in_dir(&dir);
        let loader = files.clone();
        let (catalog, source) = tokio::task::spawn_blocking(move || loader.load())
            .await
            .map_err(|e| WalError::Task(e.to_string()))?;

        info!(
            dir = %dir.display(),
            entries = catalog.entries.len(),
            ?source,
            "Opened WAL store"
        );
        if source == CatalogSource::Backup {
            warn!("WAL catalog restored from backup; recent changes may be missing");
        }

        Ok(Self {
            dir,
            files,
            clock,
            state: Mutex::new(StoreState {
                catalog,
                resident: HashMap::new(),
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Absolute path of the entry's frame file, if it has one.
    pub fn entry_path(&self, entry: &WalEntry) -> Option<PathBuf> {
        entry.file_name.as_ref().map(|name| self.dir.join(name))
    }

    pub async fn get(&self, id: &str) -> Option<WalEntry> {
        self.state.lock().await.catalog.get(id).cloned()
    }

    pub async fn entries(&self) -> Vec<WalEntry> {
        self.state.lock().await.catalog.entries.clone()
    }

    /// Entries still waiting on transfer or upload.
    pub async fn pending(&self) -> Vec<WalEntry> {
        self.filtered(WalEntry::is_pending).await
    }

    /// Entries fully on disk and not yet accepted upstream.
    pub async fn uploadable(&self) -> Vec<WalEntry> {
        self.filtered(WalEntry::is_uploadable).await
    }

    async fn filtered(&self, keep: fn(&WalEntry) -> bool) -> Vec<WalEntry> {
        let state = self.state.lock().await;
        state
            .catalog
            .entries
            .iter()
            .filter(|e| keep(e))
            .cloned()
            .collect()
    }

    pub async fn stats(&self) -> StoreStats {
        let (mut stats, paths) = {
            let state = self.state.lock().await;
            let mut stats = StoreStats {
                total: state.catalog.entries.len(),
                resident_frames: state.resident.values().map(Vec::len).sum(),
                ..StoreStats::default()
            };
            for entry in &state.catalog.entries {
                match entry.status {
                    EntryStatus::InProgress => stats.in_progress += 1,
                    EntryStatus::Miss => stats.miss += 1,
                    EntryStatus::Synced => stats.synced += 1,
                    EntryStatus::Corrupted => stats.corrupted += 1,
                }
                match entry.storage {
                    StorageLocation::Memory => stats.memory += 1,
                    StorageLocation::Disk => stats.disk += 1,
                    StorageLocation::Sdcard => stats.sdcard += 1,
                    StorageLocation::FlashPage => stats.flash_page += 1,
                }
                if entry.is_uploadable() {
                    stats.uploadable += 1;
                }
            }
            let paths: Vec<PathBuf> = state
                .catalog
                .entries
                .iter()
                .filter_map(|e| self.entry_path(e))
                .collect();
            (stats, paths)
        };

        for path in paths {
            if let Ok(meta) = tokio::fs::metadata(&path).await {
                stats.bytes_on_disk += meta.len();
            }
        }
        stats
    }

    /// Write the catalog as it stands.
    pub async fn save(&self) -> WalResult<()> {
        let mut state = self.state.lock().await;
        self.persist(&mut state).await
    }

    async fn persist(&self, state: &mut StoreState) -> WalResult<()> {
        state.catalog.timestamp_ms = self.clock.now().timestamp_millis();
        self.files.save(&state.catalog).await
    }

    /// Record that `frame_count` frames exist for the segment starting at
    /// `start`. Repeated calls for the same segment add up.
    pub async fn upsert_recording_entry(
        &self,
        device: &DeviceInfo,
        codec: Codec,
        start: i64,
        frame_count: u64,
    ) -> WalResult<WalEntry> {
        let mut state = self.state.lock().await;
        let entry = upsert_locked(&mut state.catalog, device, codec, start, frame_count);
        self.persist(&mut state).await?;
        Ok(entry)
    }

    /// Upsert the segment and append `frames` to its file in one step.
    ///
    /// If the file write fails the frames are held in memory and the entry
    /// stays `memory` until [`WalStore::flush_resident`] succeeds.
    pub async fn record_chunk(
        &self,
        device: &DeviceInfo,
        codec: Codec,
        start: i64,
        frames: Vec<Frame>,
    ) -> WalResult<WalEntry> {
        let mut state = self.state.lock().await;
        let entry = upsert_locked(&mut state.catalog, device, codec, start, frames.len() as u64);

        if let Err(e) = self.write_resident(&mut state, &entry.id, frames).await {
            warn!(entry_id = %entry.id, "Chunk write failed, keeping frames in memory: {}", e);
        }

        self.persist(&mut state).await?;
        Ok(state.catalog.get(&entry.id).cloned().unwrap_or(entry))
    }

    async fn write_resident(
        &self,
        state: &mut StoreState,
        id: &str,
        frames: Vec<Frame>,
    ) -> WalResult<()> {
        let file_name = {
            let entry = state
                .catalog
                .get(id)
                .ok_or_else(|| WalError::UnknownEntry(id.to_string()))?;
            entry
                .file_name
                .clone()
                .unwrap_or_else(|| entry.derived_file_name())
        };

        let mut pending = state.resident.remove(id).unwrap_or_default();
        pending.extend(frames);
        let path = self.dir.join(&file_name);

        if let Err(e) = frame_file::append_frames(&path, &pending).await {
            state.resident.insert(id.to_string(), pending);
            return Err(e);
        }

        if let Some(entry) = state.catalog.get_mut(id) {
            entry.file_name = Some(file_name);
            if entry.storage == StorageLocation::Memory {
                entry.storage = StorageLocation::Disk;
            }
        }
        debug!(entry_id = %id, frames = pending.len(), "Wrote frames to disk");
        Ok(())
    }

    /// Push every memory-resident entry to disk.
    ///
    /// A `memory` entry with no resident frames was lost before it reached
    /// disk: it becomes `disk` if a partial file survived, else `corrupted`.
    pub async fn flush_resident(&self) -> WalResult<FlushReport> {
        let mut state = self.state.lock().await;
        let mut report = FlushReport::default();

        let ids: Vec<String> = state
            .catalog
            .entries
            .iter()
            .filter(|e| e.storage == StorageLocation::Memory)
            .map(|e| e.id.clone())
            .collect();

        for id in ids {
            if state.resident.contains_key(&id) {
                match self.write_resident(&mut state, &id, Vec::new()).await {
                    Ok(()) => report.written += 1,
                    Err(e) => {
                        warn!(entry_id = %id, "Flush failed, will retry: {}", e);
                        report.failed += 1;
                    }
                }
                continue;
            }

            let path = state.catalog.get(&id).and_then(|e| self.entry_path(e));
            let survived = match path {
                Some(path) => tokio::fs::try_exists(&path).await.unwrap_or(false),
                None => false,
            };
            if let Some(entry) = state.catalog.get_mut(&id) {
                if survived {
                    warn!(entry_id = %id, "Memory entry has a partial file, moving to disk");
                    entry.storage = StorageLocation::Disk;
                    report.recovered += 1;
                } else {
                    warn!(entry_id = %id, "Memory entry lost its frames, marking corrupted");
                    entry.status = EntryStatus::Corrupted;
                    report.corrupted += 1;
                }
            }
        }

        if report != FlushReport::default() {
            self.persist(&mut state).await?;
        }
        Ok(report)
    }

    /// Insert an entry for audio still on device storage.
    pub async fn create_backlog_entry(
        &self,
        device: &DeviceInfo,
        codec: Codec,
        total_bytes: u64,
        current_offset: u64,
        file_num: u32,
    ) -> WalResult<WalEntry> {
        let mut state = self.state.lock().await;
        let (start, existing) = claim_slot(&state.catalog, &device.id, self.clock.now_epoch(), |e| {
            e.storage == StorageLocation::Sdcard && e.storage_total_bytes == total_bytes
        });
        if let Some(existing) = existing {
            debug!(entry_id = %existing.id, "Backlog entry already exists");
            return Ok(existing);
        }

        let entry = WalEntry::backlog(device, codec, start, total_bytes, current_offset, file_num);
        info!(
            entry_id = %entry.id,
            total_bytes,
            current_offset,
            frames = entry.total_frames,
            "Created backlog entry"
        );
        state.catalog.entries.push(entry.clone());
        self.persist(&mut state).await?;
        Ok(entry)
    }

    /// Commit bytes pulled from device storage.
    ///
    /// The first commit replaces the size-derived frame estimate with the real
    /// count; later commits append. Once the device cursor reaches the end the
    /// entry moves to disk.
    pub async fn apply_downloaded_bytes(
        &self,
        entry_id: &str,
        downloaded_bytes: u64,
        frames: &[Frame],
    ) -> WalResult<WalEntry> {
        let mut state = self.state.lock().await;
        let (existing_file, file_name) = {
            let entry = state
                .catalog
                .get(entry_id)
                .ok_or_else(|| WalError::UnknownEntry(entry_id.to_string()))?;
            (
                entry.file_name.clone(),
                entry
                    .file_name
                    .clone()
                    .unwrap_or_else(|| entry.derived_file_name()),
            )
        };

        if !frames.is_empty() {
            let path = self.dir.join(&file_name);
            if existing_file.is_some() {
                frame_file::append_frames(&path, frames).await?;
            } else {
                frame_file::write_frames(&path, frames).await?;
            }
        }

        let entry = state
            .catalog
            .get_mut(entry_id)
            .ok_or_else(|| WalError::UnknownEntry(entry_id.to_string()))?;

        entry.storage_offset = (entry.storage_offset + downloaded_bytes).min(entry.storage_total_bytes);
        if !frames.is_empty() {
            if existing_file.is_some() {
                entry.total_frames += frames.len() as u64;
            } else {
                entry.total_frames = frames.len() as u64;
            }
            entry.file_name = Some(file_name);
        }

        if entry.storage_offset >= entry.storage_total_bytes && entry.storage != StorageLocation::Disk {
            if entry.file_name.is_some() {
                entry.original_storage = Some(entry.storage);
                entry.storage = StorageLocation::Disk;
            } else {
                warn!(entry_id, "Transfer finished without a single frame");
                entry.status = EntryStatus::Corrupted;
            }
        }

        let updated = entry.clone();
        debug!(
            entry_id,
            offset = updated.storage_offset,
            total = updated.storage_total_bytes,
            frames = updated.total_frames,
            "Applied downloaded bytes"
        );
        self.persist(&mut state).await?;
        Ok(updated)
    }

    /// Record that the first `uploaded_frames` frames of an entry were
    /// accepted upstream. The entry only turns `synced` when that covers
    /// every frame; anything appended since the upload read keeps it `miss`.
    pub async fn mark_synced(&self, entry_id: &str, uploaded_frames: u64) -> WalResult<WalEntry> {
        let mut state = self.state.lock().await;
        let entry = state
            .catalog
            .get_mut(entry_id)
            .ok_or_else(|| WalError::UnknownEntry(entry_id.to_string()))?;
        if entry.storage != StorageLocation::Disk {
            return Err(WalError::NotOnDisk(entry_id.to_string()));
        }
        entry.synced_frame_offset = uploaded_frames.min(entry.total_frames);
        if entry.synced_frame_offset >= entry.total_frames {
            entry.status = EntryStatus::Synced;
        } else {
            debug!(
                entry_id,
                uploaded = uploaded_frames,
                total = entry.total_frames,
                "Frames arrived during upload, keeping entry open"
            );
        }
        let updated = entry.clone();
        self.persist(&mut state).await?;
        Ok(updated)
    }

    pub async fn read_frames(&self, entry: &WalEntry) -> WalResult<Vec<Frame>> {
        let path = self
            .entry_path(entry)
            .ok_or_else(|| WalError::NoBackingFile(entry.id.clone()))?;
        frame_file::read_frames(&path).await
    }

    /// Remove synced entries that started more than `older_than_days` ago,
    /// along with their files.
    pub async fn sweep(&self, older_than_days: u32) -> WalResult<SweepReport> {
        let mut state = self.state.lock().await;
        let cutoff = self.clock.now_epoch() - older_than_days as i64 * SECONDS_PER_DAY;
        let mut report = SweepReport::default();
        let mut removed = Vec::new();

        for entry in &state.catalog.entries {
            if entry.status != EntryStatus::Synced || entry.timer_start >= cutoff {
                continue;
            }
            if let Some(path) = self.entry_path(entry) {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => report.files_deleted += 1,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        warn!(entry_id = %entry.id, "Could not delete {}: {}", path.display(), e);
                        continue;
                    }
                }
            }
            removed.push(entry.id.clone());
        }

        if removed.is_empty() {
            return Ok(report);
        }

        state.catalog.entries.retain(|e| !removed.contains(&e.id));
        report.removed = removed.len();
        info!(removed = report.removed, files = report.files_deleted, "Retention sweep");
        self.persist(&mut state).await?;
        Ok(report)
    }
}

/// First segment start at or after `start` whose id is either free or held
/// by an entry `reusable` accepts.
fn claim_slot(
    catalog: &Catalog,
    device_id: &str,
    mut start: i64,
    reusable: impl Fn(&WalEntry) -> bool,
) -> (i64, Option<WalEntry>) {
    loop {
        match catalog.get(&WalEntry::entry_id(device_id, start)) {
            None => return (start, None),
            Some(entry) if reusable(entry) => return (start, Some(entry.clone())),
            Some(entry) => {
                debug!(entry_id = %entry.id, "Segment id taken by another source, shifting start");
                start += 1;
            }
        }
    }
}

fn upsert_locked(
    catalog: &mut Catalog,
    device: &DeviceInfo,
    codec: Codec,
    start: i64,
    frame_count: u64,
) -> WalEntry {
    let (start, reused) = claim_slot(catalog, &device.id, start, |e| !e.is_backlog());
    let id = WalEntry::entry_id(&device.id, start);
    let existing = if reused.is_some() { catalog.get_mut(&id) } else { None };
    match existing {
        Some(existing) => {
            existing.total_frames += frame_count;
            existing.seconds = (existing.total_frames / existing.codec.fps()).max(1);
            if frame_count > 0 && existing.storage == StorageLocation::Disk {
                existing.storage = StorageLocation::Memory;
            }
            if existing.status == EntryStatus::Synced {
                warn!(entry_id = %id, "New frames for a synced entry, reopening it");
                existing.status = EntryStatus::Miss;
            }
            debug!(entry_id = %id, added = frame_count, total = existing.total_frames, "Merged chunk");
            existing.clone()
        }
        None => {
            let entry = WalEntry::recording(device, codec, start, frame_count);
            debug!(entry_id = %id, frames = frame_count, "New recording entry");
            catalog.entries.push(entry.clone());
            entry
        }
    }
}
