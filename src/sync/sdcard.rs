//! Backlog transfer over the BLE storage characteristic.
//!
//! One read command is sent at the device's current offset; the device then
//! streams standard (83 byte) or packed (440 byte) packets until it sends a
//! status byte. Everything received is committed to the WAL entry in a single
//! call at the end, including on stop or error.

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::device::{DeviceConnection, StorageCommand};
use super::throughput::running_rate;
use super::{
    Backlog, DeviceActivity, Producer, SessionSlot, SyncError, SyncEvent, SyncOutcome, SyncProgress,
    TimeoutPhase, TransferKind, TransferReporter, TransferSnapshot, TransferState,
};
use crate::protocol::{split_frames, standard_packet_frame, Frame, Packet, StatusSignal, STANDARD_FRAME_SIZE};
use crate::wal::WalStore;

#[derive(Debug, Clone)]
pub struct SdCardConfig {
    /// Backlogs shorter than this many seconds of audio are left on the device
    pub min_seconds_to_sync: u64,
    pub progress_interval: Duration,
    /// Give up when the stream is silent this long
    pub idle_timeout: Duration,
    pub file_num: u32,
}

impl Default for SdCardConfig {
    fn default() -> Self {
        Self {
            min_seconds_to_sync: 10,
            progress_interval: Duration::from_millis(500),
            idle_timeout: Duration::from_secs(30),
            file_num: 1,
        }
    }
}

enum PacketResult {
    Continue,
    Done,
    Failed(SyncError),
}

/// Frames and byte count accumulated by one pull.
#[derive(Debug, Default)]
struct SdTransfer {
    frames: Vec<Frame>,
    bytes: u64,
    dropped: usize,
}

impl SdTransfer {
    fn feed(&mut self, chunk: &[u8]) -> PacketResult {
        match Packet::classify(chunk) {
            Packet::Empty => PacketResult::Continue,
            Packet::Status(signal) => match signal {
                StatusSignal::Continue => PacketResult::Continue,
                StatusSignal::EndOfTransmission => PacketResult::Done,
                StatusSignal::UnknownCompletion(code) => {
                    debug!(code, "Unlisted status code, treating as end of transmission");
                    PacketResult::Done
                }
                StatusSignal::BadFileSize => PacketResult::Failed(SyncError::BadFileSize),
                StatusSignal::EmptyFile => PacketResult::Failed(SyncError::EmptyFile),
            },
            Packet::Standard(packet) => {
                match standard_packet_frame(packet) {
                    Some(frame) => {
                        self.frames.push(frame.to_vec());
                        self.bytes += STANDARD_FRAME_SIZE as u64;
                    }
                    None => self.dropped += 1,
                }
                PacketResult::Continue
            }
            Packet::Packed(block) | Packet::Irregular(block) => {
                let outcome = split_frames(block);
                self.frames.extend(outcome.frames);
                self.dropped += outcome.dropped;
                self.bytes += block.len() as u64;
                PacketResult::Continue
            }
        }
    }
}

enum SessionEnd {
    EndOfTransmission,
    StreamEnded,
    Stopped,
    Failed(SyncError),
}

/// Pulls device storage over BLE into the WAL.
pub struct SdCardSync {
    device: Arc<dyn DeviceConnection>,
    store: Arc<WalStore>,
    activity: DeviceActivity,
    config: SdCardConfig,
    reporter: TransferReporter,
    session: SessionSlot,
}

impl SdCardSync {
    pub fn new(
        device: Arc<dyn DeviceConnection>,
        store: Arc<WalStore>,
        activity: DeviceActivity,
        config: SdCardConfig,
        events: broadcast::Sender<SyncEvent>,
    ) -> Self {
        let reporter = TransferReporter::new(TransferKind::SdCard, config.progress_interval, events);
        Self {
            device,
            store,
            activity,
            config,
            reporter,
            session: SessionSlot::default(),
        }
    }

    pub fn snapshot(&self) -> TransferSnapshot {
        self.reporter.snapshot()
    }

    pub fn is_syncing(&self) -> bool {
        self.session.is_active()
    }

    /// Ask the running transfer to stop and commit what it has.
    pub fn stop_sync(&self) -> bool {
        self.session.cancel()
    }

    /// Erase the device's storage file.
    pub async fn clear_device_storage(&self) -> Result<(), SyncError> {
        let _claim = self.session.claim()?;
        if !self.device.is_connected().await {
            return Err(SyncError::DeviceNotConnected);
        }
        if !self
            .device
            .write_storage_command(self.config.file_num, StorageCommand::Clear, 0)
            .await
        {
            return Err(SyncError::TransferCommandFailed);
        }
        info!(file_num = self.config.file_num, "Cleared device storage");
        Ok(())
    }

    pub async fn start_sync(&self) -> Result<SyncOutcome, SyncError> {
        let claim = self.session.claim()?;
        let span = info_span!(
            "sdcard_sync",
            session = %Uuid::new_v4(),
            device = %self.device.device().id
        );

        self.reporter.begin();
        let result = self.run(&claim.token).instrument(span).await;
        match &result {
            Ok(outcome) => self.reporter.finish(outcome),
            Err(e) => {
                warn!("SD card sync failed: {}", e);
                self.reporter.fail(e);
            }
        }
        result
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<SyncOutcome, SyncError> {
        if !self.device.is_connected().await {
            return Err(SyncError::DeviceNotConnected);
        }
        let device = self.device.device();
        let _busy = self.activity.acquire(&device.id, Producer::SdCard)?;
        let codec = self.device.codec();

        let list = self.device.get_storage_list().await;
        let Some(backlog) = Backlog::from_storage_list(&list) else {
            info!("Device storage is empty");
            return Ok(SyncOutcome::NothingToSync { available_bytes: 0 });
        };
        let total = backlog.bytes_to_download();
        if !backlog.worth_syncing(codec, self.config.min_seconds_to_sync) {
            info!(available = total, "Not enough data to sync");
            return Ok(SyncOutcome::NothingToSync { available_bytes: total });
        }

        let entry = self
            .store
            .create_backlog_entry(
                &device,
                codec,
                backlog.total_bytes,
                backlog.current_offset,
                self.config.file_num,
            )
            .await?;

        self.reporter.set_state(TransferState::Transferring);

        // Subscribe before the read command so no packet is missed.
        let mut stream = self.device.storage_byte_stream().await;
        if !self
            .device
            .write_storage_command(self.config.file_num, StorageCommand::Read, backlog.current_offset)
            .await
        {
            return Err(SyncError::TransferCommandFailed);
        }
        info!(
            entry_id = %entry.id,
            offset = backlog.current_offset,
            bytes = total,
            "Reading device storage"
        );

        let started = Instant::now();
        let mut transfer = SdTransfer::default();
        self.reporter.progress(SyncProgress::new(total, 0, 0, 0.0), true);

        let end = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break SessionEnd::Stopped,
                next = timeout(self.config.idle_timeout, stream.next()) => next,
            };
            match next {
                Err(_) => {
                    warn!(idle = ?self.config.idle_timeout, "Storage stream went silent");
                    break SessionEnd::Failed(SyncError::Timeout(TimeoutPhase::Stream));
                }
                Ok(None) => break SessionEnd::StreamEnded,
                Ok(Some(Err(e))) => break SessionEnd::Failed(SyncError::Stream(e.to_string())),
                Ok(Some(Ok(chunk))) => match transfer.feed(&chunk) {
                    PacketResult::Continue => {
                        let rate = running_rate(started, Instant::now(), transfer.bytes);
                        self.reporter.progress(
                            SyncProgress::new(total, transfer.bytes, transfer.frames.len(), rate),
                            false,
                        );
                    }
                    PacketResult::Done => break SessionEnd::EndOfTransmission,
                    PacketResult::Failed(e) => break SessionEnd::Failed(e),
                },
            }
        };
        drop(stream);

        debug!(
            frames = transfer.frames.len(),
            bytes = transfer.bytes,
            dropped = transfer.dropped,
            "Storage stream finished"
        );
        let rate = running_rate(started, Instant::now(), transfer.bytes);
        self.reporter.progress(
            SyncProgress::new(total, transfer.bytes, transfer.frames.len(), rate),
            true,
        );
        self.commit(&entry.id, total, transfer, end).await
    }

    async fn commit(
        &self,
        entry_id: &str,
        total: u64,
        transfer: SdTransfer,
        end: SessionEnd,
    ) -> Result<SyncOutcome, SyncError> {
        let frames = transfer.frames.len();
        let bytes = transfer.bytes;

        match end {
            SessionEnd::EndOfTransmission => {
                // Only bytes actually seen advance the cursor; a short range
                // stays on the card for the next session.
                let entry = self
                    .store
                    .apply_downloaded_bytes(entry_id, bytes, &transfer.frames)
                    .await?;
                if bytes < total {
                    warn!(entry_id, bytes, expected = total, "Device ended transfer early");
                }
                info!(entry_id, frames, bytes, remaining = entry.remaining_bytes(), "SD card sync completed");
                Ok(SyncOutcome::Completed {
                    entry_id: entry_id.to_string(),
                    frames,
                    bytes,
                })
            }
            SessionEnd::StreamEnded => {
                if bytes > 0 {
                    self.store
                        .apply_downloaded_bytes(entry_id, bytes, &transfer.frames)
                        .await?;
                }
                info!(entry_id, frames, bytes, "Storage stream ended");
                Ok(SyncOutcome::Completed {
                    entry_id: entry_id.to_string(),
                    frames,
                    bytes,
                })
            }
            SessionEnd::Stopped => {
                if frames > 0 {
                    self.store
                        .apply_downloaded_bytes(entry_id, bytes, &transfer.frames)
                        .await?;
                }
                info!(entry_id, frames, bytes, "SD card sync stopped");
                Ok(SyncOutcome::Stopped {
                    entry_id: entry_id.to_string(),
                    frames,
                    bytes,
                })
            }
            SessionEnd::Failed(e) => {
                if frames > 0 {
                    match self
                        .store
                        .apply_downloaded_bytes(entry_id, bytes, &transfer.frames)
                        .await
                    {
                        Ok(_) => info!(entry_id, frames, "Kept partial transfer"),
                        Err(commit) => error!(entry_id, "Could not keep partial transfer: {}", commit),
                    }
                }
                Err(e)
            }
        }
    }
}
