use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::chunker::RecordingChunker;
use crate::clock::{Clock, SystemClock};
use crate::config::Settings;
use crate::sync::{DeviceActivity, DeviceConnection, SdCardSync, SyncEvent, WifiSync};
use crate::upload::{AudioUploader, OutboxUploader, UploadQueue, UploadReport};
use crate::wal::{StoreStats, SweepReport, WalEntry, WalStore};
use crate::Result;

const EVENT_CAPACITY: usize = 256;
const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Catalog summary for status output.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub data_dir: String,
    pub stats: StoreStats,
    pub pending: Vec<WalEntry>,
}

/// Wires the store, producers and upload queue from one [`Settings`].
///
/// Producers built from the same service share its device activity registry
/// and event bus, so at most one of them writes for a given device at a time.
pub struct WalSyncService {
    settings: Settings,
    clock: Arc<dyn Clock>,
    store: Arc<WalStore>,
    activity: DeviceActivity,
    events: broadcast::Sender<SyncEvent>,
    uploads: UploadQueue,
}

impl WalSyncService {
    /// Open with the system clock and the outbox uploader.
    pub async fn open(settings: Settings) -> Result<Self> {
        let uploader = Arc::new(OutboxUploader::new(settings.outbox_dir()));
        Self::with_parts(settings, Arc::new(SystemClock), uploader).await
    }

    pub async fn with_parts(
        settings: Settings,
        clock: Arc<dyn Clock>,
        uploader: Arc<dyn AudioUploader>,
    ) -> Result<Self> {
        let store = Arc::new(WalStore::open(settings.wal.data_dir.clone(), clock.clone()).await?);
        let uploads = UploadQueue::new(store.clone(), uploader, settings.upload.user_id.clone());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            settings,
            clock,
            store,
            activity: DeviceActivity::new(),
            events,
            uploads,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<WalStore> {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn recording_chunker(&self) -> RecordingChunker {
        RecordingChunker::new(
            self.store.clone(),
            self.clock.clone(),
            self.activity.clone(),
            self.settings.chunker_config(),
        )
    }

    pub fn sdcard_sync(&self, device: Arc<dyn DeviceConnection>) -> SdCardSync {
        SdCardSync::new(
            device,
            self.store.clone(),
            self.activity.clone(),
            self.settings.sdcard_config(),
            self.events.clone(),
        )
    }

    pub fn wifi_sync(&self, device: Arc<dyn DeviceConnection>) -> WifiSync {
        WifiSync::new(
            device,
            self.store.clone(),
            self.activity.clone(),
            self.settings.wifi_config(),
            self.events.clone(),
        )
    }

    /// One upload pass; `None` if a pass is already running.
    pub async fn sync_uploads(&self) -> Option<UploadReport> {
        self.uploads.sync_all().await
    }

    /// Retention sweep, defaulting to the configured horizon.
    pub async fn sweep(&self, older_than_days: Option<u32>) -> Result<SweepReport> {
        let days = older_than_days.unwrap_or(self.settings.wal.retention_days);
        Ok(self.store.sweep(days).await?)
    }

    pub async fn status(&self) -> StatusReport {
        StatusReport {
            data_dir: self.store.dir().display().to_string(),
            stats: self.store.stats().await,
            pending: self.store.pending().await,
        }
    }

    /// Upload and sweep on their intervals until `shutdown` fires.
    pub async fn run_until(&self, shutdown: CancellationToken) {
        let every = Duration::from_secs(self.settings.upload.interval_secs.max(1));
        let mut upload_tick = interval(every);
        let mut sweep_tick = interval(SWEEP_INTERVAL);
        upload_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            upload_every = ?every,
            retention_days = self.settings.wal.retention_days,
            "WAL sync daemon running"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = upload_tick.tick() => {
                    self.sync_uploads().await;
                }
                _ = sweep_tick.tick() => {
                    if let Err(e) = self.sweep(None).await {
                        error!("Retention sweep failed: {}", e);
                    }
                }
            }
        }
        info!("WAL sync daemon stopped");
    }
}
