//! Pulling backlog audio off the device, over BLE or WiFi.

pub mod device;
pub mod sdcard;
pub mod throughput;
pub mod wifi;

pub use device::{DeviceConnection, StorageCommand, WifiCredentials, WifiSetupResult, WifiStatus};
pub use sdcard::{SdCardConfig, SdCardSync};
pub use throughput::ThroughputEstimator;
pub use wifi::{WifiConfig, WifiSync};

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::wal::{Codec, WalError};

/// Which phase of a transfer ran out of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPhase {
    Connect,
    Transfer,
    Stream,
}

impl std::fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let phase = match self {
            TimeoutPhase::Connect => "WiFi connection",
            TimeoutPhase::Transfer => "WiFi transfer",
            TimeoutPhase::Stream => "storage stream",
        };
        f.write_str(phase)
    }
}

/// Errors that end a transfer session
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Device not connected")]
    DeviceNotConnected,

    #[error("A sync is already in progress")]
    AlreadySyncing,

    /// Another producer holds the device
    #[error("Device {0} is busy with another transfer")]
    DeviceBusy(String),

    #[error("Device rejected the storage read command")]
    TransferCommandFailed,

    #[error("Device reported a bad file size")]
    BadFileSize,

    #[error("Device reported an empty file")]
    EmptyFile,

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("{0} timed out")]
    Timeout(TimeoutPhase),

    #[error("Device does not support WiFi sync")]
    NotSupported,

    #[error("WiFi setup failed: {0}")]
    SetupFailed(String),

    #[error("Device failed to start WiFi sync")]
    DeviceFailed,

    #[error("TCP connection failed: {0}")]
    ConnectionFailed(String),

    #[error(transparent)]
    Catalog(#[from] WalError),
}

impl SyncError {
    /// Transient failures a caller may retry as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Stream(_) | SyncError::Timeout(_) | SyncError::ConnectionFailed(_)
        )
    }

    /// Conditions only fixable on the device side.
    pub fn is_device_fatal(&self) -> bool {
        matches!(self, SyncError::BadFileSize | SyncError::EmptyFile)
    }
}

/// How a session ended when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// No backlog, or too little to bother with
    NothingToSync { available_bytes: u64 },
    Completed { entry_id: String, frames: usize, bytes: u64 },
    /// Stopped on request; whatever arrived was committed
    Stopped { entry_id: String, frames: usize, bytes: u64 },
    /// Stopped before any entry was created
    Cancelled,
}

/// Device-reported backlog from `get_storage_list`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backlog {
    pub total_bytes: u64,
    pub current_offset: u64,
}

impl Backlog {
    /// Fewer than two values means the device has nothing stored.
    pub fn from_storage_list(list: &[u64]) -> Option<Self> {
        match list {
            [total_bytes, current_offset, ..] => Some(Self {
                total_bytes: *total_bytes,
                current_offset: *current_offset,
            }),
            _ => None,
        }
    }

    pub fn bytes_to_download(&self) -> u64 {
        self.total_bytes.saturating_sub(self.current_offset)
    }

    /// True when at least `min_seconds` of `codec` audio is waiting.
    pub fn worth_syncing(&self, codec: Codec, min_seconds: u64) -> bool {
        self.bytes_to_download() >= codec.bytes_for_seconds(min_seconds)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncProgress {
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    pub frame_count: usize,
    pub bytes_per_second: f64,
    pub estimated_seconds_remaining: Option<f64>,
}

impl SyncProgress {
    pub fn new(total_bytes: u64, downloaded_bytes: u64, frame_count: usize, bytes_per_second: f64) -> Self {
        let estimated_seconds_remaining = (bytes_per_second > 0.0).then(|| {
            total_bytes.saturating_sub(downloaded_bytes) as f64 / bytes_per_second
        });
        Self {
            total_bytes,
            downloaded_bytes,
            frame_count,
            bytes_per_second,
            estimated_seconds_remaining,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    SdCard,
    Wifi,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    #[default]
    Idle,
    Checking,
    Connecting,
    Transferring,
    Completed,
    Failed,
}

/// Notifications for observers of the sync engine
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    StateChanged { kind: TransferKind, state: TransferState },
    WifiStatus(WifiStatus),
    Progress { kind: TransferKind, progress: SyncProgress },
    Error { kind: TransferKind, message: String },
}

/// Point-in-time view of one transfer type.
///
/// `progress` and `error` are never both set.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransferSnapshot {
    pub state: TransferState,
    pub progress: Option<SyncProgress>,
    pub error: Option<String>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Snapshot holder and event emitter shared by a transfer service.
pub(crate) struct TransferReporter {
    kind: TransferKind,
    snapshot: Mutex<TransferSnapshot>,
    last_progress: Mutex<Option<Instant>>,
    progress_interval: Duration,
    events: broadcast::Sender<SyncEvent>,
}

impl TransferReporter {
    pub(crate) fn new(kind: TransferKind, progress_interval: Duration, events: broadcast::Sender<SyncEvent>) -> Self {
        Self {
            kind,
            snapshot: Mutex::new(TransferSnapshot::default()),
            last_progress: Mutex::new(None),
            progress_interval,
            events,
        }
    }

    pub(crate) fn snapshot(&self) -> TransferSnapshot {
        lock(&self.snapshot).clone()
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub(crate) fn sender(&self) -> broadcast::Sender<SyncEvent> {
        self.events.clone()
    }

    /// Start of an attempt: the previous error is cleared.
    pub(crate) fn begin(&self) {
        *lock(&self.last_progress) = None;
        {
            let mut snapshot = lock(&self.snapshot);
            snapshot.error = None;
            snapshot.progress = None;
            snapshot.state = TransferState::Checking;
        }
        self.emit(SyncEvent::StateChanged {
            kind: self.kind,
            state: TransferState::Checking,
        });
    }

    pub(crate) fn set_state(&self, state: TransferState) {
        lock(&self.snapshot).state = state;
        self.emit(SyncEvent::StateChanged { kind: self.kind, state });
    }

    /// Publish progress unless one went out less than the interval ago.
    /// `force` bypasses the throttle for first and final updates.
    pub(crate) fn progress(&self, progress: SyncProgress, force: bool) {
        let now = Instant::now();
        {
            let mut last = lock(&self.last_progress);
            if !force {
                if let Some(previous) = *last {
                    if now.duration_since(previous) < self.progress_interval {
                        return;
                    }
                }
            }
            *last = Some(now);
        }
        lock(&self.snapshot).progress = Some(progress.clone());
        self.emit(SyncEvent::Progress {
            kind: self.kind,
            progress,
        });
    }

    pub(crate) fn finish(&self, outcome: &SyncOutcome) {
        let state = match outcome {
            SyncOutcome::NothingToSync { .. } | SyncOutcome::Cancelled => TransferState::Idle,
            SyncOutcome::Completed { .. } | SyncOutcome::Stopped { .. } => TransferState::Completed,
        };
        self.set_state(state);
    }

    pub(crate) fn fail(&self, error: &SyncError) {
        let message = error.to_string();
        {
            let mut snapshot = lock(&self.snapshot);
            snapshot.state = TransferState::Failed;
            snapshot.progress = None;
            snapshot.error = Some(message.clone());
        }
        self.emit(SyncEvent::StateChanged {
            kind: self.kind,
            state: TransferState::Failed,
        });
        self.emit(SyncEvent::Error {
            kind: self.kind,
            message,
        });
    }
}

/// Slot holding the cancellation token of the running session, if any.
#[derive(Default)]
pub(crate) struct SessionSlot {
    token: Mutex<Option<CancellationToken>>,
}

impl SessionSlot {
    /// Claim the slot, or fail if a session is already running.
    pub(crate) fn claim(&self) -> Result<SessionClaim<'_>, SyncError> {
        let mut token = lock(&self.token);
        if token.is_some() {
            return Err(SyncError::AlreadySyncing);
        }
        let fresh = CancellationToken::new();
        *token = Some(fresh.clone());
        Ok(SessionClaim { slot: self, token: fresh })
    }

    pub(crate) fn is_active(&self) -> bool {
        lock(&self.token).is_some()
    }

    /// Ask the running session to stop. Returns false if none was running.
    pub(crate) fn cancel(&self) -> bool {
        match lock(&self.token).as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

pub(crate) struct SessionClaim<'a> {
    slot: &'a SessionSlot,
    pub(crate) token: CancellationToken,
}

impl Drop for SessionClaim<'_> {
    fn drop(&mut self) {
        *lock(&self.slot.token) = None;
    }
}

/// Kind of producer writing entries for a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Producer {
    Recording,
    SdCard,
    Wifi,
}

/// Registry enforcing one active producer per device.
#[derive(Debug, Clone, Default)]
pub struct DeviceActivity {
    active: Arc<Mutex<HashMap<String, Producer>>>,
}

impl DeviceActivity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, device_id: &str, producer: Producer) -> Result<ActivityGuard, SyncError> {
        let mut active = lock(&self.active);
        if let Some(current) = active.get(device_id) {
            debug!(device = device_id, ?current, ?producer, "Device busy");
            return Err(SyncError::DeviceBusy(device_id.to_string()));
        }
        active.insert(device_id.to_string(), producer);
        Ok(ActivityGuard {
            registry: self.clone(),
            device_id: device_id.to_string(),
        })
    }

    pub fn current(&self, device_id: &str) -> Option<Producer> {
        lock(&self.active).get(device_id).copied()
    }
}

/// Releases the device when dropped.
#[derive(Debug)]
pub struct ActivityGuard {
    registry: DeviceActivity,
    device_id: String,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        lock(&self.registry.active).remove(&self.device_id);
    }
}
