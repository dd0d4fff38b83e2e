//! Backlog transfer over the device's own access point.
//!
//! Commands still go over BLE; only the audio bytes travel over TCP. The
//! device reports its radio state on a separate status stream which is
//! observed in the background for the whole session.

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::device::{DeviceConnection, StorageCommand, WifiCredentials, WifiSetupResult, WifiStatus};
use super::throughput::ThroughputEstimator;
use super::{
    Backlog, DeviceActivity, Producer, SessionSlot, SyncError, SyncEvent, SyncOutcome, SyncProgress,
    TimeoutPhase, TransferKind, TransferReporter, TransferSnapshot, TransferState,
};
use crate::protocol::FrameReassembler;
use crate::wal::{DeviceInfo, WalStore};

#[derive(Debug, Clone)]
pub struct WifiConfig {
    /// Address of the device's access point
    pub device_host: String,
    pub device_port: u16,
    /// How long to wait for the access point to come up
    pub connection_timeout: Duration,
    /// Upper bound on the TCP receive loop
    pub transfer_timeout: Duration,
    pub status_poll_interval: Duration,
    pub tcp_connect_timeout: Duration,
    pub read_chunk_bytes: usize,
    pub speed_window: Duration,
    pub min_seconds_to_sync: u64,
    pub progress_interval: Duration,
    pub file_num: u32,
}

impl Default for WifiConfig {
    fn default() -> Self {
        Self {
            device_host: "192.168.4.1".to_string(),
            device_port: 12345,
            connection_timeout: Duration::from_secs(60),
            transfer_timeout: Duration::from_secs(300),
            status_poll_interval: Duration::from_millis(500),
            tcp_connect_timeout: Duration::from_secs(10),
            read_chunk_bytes: 64 * 1024,
            speed_window: Duration::from_secs(3),
            min_seconds_to_sync: 10,
            progress_interval: Duration::from_millis(500),
            file_num: 1,
        }
    }
}

enum WifiEnd {
    EndOfStream,
    Stopped,
    TimedOut,
    Failed(SyncError),
}

/// Background task mirroring the device status stream into a watch channel.
struct StatusObserver {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl StatusObserver {
    async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            debug!("Status observer ended abnormally: {}", e);
        }
    }
}

/// Pulls device storage over the WiFi access point into the WAL.
pub struct WifiSync {
    device: Arc<dyn DeviceConnection>,
    store: Arc<WalStore>,
    activity: DeviceActivity,
    config: WifiConfig,
    reporter: TransferReporter,
    session: SessionSlot,
    status: Arc<watch::Sender<WifiStatus>>,
}

impl WifiSync {
    pub fn new(
        device: Arc<dyn DeviceConnection>,
        store: Arc<WalStore>,
        activity: DeviceActivity,
        config: WifiConfig,
        events: broadcast::Sender<SyncEvent>,
    ) -> Self {
        let reporter = TransferReporter::new(TransferKind::Wifi, config.progress_interval, events);
        let (status, _) = watch::channel(WifiStatus::Off);
        Self {
            device,
            store,
            activity,
            config,
            reporter,
            session: SessionSlot::default(),
            status: Arc::new(status),
        }
    }

    pub fn snapshot(&self) -> TransferSnapshot {
        self.reporter.snapshot()
    }

    /// Last status the device reported.
    pub fn status(&self) -> WifiStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<WifiStatus> {
        self.status.subscribe()
    }

    pub fn is_syncing(&self) -> bool {
        self.session.is_active()
    }

    pub async fn is_supported(&self) -> bool {
        self.device.is_wifi_sync_supported().await
    }

    pub fn stop_sync(&self) -> bool {
        self.session.cancel()
    }

    /// Run one WiFi transfer. Credentials, when given, are pushed to the
    /// device before the radio is switched on.
    pub async fn start_sync(&self, credentials: Option<WifiCredentials>) -> Result<SyncOutcome, SyncError> {
        let claim = self.session.claim()?;
        let span = info_span!(
            "wifi_sync",
            session = %Uuid::new_v4(),
            device = %self.device.device().id
        );

        self.reporter.begin();
        let result = self.run(credentials.as_ref(), &claim.token).instrument(span).await;
        match &result {
            Ok(outcome) => self.reporter.finish(outcome),
            Err(e) => {
                warn!("WiFi sync failed: {}", e);
                self.reporter.fail(e);
            }
        }
        result
    }

    async fn run(
        &self,
        credentials: Option<&WifiCredentials>,
        cancel: &CancellationToken,
    ) -> Result<SyncOutcome, SyncError> {
        if !self.device.is_connected().await {
            return Err(SyncError::DeviceNotConnected);
        }
        let device = self.device.device();
        let _busy = self.activity.acquire(&device.id, Producer::Wifi)?;

        if !self.device.is_wifi_sync_supported().await {
            return Err(SyncError::NotSupported);
        }
        if let Some(credentials) = credentials {
            credentials.validate()?;
            match self.device.setup_wifi_sync(credentials).await {
                WifiSetupResult::Accepted => info!(ssid = %credentials.ssid, "WiFi credentials accepted"),
                WifiSetupResult::Rejected(reason) => return Err(SyncError::SetupFailed(reason)),
            }
        }

        self.status.send_replace(WifiStatus::On);
        let observer = self.observe_status().await;

        let result = self.transfer(&device, cancel).await;

        observer.stop().await;
        if !self.device.stop_wifi_sync().await {
            warn!("Device did not acknowledge WiFi shutdown");
        }
        self.status.send_replace(WifiStatus::Off);
        result
    }

    async fn observe_status(&self) -> StatusObserver {
        let mut statuses = self.device.wifi_status_stream().await;
        let status = Arc::clone(&self.status);
        let events = self.reporter.sender();
        let token = CancellationToken::new();
        let stop = token.clone();

        let handle = tokio::spawn(
            async move {
                loop {
                    let code = tokio::select! {
                        _ = stop.cancelled() => break,
                        next = statuses.next() => match next {
                            Some(code) => code,
                            None => break,
                        },
                    };
                    match WifiStatus::from_code(code) {
                        Some(next) => {
                            debug!(status = ?next, "Device WiFi status");
                            status.send_replace(next);
                            let _ = events.send(SyncEvent::WifiStatus(next));
                        }
                        None => debug!(code, "Ignoring unknown WiFi status code"),
                    }
                }
            }
            .in_current_span(),
        );

        StatusObserver { token, handle }
    }

    /// Returns false if the session was stopped while waiting.
    async fn wait_until_active(&self, cancel: &CancellationToken) -> Result<bool, SyncError> {
        let deadline = Instant::now() + self.config.connection_timeout;
        let mut poll = interval(self.config.status_poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(false),
                _ = poll.tick() => {}
            }
            let status = self.status();
            if status.is_active() {
                info!(?status, "Device access point is up");
                return Ok(true);
            }
            if Instant::now() >= deadline {
                warn!(
                    timeout = ?self.config.connection_timeout,
                    last_status = ?status,
                    "Timed out waiting for the device access point"
                );
                return Err(SyncError::Timeout(TimeoutPhase::Connect));
            }
        }
    }

    async fn transfer(&self, device: &DeviceInfo, cancel: &CancellationToken) -> Result<SyncOutcome, SyncError> {
        if !self.device.start_wifi_sync().await {
            return Err(SyncError::DeviceFailed);
        }
        self.reporter.set_state(TransferState::Connecting);
        if !self.wait_until_active(cancel).await? {
            info!("WiFi sync stopped before the access point came up");
            return Ok(SyncOutcome::Cancelled);
        }

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
                device,
                codec,
                backlog.total_bytes,
                backlog.current_offset,
                self.config.file_num,
            )
            .await?;

        self.reporter.set_state(TransferState::Transferring);
        if !self
            .device
            .write_storage_command(self.config.file_num, StorageCommand::Read, backlog.current_offset)
            .await
        {
            return Err(SyncError::TransferCommandFailed);
        }

        let addr = format!("{}:{}", self.config.device_host, self.config.device_port);
        let mut socket = match timeout(self.config.tcp_connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(socket)) => socket,
            Ok(Err(e)) => return Err(SyncError::ConnectionFailed(format!("{}: {}", addr, e))),
            Err(_) => {
                return Err(SyncError::ConnectionFailed(format!(
                    "{}: no answer within {:?}",
                    addr, self.config.tcp_connect_timeout
                )))
            }
        };
        info!(%addr, entry_id = %entry.id, bytes = total, "Receiving over TCP");

        let mut reassembler = FrameReassembler::new();
        let mut frames = Vec::new();
        let mut bytes = 0u64;
        let mut estimator = ThroughputEstimator::new(self.config.speed_window);
        let mut buf = vec![0u8; self.config.read_chunk_bytes.max(1)];
        let deadline = Instant::now() + self.config.transfer_timeout;
        self.reporter.progress(SyncProgress::new(total, 0, 0, 0.0), true);

        let end = loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => break WifiEnd::Stopped,
                _ = sleep_until(deadline) => {
                    warn!(timeout = ?self.config.transfer_timeout, bytes, "WiFi transfer deadline reached");
                    break WifiEnd::TimedOut;
                }
                read = socket.read(&mut buf) => read,
            };
            match read {
                Ok(0) => break WifiEnd::EndOfStream,
                Ok(n) => {
                    bytes += n as u64;
                    frames.extend(reassembler.push(&buf[..n]));
                    estimator.record(Instant::now(), bytes);
                    self.reporter.progress(
                        SyncProgress::new(total, bytes, frames.len(), estimator.bytes_per_second()),
                        false,
                    );
                }
                Err(e) => break WifiEnd::Failed(SyncError::Stream(e.to_string())),
            }
        };
        if let Err(e) = socket.shutdown().await {
            debug!("TCP shutdown: {}", e);
        }
        drop(socket);

        let (tail, leftover) = reassembler.finish();
        frames.extend(tail);
        debug!(
            frames = frames.len(),
            bytes,
            dropped = reassembler.dropped(),
            leftover,
            "TCP receive finished"
        );
        self.reporter.progress(
            SyncProgress::new(total, bytes, frames.len(), estimator.bytes_per_second()),
            true,
        );

        let frame_count = frames.len();
        let commit = if bytes > 0 {
            self.store
                .apply_downloaded_bytes(&entry.id, bytes, &frames)
                .await
                .map(|_| ())
        } else {
            Ok(())
        };

        match end {
            WifiEnd::EndOfStream => {
                commit?;
                info!(entry_id = %entry.id, frames = frame_count, bytes, "WiFi sync completed");
                Ok(SyncOutcome::Completed {
                    entry_id: entry.id,
                    frames: frame_count,
                    bytes,
                })
            }
            WifiEnd::Stopped => {
                commit?;
                info!(entry_id = %entry.id, frames = frame_count, bytes, "WiFi sync stopped");
                Ok(SyncOutcome::Stopped {
                    entry_id: entry.id,
                    frames: frame_count,
                    bytes,
                })
            }
            WifiEnd::TimedOut => {
                if let Err(e) = commit {
                    error!(entry_id = %entry.id, "Could not keep partial transfer: {}", e);
                }
                Err(SyncError::Timeout(TimeoutPhase::Transfer))
            }
            WifiEnd::Failed(e) => {
                if let Err(commit) = commit {
                    error!(entry_id = %entry.id, "Could not keep partial transfer: {}", commit);
                }
                Err(e)
            }
        }
    }
}
