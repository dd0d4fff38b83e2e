//! Cuts a live frame stream into WAL entries on a schedule.
//!
//! Two timers run while recording: the chunk timer cuts the buffer into an
//! entry once enough unsynced frames have piled up, and the flush timer pushes
//! any memory-resident frames to disk so a crash loses at most one flush
//! interval of audio.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::clock::Clock;
use crate::protocol::Frame;
use crate::sync::{ActivityGuard, DeviceActivity, Producer, SyncError};
use crate::wal::{Codec, DeviceInfo, FlushReport, WalEntry, WalResult, WalStore};

#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    /// Target length of one entry
    pub chunk_seconds: u64,
    pub flush_seconds: u64,
    /// Slack added to both timers
    pub grace_seconds: u64,
    /// Unsynced frames needed before the chunk timer cuts
    pub unsynced_frame_threshold: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            chunk_seconds: 60,
            flush_seconds: 90,
            grace_seconds: 15,
            unsynced_frame_threshold: 1000,
        }
    }
}

impl ChunkerConfig {
    pub fn chunk_interval(&self) -> Duration {
        Duration::from_secs(self.chunk_seconds + self.grace_seconds)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_seconds + self.grace_seconds)
    }
}

struct RecordingSession {
    device: DeviceInfo,
    codec: Codec,
    chunk_start: i64,
}

#[derive(Default)]
struct ChunkBuffer {
    session: Option<RecordingSession>,
    frames: Vec<Frame>,
    synced: Vec<bool>,
    unsynced: usize,
}

impl ChunkBuffer {
    fn clear_frames(&mut self) -> Vec<Frame> {
        self.synced.clear();
        self.unsynced = 0;
        std::mem::take(&mut self.frames)
    }
}

struct ChunkerInner {
    store: Arc<WalStore>,
    clock: Arc<dyn Clock>,
    config: ChunkerConfig,
    buffer: Mutex<ChunkBuffer>,
}

impl ChunkerInner {
    fn buffer(&self) -> MutexGuard<'_, ChunkBuffer> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn on_chunk_tick(&self) -> WalResult<Option<WalEntry>> {
        let unsynced = self.buffer().unsynced;
        if unsynced < self.config.unsynced_frame_threshold {
            trace!(unsynced, "Below chunk threshold");
            return Ok(None);
        }
        self.cut().await
    }

    async fn on_flush_tick(&self) -> WalResult<FlushReport> {
        let report = self.store.flush_resident().await?;
        if report != FlushReport::default() {
            info!(
                written = report.written,
                failed = report.failed,
                corrupted = report.corrupted,
                "Flushed resident frames"
            );
        }
        Ok(report)
    }

    /// Move the whole buffer into an entry keyed by the current chunk start.
    async fn cut(&self) -> WalResult<Option<WalEntry>> {
        let (device, codec, start, frames) = {
            let mut buffer = self.buffer();
            if buffer.frames.is_empty() {
                return Ok(None);
            }
            let now = self.clock.now_epoch();
            let frames = buffer.clear_frames();
            let Some(session) = buffer.session.as_mut() else {
                return Ok(None);
            };
            let start = session.chunk_start;
            session.chunk_start = now;
            (session.device.clone(), session.codec, start, frames)
        };

        let count = frames.len();
        let entry = self.store.record_chunk(&device, codec, start, frames).await?;
        info!(entry_id = %entry.id, frames = count, seconds = entry.seconds, "Cut recording chunk");
        Ok(Some(entry))
    }
}

struct Timers {
    token: CancellationToken,
    handle: JoinHandle<()>,
    _busy: ActivityGuard,
}

/// Buffers live frames and turns them into WAL entries.
pub struct RecordingChunker {
    inner: Arc<ChunkerInner>,
    activity: DeviceActivity,
    timers: tokio::sync::Mutex<Option<Timers>>,
}

impl RecordingChunker {
    pub fn new(
        store: Arc<WalStore>,
        clock: Arc<dyn Clock>,
        activity: DeviceActivity,
        config: ChunkerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ChunkerInner {
                store,
                clock,
                config,
                buffer: Mutex::new(ChunkBuffer::default()),
            }),
            activity,
            timers: tokio::sync::Mutex::new(None),
        }
    }

    /// Begin a recording session and arm both timers. A session already in
    /// progress is stopped first.
    pub async fn start(&self, device: DeviceInfo, codec: Codec) -> Result<(), SyncError> {
        let mut timers = self.timers.lock().await;
        if let Some(previous) = timers.take() {
            warn!("Recording already active, closing it first");
            self.shutdown(previous).await;
        }

        let busy = self.activity.acquire(&device.id, Producer::Recording)?;
        {
            let mut buffer = self.inner.buffer();
            buffer.clear_frames();
            buffer.session = Some(RecordingSession {
                device: device.clone(),
                codec,
                chunk_start: self.inner.clock.now_epoch(),
            });
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(run_timers(Arc::clone(&self.inner), token.clone()));
        *timers = Some(Timers {
            token,
            handle,
            _busy: busy,
        });

        info!(device = %device.id, %codec, "Started recording");
        Ok(())
    }

    /// Buffer one frame. Frames outside a session are dropped.
    pub fn add_frame(&self, frame: Frame, synced: bool) {
        let mut buffer = self.inner.buffer();
        if buffer.session.is_none() {
            trace!("Dropping frame received while not recording");
            return;
        }
        buffer.frames.push(frame);
        buffer.synced.push(synced);
        if !synced {
            buffer.unsynced += 1;
        }
    }

    /// Cancel the timers, cut whatever is buffered, and end the session.
    pub async fn stop(&self) -> WalResult<Option<WalEntry>> {
        let mut timers = self.timers.lock().await;
        match timers.take() {
            Some(active) => Ok(self.shutdown(active).await),
            None => Ok(None),
        }
    }

    async fn shutdown(&self, timers: Timers) -> Option<WalEntry> {
        timers.token.cancel();
        if let Err(e) = timers.handle.await {
            error!("Chunk timer task failed: {}", e);
        }

        let entry = match self.inner.cut().await {
            Ok(entry) => entry,
            Err(e) => {
                error!("Final chunk could not be recorded: {}", e);
                None
            }
        };

        let mut buffer = self.inner.buffer();
        buffer.clear_frames();
        buffer.session = None;
        info!("Stopped recording");
        entry
    }

    pub fn is_recording(&self) -> bool {
        self.inner.buffer().session.is_some()
    }

    pub fn buffered_frames(&self) -> usize {
        self.inner.buffer().frames.len()
    }

    /// Run the chunk check now, outside the timer.
    pub async fn on_chunk_tick(&self) -> WalResult<Option<WalEntry>> {
        self.inner.on_chunk_tick().await
    }

    /// Run the flush now, outside the timer.
    pub async fn on_flush_tick(&self) -> WalResult<FlushReport> {
        self.inner.on_flush_tick().await
    }
}

async fn run_timers(inner: Arc<ChunkerInner>, token: CancellationToken) {
    let chunk_every = inner.config.chunk_interval();
    let flush_every = inner.config.flush_interval();
    let mut chunk_tick = interval_at(Instant::now() + chunk_every, chunk_every);
    let mut flush_tick = interval_at(Instant::now() + flush_every, flush_every);
    chunk_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!(?chunk_every, ?flush_every, "Chunk timers armed");
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = chunk_tick.tick() => {
                if let Err(e) = inner.on_chunk_tick().await {
                    error!("Chunk cut failed: {}", e);
                }
            }
            _ = flush_tick.tick() => {
                if let Err(e) = inner.on_flush_tick().await {
                    error!("Flush failed: {}", e);
                }
            }
        }
    }
    debug!("Chunk timers stopped");
}
