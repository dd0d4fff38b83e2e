mod common;

use common::{open_store, opus_frame, packed_block, standard_packet, Chunk, MockDevice, DEVICE_ID, T0};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

use wal_sync::sync::{
    DeviceActivity, Producer, SdCardConfig, SdCardSync, StorageCommand, SyncError, SyncEvent, SyncOutcome,
    TimeoutPhase, TransferKind, TransferState,
};
use wal_sync::wal::{EntryStatus, StorageLocation, WalEntry, WalStore};

struct Harness {
    _dir: TempDir,
    store: Arc<WalStore>,
    device: Arc<MockDevice>,
    activity: DeviceActivity,
    sync: Arc<SdCardSync>,
    events: broadcast::Receiver<SyncEvent>,
}

async fn harness(device: MockDevice, config: SdCardConfig) -> Harness {
    let dir = TempDir::new().expect("Failed to create temp directory");
    let (store, _clock) = open_store(dir.path()).await;
    let device = Arc::new(device);
    let activity = DeviceActivity::new();
    let (tx, events) = broadcast::channel(256);
    let sync = Arc::new(SdCardSync::new(
        device.clone(),
        store.clone(),
        activity.clone(),
        config,
        tx,
    ));
    Harness {
        _dir: dir,
        store,
        device,
        activity,
        sync,
        events,
    }
}

fn live_config() -> SdCardConfig {
    SdCardConfig {
        progress_interval: Duration::ZERO,
        ..SdCardConfig::default()
    }
}

fn entry_id() -> String {
    WalEntry::entry_id(DEVICE_ID, T0)
}

async fn wait_for_event(events: &mut broadcast::Receiver<SyncEvent>, wanted: impl Fn(&SyncEvent) -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if wanted(&event) => return,
                Ok(_) => {}
                Err(e) => panic!("event channel failed: {}", e),
            }
        }
    })
    .await
    .expect("Timed out waiting for sync event");
}

#[tokio::test]
async fn test_small_backlog_is_left_on_device() {
    let h = harness(MockDevice::new(vec![8_000, 0]), SdCardConfig::default()).await;

    let outcome = h.sync.start_sync().await.unwrap();
    assert_eq!(outcome, SyncOutcome::NothingToSync { available_bytes: 8_000 });
    assert!(h.store.entries().await.is_empty());
    assert!(h.device.commands().is_empty());
    assert_eq!(h.sync.snapshot().state, TransferState::Idle);
}

#[tokio::test]
async fn test_empty_storage_list() {
    let h = harness(MockDevice::new(vec![]), SdCardConfig::default()).await;

    let outcome = h.sync.start_sync().await.unwrap();
    assert_eq!(outcome, SyncOutcome::NothingToSync { available_bytes: 0 });
    assert!(h.store.entries().await.is_empty());
}

#[tokio::test]
async fn test_backlog_entry_sized_from_device_storage() {
    let h = harness(MockDevice::new(vec![90_000, 0]), SdCardConfig::default()).await;

    let outcome = h.sync.start_sync().await.unwrap();
    assert!(matches!(outcome, SyncOutcome::Completed { frames: 0, bytes: 0, .. }));

    let entry = h.store.get(&entry_id()).await.unwrap();
    assert_eq!(entry.total_frames, 1_125);
    assert_eq!(entry.seconds, 11);
    assert_eq!(entry.storage, StorageLocation::Sdcard);
    assert_eq!(entry.status, EntryStatus::Miss);
    assert!(entry.file_name.is_none());
    assert_eq!(h.device.commands(), vec![(1, StorageCommand::Read, 0)]);
}

#[tokio::test]
async fn test_end_of_transmission_after_full_range_moves_entry_to_disk() {
    let mut chunks: Vec<Chunk> = (0..1_000u32)
        .map(|i| Chunk::Data(standard_packet((i % 256) as u8)))
        .collect();
    chunks.insert(500, Chunk::Data(vec![0x00]));
    chunks.push(Chunk::Data(vec![0x64]));
    let device = MockDevice::new(vec![88_000, 8_000]).with_chunks(chunks);
    let h = harness(device, SdCardConfig::default()).await;

    let outcome = h.sync.start_sync().await.unwrap();
    assert_eq!(
        outcome,
        SyncOutcome::Completed {
            entry_id: entry_id(),
            frames: 1_000,
            bytes: 80_000,
        }
    );
    assert_eq!(h.device.commands(), vec![(1, StorageCommand::Read, 8_000)]);

    let entry = h.store.get(&entry_id()).await.unwrap();
    assert_eq!(entry.storage, StorageLocation::Disk);
    assert_eq!(entry.original_storage, Some(StorageLocation::Sdcard));
    assert_eq!(entry.storage_offset, 88_000);
    assert_eq!(entry.total_frames, 1_000);
    assert!(entry.is_uploadable());

    let frames = h.store.read_frames(&entry).await.unwrap();
    assert_eq!(frames.len(), 1_000);
    assert_eq!(frames[0], standard_packet(0)[3..].to_vec());
    assert_eq!(h.sync.snapshot().state, TransferState::Completed);
}

#[tokio::test]
async fn test_early_end_of_transmission_keeps_backlog_on_card() {
    let block_frames: Vec<_> = (0..4u8).map(|i| opus_frame(0x40 + i, 60)).collect();
    let device = MockDevice::new(vec![88_000, 8_000]).with_chunks(vec![
        Chunk::Data(standard_packet(1)),
        Chunk::Data(standard_packet(2)),
        Chunk::Data(vec![0x00]),
        Chunk::Data(standard_packet(3)),
        Chunk::Data(packed_block(&block_frames)),
        Chunk::Data(vec![0x64]),
    ]);
    let h = harness(device, SdCardConfig::default()).await;

    let outcome = h.sync.start_sync().await.unwrap();
    assert_eq!(
        outcome,
        SyncOutcome::Completed {
            entry_id: entry_id(),
            frames: 7,
            bytes: 3 * 80 + 440,
        }
    );

    let entry = h.store.get(&entry_id()).await.unwrap();
    assert_eq!(entry.storage, StorageLocation::Sdcard);
    assert_eq!(entry.status, EntryStatus::Miss);
    assert_eq!(entry.storage_offset, 8_000 + 680);
    assert_eq!(entry.remaining_bytes(), 80_000 - 680);
    assert_eq!(entry.total_frames, 7);
    assert!(!entry.is_uploadable());

    let frames = h.store.read_frames(&entry).await.unwrap();
    assert_eq!(frames[0], standard_packet(1)[3..].to_vec());
    assert_eq!(frames[3..].to_vec(), block_frames);
}

#[tokio::test]
async fn test_unlisted_high_status_ends_transfer() {
    let device = MockDevice::new(vec![90_000, 0])
        .with_chunks(vec![Chunk::Data(standard_packet(1)), Chunk::Data(vec![0xc8])])
        .holding_stream_open();
    let h = harness(device, SdCardConfig::default()).await;

    let outcome = h.sync.start_sync().await.unwrap();
    assert!(matches!(outcome, SyncOutcome::Completed { frames: 1, bytes: 80, .. }));

    let entry = h.store.get(&entry_id()).await.unwrap();
    assert_eq!(entry.storage, StorageLocation::Sdcard);
    assert_eq!(entry.storage_offset, 80);
    assert!(h.store.uploadable().await.is_empty());
}

#[tokio::test]
async fn test_partial_frames_survive_stream_error() {
    let mut chunks: Vec<Chunk> = (0..10).map(|i| Chunk::Data(standard_packet(i))).collect();
    chunks.push(Chunk::Fail("link dropped".to_string()));
    let mut h = harness(MockDevice::new(vec![90_000, 0]).with_chunks(chunks), SdCardConfig::default()).await;

    let err = h.sync.start_sync().await.unwrap_err();
    assert!(matches!(err, SyncError::Stream(_)));
    assert!(err.is_retryable());

    let entry = h.store.get(&entry_id()).await.unwrap();
    assert_eq!(entry.total_frames, 10);
    assert_eq!(entry.storage_offset, 800);
    assert_eq!(entry.status, EntryStatus::Miss);
    assert_eq!(entry.storage, StorageLocation::Sdcard);
    assert_eq!(h.store.read_frames(&entry).await.unwrap().len(), 10);

    let snapshot = h.sync.snapshot();
    assert_eq!(snapshot.state, TransferState::Failed);
    assert!(snapshot.error.is_some());
    assert!(snapshot.progress.is_none());

    wait_for_event(&mut h.events, |e| {
        matches!(e, SyncEvent::Error { kind: TransferKind::SdCard, .. })
    })
    .await;
}

#[tokio::test]
async fn test_device_status_errors() {
    let device = MockDevice::new(vec![90_000, 0]).with_chunks(vec![Chunk::Data(vec![0x03])]);
    let h = harness(device, SdCardConfig::default()).await;
    let err = h.sync.start_sync().await.unwrap_err();
    assert!(matches!(err, SyncError::BadFileSize));
    assert!(err.is_device_fatal());
    assert!(h.store.get(&entry_id()).await.unwrap().file_name.is_none());

    let device = MockDevice::new(vec![90_000, 0]).with_chunks(vec![Chunk::Data(vec![0x04])]);
    let h = harness(device, SdCardConfig::default()).await;
    assert!(matches!(h.sync.start_sync().await, Err(SyncError::EmptyFile)));
}

#[tokio::test]
async fn test_rejected_read_command() {
    let device = MockDevice::new(vec![90_000, 0]);
    device.accept_commands.store(false, std::sync::atomic::Ordering::SeqCst);
    let h = harness(device, SdCardConfig::default()).await;

    assert!(matches!(
        h.sync.start_sync().await,
        Err(SyncError::TransferCommandFailed)
    ));
    assert!(!h.sync.is_syncing());
}

#[tokio::test]
async fn test_disconnected_device() {
    let device = MockDevice::new(vec![90_000, 0]);
    device.connected.store(false, std::sync::atomic::Ordering::SeqCst);
    let h = harness(device, SdCardConfig::default()).await;

    assert!(matches!(
        h.sync.start_sync().await,
        Err(SyncError::DeviceNotConnected)
    ));
    assert!(h.store.entries().await.is_empty());
}

#[tokio::test]
async fn test_stop_commits_received_frames() {
    let chunks = (0..5).map(|i| Chunk::Data(standard_packet(i))).collect();
    let device = MockDevice::new(vec![90_000, 0]).with_chunks(chunks).holding_stream_open();
    let mut h = harness(device, live_config()).await;

    let sync = h.sync.clone();
    let session = tokio::spawn(async move { sync.start_sync().await });

    wait_for_event(&mut h.events, |e| {
        matches!(e, SyncEvent::Progress { progress, .. } if progress.frame_count == 5)
    })
    .await;
    assert!(h.sync.is_syncing());
    assert!(h.sync.stop_sync());

    let outcome = session.await.unwrap().unwrap();
    assert_eq!(
        outcome,
        SyncOutcome::Stopped {
            entry_id: entry_id(),
            frames: 5,
            bytes: 400,
        }
    );
    assert!(!h.sync.is_syncing());
    assert!(!h.sync.stop_sync());

    let entry = h.store.get(&entry_id()).await.unwrap();
    assert_eq!(entry.total_frames, 5);
    assert_eq!(entry.storage_offset, 400);
    assert_eq!(entry.storage, StorageLocation::Sdcard);
}

#[tokio::test]
async fn test_second_session_is_rejected() {
    let device = MockDevice::new(vec![90_000, 0]).holding_stream_open();
    let mut h = harness(device, live_config()).await;

    let sync = h.sync.clone();
    let session = tokio::spawn(async move { sync.start_sync().await });
    wait_for_event(&mut h.events, |e| {
        matches!(e, SyncEvent::StateChanged { state: TransferState::Transferring, .. })
    })
    .await;

    assert!(matches!(h.sync.start_sync().await, Err(SyncError::AlreadySyncing)));
    assert!(matches!(
        h.sync.clear_device_storage().await,
        Err(SyncError::AlreadySyncing)
    ));

    h.sync.stop_sync();
    let outcome = session.await.unwrap().unwrap();
    assert!(matches!(outcome, SyncOutcome::Stopped { frames: 0, .. }));
}

#[tokio::test]
async fn test_busy_device_is_rejected() {
    let h = harness(MockDevice::new(vec![8_000, 0]), SdCardConfig::default()).await;

    let recording = h.activity.acquire(DEVICE_ID, Producer::Recording).unwrap();
    assert!(matches!(h.sync.start_sync().await, Err(SyncError::DeviceBusy(_))));
    assert_eq!(h.activity.current(DEVICE_ID), Some(Producer::Recording));

    drop(recording);
    assert!(h.sync.start_sync().await.is_ok());
    assert!(h.activity.current(DEVICE_ID).is_none());
}

#[tokio::test]
async fn test_silent_stream_times_out() {
    let chunks = (0..3).map(|i| Chunk::Data(standard_packet(i))).collect();
    let device = MockDevice::new(vec![90_000, 0]).with_chunks(chunks).holding_stream_open();
    let config = SdCardConfig {
        idle_timeout: Duration::from_millis(50),
        ..SdCardConfig::default()
    };
    let h = harness(device, config).await;

    let err = h.sync.start_sync().await.unwrap_err();
    assert!(matches!(err, SyncError::Timeout(TimeoutPhase::Stream)));
    assert_eq!(h.store.get(&entry_id()).await.unwrap().total_frames, 3);
}

#[tokio::test]
async fn test_clear_device_storage() {
    let h = harness(MockDevice::new(vec![90_000, 0]), SdCardConfig::default()).await;

    h.sync.clear_device_storage().await.unwrap();
    assert_eq!(h.device.commands(), vec![(1, StorageCommand::Clear, 0)]);

    h.device.accept_commands.store(false, std::sync::atomic::Ordering::SeqCst);
    assert!(matches!(
        h.sync.clear_device_storage().await,
        Err(SyncError::TransferCommandFailed)
    ));
}
