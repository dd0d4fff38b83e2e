mod common;

use common::{device_info, open_store, opus_frame, ScriptedUploader, T0};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use wal_sync::protocol::Frame;
use wal_sync::upload::{UploadQueue, UploadReport};
use wal_sync::wal::{Codec, EntryStatus, StorageLocation};

fn frames(n: u8) -> Vec<Frame> {
    (0..n).map(|i| opus_frame(i, 40)).collect()
}

#[tokio::test]
async fn test_failed_entry_stays_pending_and_others_continue() {
    let dir = TempDir::new().unwrap();
    let (store, _clock) = open_store(dir.path()).await;
    let device = device_info();

    let first = store.record_chunk(&device, Codec::Opus, T0, frames(3)).await.unwrap();
    let second = store.record_chunk(&device, Codec::Opus, T0 + 60, frames(4)).await.unwrap();
    let third = store.record_chunk(&device, Codec::Opus, T0 + 120, frames(5)).await.unwrap();

    let uploader = Arc::new(ScriptedUploader::rejecting(&[second.id.as_str()]));
    let queue = UploadQueue::new(store.clone(), uploader.clone(), Some("user-1".to_string()));

    let report = queue.sync_all().await.unwrap();
    assert_eq!(
        report,
        UploadReport {
            uploaded: 2,
            skipped: 0,
            failed: 1
        }
    );
    assert_eq!(uploader.accepted_ids(), vec![first.id.clone(), third.id.clone()]);
    assert_eq!(
        uploader.accepted.lock().unwrap().clone(),
        vec![(first.id.clone(), 3), (third.id.clone(), 5)]
    );

    assert_eq!(store.get(&first.id).await.unwrap().status, EntryStatus::Synced);
    assert_eq!(store.get(&second.id).await.unwrap().status, EntryStatus::Miss);
    assert_eq!(store.get(&third.id).await.unwrap().status, EntryStatus::Synced);

    // A later pass only retries what is still outstanding.
    let retry = Arc::new(ScriptedUploader::default());
    let queue = UploadQueue::new(store.clone(), retry.clone(), None);
    let report = queue.sync_all().await.unwrap();
    assert_eq!(report.uploaded, 1);
    assert_eq!(retry.accepted_ids(), vec![second.id.clone()]);

    let synced = store.get(&second.id).await.unwrap();
    assert_eq!(synced.status, EntryStatus::Synced);
    assert_eq!(synced.synced_frame_offset, 4);
    assert_eq!(queue.sync_all().await.unwrap(), UploadReport::default());
}

#[tokio::test]
async fn test_entry_with_unreadable_frames_is_skipped() {
    let dir = TempDir::new().unwrap();
    let (store, _clock) = open_store(dir.path()).await;
    let entry = store
        .record_chunk(&device_info(), Codec::Opus, T0, frames(3))
        .await
        .unwrap();
    std::fs::write(store.entry_path(&entry).unwrap(), b"").unwrap();

    let uploader = Arc::new(ScriptedUploader::default());
    let queue = UploadQueue::new(store.clone(), uploader.clone(), None);
    let report = queue.sync_all().await.unwrap();

    assert_eq!(report.skipped, 1);
    assert!(uploader.accepted_ids().is_empty());
    assert_eq!(store.get(&entry.id).await.unwrap().status, EntryStatus::Miss);
}

#[tokio::test]
async fn test_only_disk_entries_are_uploaded() {
    let dir = TempDir::new().unwrap();
    let (store, clock) = open_store(dir.path()).await;
    let device = device_info();

    let on_disk = store.record_chunk(&device, Codec::Opus, T0, frames(2)).await.unwrap();
    clock.advance(chrono::Duration::minutes(10));
    let backlog = store
        .create_backlog_entry(&device, Codec::Opus, 90_000, 0, 1)
        .await
        .unwrap();
    store
        .upsert_recording_entry(&device, Codec::Opus, T0 + 300, 100)
        .await
        .unwrap();
    assert_eq!(backlog.storage, StorageLocation::Sdcard);

    let uploader = Arc::new(ScriptedUploader::default());
    let queue = UploadQueue::new(store.clone(), uploader.clone(), None);
    let report = queue.sync_all().await.unwrap();

    assert_eq!(report.uploaded, 1);
    assert_eq!(uploader.accepted_ids(), vec![on_disk.id]);
    assert_eq!(store.pending().await.len(), 2);
}

#[tokio::test]
async fn test_overlapping_pass_is_refused() {
    let dir = TempDir::new().unwrap();
    let (store, _clock) = open_store(dir.path()).await;
    store
        .record_chunk(&device_info(), Codec::Opus, T0, frames(2))
        .await
        .unwrap();

    let uploader = Arc::new(ScriptedUploader {
        delay: Some(Duration::from_millis(200)),
        ..ScriptedUploader::default()
    });
    let queue = UploadQueue::new(store.clone(), uploader.clone(), None);

    let (first, second) = tokio::join!(queue.sync_all(), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(queue.is_running());
        queue.sync_all().await
    });

    assert_eq!(first.unwrap().uploaded, 1);
    assert!(second.is_none());
    assert!(!queue.is_running());
    assert_eq!(uploader.accepted_ids().len(), 1);
}
