#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use wal_sync::clock::ManualClock;
use wal_sync::protocol::{Frame, PACKED_PACKET_SIZE, STANDARD_PACKET_SIZE};
use wal_sync::sync::{DeviceConnection, StorageCommand, WifiCredentials, WifiSetupResult};
use wal_sync::upload::{AudioUploader, UploadError, UploadRequest};
use wal_sync::wal::{Codec, DeviceInfo, WalStore};

pub const T0: i64 = 1_700_000_000;
pub const DEVICE_ID: &str = "pendant-01";

pub fn device_info() -> DeviceInfo {
    DeviceInfo::new(DEVICE_ID, "Pendant v2")
}

/// A valid Opus frame of `len` bytes whose payload starts with `seq`.
pub fn opus_frame(seq: u8, len: usize) -> Frame {
    let mut frame = vec![seq; len.max(2)];
    frame[0] = 0xb8;
    frame
}

/// `[3 byte header][count][80 byte frame]` with the frame's TOC at byte 3.
pub fn standard_packet(seq: u8) -> Vec<u8> {
    let mut packet = vec![0u8; STANDARD_PACKET_SIZE];
    packet[0] = seq;
    packet[3..].copy_from_slice(&opus_frame(seq, STANDARD_PACKET_SIZE - 3));
    packet
}

/// One 440-byte block: `[len][frame]` records, a zero marker, then padding.
pub fn packed_block(frames: &[Frame]) -> Vec<u8> {
    let mut block = Vec::with_capacity(PACKED_PACKET_SIZE);
    for frame in frames {
        block.push(frame.len() as u8);
        block.extend_from_slice(frame);
    }
    assert!(block.len() < PACKED_PACKET_SIZE, "frames do not fit one block");
    block.resize(PACKED_PACKET_SIZE, 0);
    block
}

pub async fn open_store(dir: &Path) -> (Arc<WalStore>, ManualClock) {
    let clock = ManualClock::at_epoch(T0);
    let store = WalStore::open(dir, Arc::new(clock.clone()))
        .await
        .expect("Failed to open WAL store");
    (Arc::new(store), clock)
}

/// Something the mock storage stream yields.
#[derive(Debug, Clone)]
pub enum Chunk {
    Data(Vec<u8>),
    Fail(String),
}

/// Scripted device: answers from fixed values and records every command.
pub struct MockDevice {
    pub info: DeviceInfo,
    pub codec: Codec,
    pub connected: AtomicBool,
    pub storage_list: Mutex<Vec<u64>>,
    pub chunks: Mutex<Vec<Chunk>>,
    /// Keep the storage stream open after the scripted chunks
    pub hold_stream_open: AtomicBool,
    pub accept_commands: AtomicBool,
    pub commands: Mutex<Vec<(u32, StorageCommand, u64)>>,

    pub wifi_supported: AtomicBool,
    pub setup_result: Mutex<WifiSetupResult>,
    pub start_wifi_ok: AtomicBool,
    pub wifi_statuses: Mutex<Vec<u8>>,
    pub setup_calls: Mutex<Vec<WifiCredentials>>,
    pub stop_wifi_calls: AtomicUsize,
}

impl MockDevice {
    pub fn new(storage_list: Vec<u64>) -> Self {
        Self {
            info: device_info(),
            codec: Codec::Opus,
            connected: AtomicBool::new(true),
            storage_list: Mutex::new(storage_list),
            chunks: Mutex::new(Vec::new()),
            hold_stream_open: AtomicBool::new(false),
            accept_commands: AtomicBool::new(true),
            commands: Mutex::new(Vec::new()),
            wifi_supported: AtomicBool::new(true),
            setup_result: Mutex::new(WifiSetupResult::Accepted),
            start_wifi_ok: AtomicBool::new(true),
            wifi_statuses: Mutex::new(Vec::new()),
            setup_calls: Mutex::new(Vec::new()),
            stop_wifi_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_chunks(self, chunks: Vec<Chunk>) -> Self {
        *self.chunks.lock().unwrap() = chunks;
        self
    }

    pub fn holding_stream_open(self) -> Self {
        self.hold_stream_open.store(true, Ordering::SeqCst);
        self
    }

    pub fn with_wifi_statuses(self, statuses: Vec<u8>) -> Self {
        *self.wifi_statuses.lock().unwrap() = statuses;
        self
    }

    pub fn commands(&self) -> Vec<(u32, StorageCommand, u64)> {
        self.commands.lock().unwrap().clone()
    }

    pub fn stop_wifi_count(&self) -> usize {
        self.stop_wifi_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceConnection for MockDevice {
    fn device(&self) -> DeviceInfo {
        self.info.clone()
    }

    fn codec(&self) -> Codec {
        self.codec
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn get_storage_list(&self) -> Vec<u64> {
        self.storage_list.lock().unwrap().clone()
    }

    async fn write_storage_command(&self, file_num: u32, command: StorageCommand, offset: u64) -> bool {
        self.commands.lock().unwrap().push((file_num, command, offset));
        self.accept_commands.load(Ordering::SeqCst)
    }

    async fn storage_byte_stream(&self) -> BoxStream<'static, io::Result<Vec<u8>>> {
        let items: Vec<io::Result<Vec<u8>>> = std::mem::take(&mut *self.chunks.lock().unwrap())
            .into_iter()
            .map(|chunk| match chunk {
                Chunk::Data(bytes) => Ok(bytes),
                Chunk::Fail(reason) => Err(io::Error::new(io::ErrorKind::ConnectionReset, reason)),
            })
            .collect();
        let tail: BoxStream<'static, io::Result<Vec<u8>>> = if self.hold_stream_open.load(Ordering::SeqCst) {
            stream::pending().boxed()
        } else {
            stream::empty().boxed()
        };
        stream::iter(items).chain(tail).boxed()
    }

    async fn is_wifi_sync_supported(&self) -> bool {
        self.wifi_supported.load(Ordering::SeqCst)
    }

    async fn setup_wifi_sync(&self, credentials: &WifiCredentials) -> WifiSetupResult {
        self.setup_calls.lock().unwrap().push(credentials.clone());
        self.setup_result.lock().unwrap().clone()
    }

    async fn start_wifi_sync(&self) -> bool {
        self.start_wifi_ok.load(Ordering::SeqCst)
    }

    async fn stop_wifi_sync(&self) -> bool {
        self.stop_wifi_calls.fetch_add(1, Ordering::SeqCst);
        true
    }

    async fn wifi_status_stream(&self) -> BoxStream<'static, u8> {
        let statuses = self.wifi_statuses.lock().unwrap().clone();
        stream::iter(statuses).chain(stream::pending()).boxed()
    }
}

/// Uploader that accepts everything except the listed entry ids.
#[derive(Default)]
pub struct ScriptedUploader {
    pub reject: HashSet<String>,
    pub accepted: Mutex<Vec<(String, usize)>>,
    pub delay: Option<Duration>,
}

impl ScriptedUploader {
    pub fn rejecting(ids: &[&str]) -> Self {
        Self {
            reject: ids.iter().map(|id| id.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn accepted_ids(&self) -> Vec<String> {
        self.accepted
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[async_trait]
impl AudioUploader for ScriptedUploader {
    async fn upload(&self, request: &UploadRequest) -> Result<(), UploadError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.reject.contains(&request.entry.id) {
            return Err(UploadError::Transport("connection reset".to_string()));
        }
        self.accepted
            .lock()
            .unwrap()
            .push((request.entry.id.clone(), request.frames.len()));
        Ok(())
    }
}
