use serde::{Deserialize, Serialize};

/// Audio codec the device recorded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Codec {
    #[serde(rename = "opus")]
    Opus,
    #[serde(rename = "opus_fs320")]
    OpusFs320,
}

impl Codec {
    /// Frames per second of audio.
    pub fn fps(&self) -> u64 {
        match self {
            Codec::Opus => 100,
            Codec::OpusFs320 => 50,
        }
    }

    /// Nominal encoded size of one frame on device storage.
    pub fn bytes_per_frame(&self) -> u64 {
        match self {
            Codec::Opus => 80,
            Codec::OpusFs320 => 160,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        16_000
    }

    pub fn channels(&self) -> u16 {
        1
    }

    /// Bytes of device storage that hold `seconds` of audio.
    pub fn bytes_for_seconds(&self, seconds: u64) -> u64 {
        seconds * self.fps() * self.bytes_per_frame()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Codec::Opus => "opus",
            Codec::OpusFs320 => "opus_fs320",
        }
    }
}

impl std::fmt::Display for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Codec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "opus" => Ok(Codec::Opus),
            "opus_fs320" => Ok(Codec::OpusFs320),
            other => Err(format!("unknown codec: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    InProgress,
    Miss,
    Synced,
    Corrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageLocation {
    Memory,
    Disk,
    Sdcard,
    FlashPage,
}

/// Identity and display name of a recording device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub model: String,
}

impl DeviceInfo {
    pub fn new(id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
        }
    }
}

/// One contiguous recording segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalEntry {
    pub id: String,
    pub device: String,
    pub device_model: String,
    pub codec: Codec,
    pub channels: u16,
    pub sample_rate: u32,
    pub status: EntryStatus,
    pub storage: StorageLocation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_storage: Option<StorageLocation>,
    /// Frame file name relative to the store directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// Recording start, unix seconds.
    pub timer_start: i64,
    pub seconds: u64,
    #[serde(default)]
    pub storage_offset: u64,
    #[serde(default)]
    pub storage_total_bytes: u64,
    #[serde(default = "default_file_num")]
    pub file_num: u32,
    pub total_frames: u64,
    #[serde(default)]
    pub synced_frame_offset: u64,
}

fn default_file_num() -> u32 {
    1
}

impl WalEntry {
    /// Deterministic id, so repeated creation for the same segment merges.
    pub fn entry_id(device_id: &str, start_epoch: i64) -> String {
        format!("{}_{}", device_id, start_epoch)
    }

    /// A fresh entry for frames captured live.
    pub fn recording(device: &DeviceInfo, codec: Codec, start_epoch: i64, frames: u64) -> Self {
        Self {
            id: Self::entry_id(&device.id, start_epoch),
            device: device.id.clone(),
            device_model: device.model.clone(),
            codec,
            channels: codec.channels(),
            sample_rate: codec.sample_rate(),
            status: EntryStatus::Miss,
            storage: StorageLocation::Memory,
            original_storage: None,
            file_name: None,
            timer_start: start_epoch,
            seconds: (frames / codec.fps()).max(1),
            storage_offset: 0,
            storage_total_bytes: 0,
            file_num: 1,
            total_frames: frames,
            synced_frame_offset: 0,
        }
    }

    /// A fresh entry for audio still held on device storage.
    pub fn backlog(
        device: &DeviceInfo,
        codec: Codec,
        start_epoch: i64,
        total_bytes: u64,
        current_offset: u64,
        file_num: u32,
    ) -> Self {
        let total_frames = total_bytes / codec.bytes_per_frame();
        Self {
            id: Self::entry_id(&device.id, start_epoch),
            device: device.id.clone(),
            device_model: device.model.clone(),
            codec,
            channels: codec.channels(),
            sample_rate: codec.sample_rate(),
            status: EntryStatus::Miss,
            storage: StorageLocation::Sdcard,
            original_storage: None,
            file_name: None,
            timer_start: start_epoch,
            seconds: total_frames / codec.fps(),
            storage_offset: current_offset.min(total_bytes),
            storage_total_bytes: total_bytes,
            file_num,
            total_frames,
            synced_frame_offset: 0,
        }
    }

    /// Frame file name derived from the recording parameters.
    pub fn derived_file_name(&self) -> String {
        format!(
            "audio_{}_{}_{}_{}_fs{}_{}.bin",
            escape_device_id(&self.device),
            self.codec,
            self.sample_rate,
            self.channels,
            self.codec.bytes_per_frame(),
            self.timer_start
        )
    }

    pub fn expected_frames(&self) -> u64 {
        self.codec.fps() * self.seconds
    }

    pub fn is_complete(&self) -> bool {
        self.status == EntryStatus::Synced || self.total_frames >= self.expected_frames()
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.status, EntryStatus::Miss | EntryStatus::InProgress)
    }

    /// Ready for the upload queue.
    pub fn is_uploadable(&self) -> bool {
        self.status == EntryStatus::Miss && self.storage == StorageLocation::Disk
    }

    /// Created for audio pulled off device storage rather than live capture.
    pub fn is_backlog(&self) -> bool {
        self.storage == StorageLocation::Sdcard
            || self.original_storage == Some(StorageLocation::Sdcard)
            || self.storage_total_bytes > 0
    }

    /// Device-side bytes not yet pulled.
    pub fn remaining_bytes(&self) -> u64 {
        self.storage_total_bytes.saturating_sub(self.storage_offset)
    }
}

/// Keep ASCII alphanumerics and write every other byte as `_xx`, so distinct
/// ids never share a file name.
fn escape_device_id(id: &str) -> String {
    let mut escaped = String::with_capacity(id.len());
    for &b in id.as_bytes() {
        if b.is_ascii_alphanumeric() {
            escaped.push(b as char);
        } else {
            escaped.push('_');
            escaped.push_str(&hex::encode([b]));
        }
    }
    escaped
}
