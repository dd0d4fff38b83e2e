use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info};

use crate::chunker::ChunkerConfig;
use crate::sync::{SdCardConfig, WifiConfig};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub wal: WalSettings,
    pub chunker: ChunkerSettings,
    pub sdcard: SdCardSettings,
    pub wifi: WifiSettings,
    pub upload: UploadSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalSettings {
    pub data_dir: PathBuf,
    pub retention_days: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerSettings {
    pub chunk_seconds: u64,
    pub flush_seconds: u64,
    pub grace_seconds: u64,
    pub unsynced_frame_threshold: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SdCardSettings {
    pub min_seconds_to_sync: u64,
    pub progress_interval_ms: u64,
    pub idle_timeout_secs: u64,
    pub file_num: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WifiSettings {
    pub device_host: String,
    pub device_port: u16,
    pub connection_timeout_secs: u64,
    pub transfer_timeout_secs: u64,
    pub status_poll_interval_ms: u64,
    pub tcp_connect_timeout_secs: u64,
    pub read_chunk_bytes: usize,
    pub speed_window_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadSettings {
    pub user_id: Option<String>,
    pub outbox_dir: Option<PathBuf>,
    /// Daemon upload cadence
    pub interval_secs: u64,
}

impl Default for WalSettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            retention_days: 7,
        }
    }
}

impl Default for ChunkerSettings {
    fn default() -> Self {
        Self {
            chunk_seconds: 60,
            flush_seconds: 90,
            grace_seconds: 15,
            unsynced_frame_threshold: 1000,
        }
    }
}

impl Default for SdCardSettings {
    fn default() -> Self {
        Self {
            min_seconds_to_sync: 10,
            progress_interval_ms: 500,
            idle_timeout_secs: 30,
            file_num: 1,
        }
    }
}

impl Default for WifiSettings {
    fn default() -> Self {
        Self {
            device_host: "192.168.4.1".to_string(),
            device_port: 12345,
            connection_timeout_secs: 60,
            transfer_timeout_secs: 300,
            status_poll_interval_ms: 500,
            tcp_connect_timeout_secs: 10,
            read_chunk_bytes: 65536,
            speed_window_secs: 3,
        }
    }
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            user_id: None,
            outbox_dir: None,
            interval_secs: 300,
        }
    }
}

/// `<platform data dir>/wal-sync/wals`, or a temp dir when there is none.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("wal-sync")
        .join("wals")
}

/// `<platform config dir>/wal-sync/settings.json`
pub fn default_settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("wal-sync")
        .join("settings.json")
}

impl Settings {
    /// Read settings from `path`. A missing or unparsable file yields defaults.
    pub fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                error!("Failed to parse {}: {}, using defaults", path.display(), e);
                Settings::default()
            }),
            Err(_) => {
                info!("No settings at {}, using defaults", path.display());
                Settings::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), String> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| format!("Failed to create {}: {}", parent.display(), e))?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|e| format!("Failed to serialize settings: {}", e))?;
        fs::write(path, json).map_err(|e| format!("Failed to save settings: {}", e))
    }

    /// Outbox directory, defaulting to a sibling of the WAL directory.
    pub fn outbox_dir(&self) -> PathBuf {
        self.upload.outbox_dir.clone().unwrap_or_else(|| {
            self.wal
                .data_dir
                .parent()
                .unwrap_or(&self.wal.data_dir)
                .join("outbox")
        })
    }

    pub fn chunker_config(&self) -> ChunkerConfig {
        ChunkerConfig {
            chunk_seconds: self.chunker.chunk_seconds,
            flush_seconds: self.chunker.flush_seconds,
            grace_seconds: self.chunker.grace_seconds,
            unsynced_frame_threshold: self.chunker.unsynced_frame_threshold,
        }
    }

    pub fn sdcard_config(&self) -> SdCardConfig {
        SdCardConfig {
            min_seconds_to_sync: self.sdcard.min_seconds_to_sync,
            progress_interval: Duration::from_millis(self.sdcard.progress_interval_ms),
            idle_timeout: Duration::from_secs(self.sdcard.idle_timeout_secs),
            file_num: self.sdcard.file_num,
        }
    }

    pub fn wifi_config(&self) -> WifiConfig {
        WifiConfig {
            device_host: self.wifi.device_host.clone(),
            device_port: self.wifi.device_port,
            connection_timeout: Duration::from_secs(self.wifi.connection_timeout_secs),
            transfer_timeout: Duration::from_secs(self.wifi.transfer_timeout_secs),
            status_poll_interval: Duration::from_millis(self.wifi.status_poll_interval_ms),
            tcp_connect_timeout: Duration::from_secs(self.wifi.tcp_connect_timeout_secs),
            read_chunk_bytes: self.wifi.read_chunk_bytes,
            speed_window: Duration::from_secs(self.wifi.speed_window_secs),
            min_seconds_to_sync: self.sdcard.min_seconds_to_sync,
            progress_interval: Duration::from_millis(self.sdcard.progress_interval_ms),
            file_num: self.sdcard.file_num,
        }
    }
}
