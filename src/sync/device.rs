//! The slice of the device connection the sync engine depends on.
//!
//! The BLE transport lives outside this crate; it implements
//! [`DeviceConnection`] and hands us command calls and byte streams.

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use serde::Serialize;

use super::SyncError;
use crate::wal::{Codec, DeviceInfo};

/// Storage opcodes sent over the command characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageCommand {
    Read = 0,
    Clear = 1,
}

impl StorageCommand {
    pub fn opcode(self) -> u8 {
        self as u8
    }
}

/// Device-side WiFi state, reported on the status stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WifiStatus {
    Off = 0,
    ShuttingDown = 1,
    On = 2,
    Connecting = 3,
    Connected = 4,
    TcpConnected = 5,
}

impl WifiStatus {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(WifiStatus::Off),
            1 => Some(WifiStatus::ShuttingDown),
            2 => Some(WifiStatus::On),
            3 => Some(WifiStatus::Connecting),
            4 => Some(WifiStatus::Connected),
            5 => Some(WifiStatus::TcpConnected),
            _ => None,
        }
    }

    /// The access point is up and the host can open the socket.
    pub fn is_active(&self) -> bool {
        matches!(self, WifiStatus::Connected | WifiStatus::TcpConnected)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WifiSetupResult {
    Accepted,
    Rejected(String),
}

/// Access point credentials pushed to the device before WiFi sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiCredentials {
    pub ssid: String,
    pub password: String,
}

impl WifiCredentials {
    pub fn new(ssid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            ssid: ssid.into(),
            password: password.into(),
        }
    }

    /// SSID must be 1-32 bytes and the WPA2 passphrase 8-63 bytes.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.ssid.is_empty() || self.ssid.len() > 32 {
            return Err(SyncError::SetupFailed(format!(
                "SSID must be 1-32 bytes, got {}",
                self.ssid.len()
            )));
        }
        if self.password.len() < 8 || self.password.len() > 63 {
            return Err(SyncError::SetupFailed(format!(
                "password must be 8-63 bytes, got {}",
                self.password.len()
            )));
        }
        Ok(())
    }
}

/// A connected recording device.
#[async_trait]
pub trait DeviceConnection: Send + Sync {
    fn device(&self) -> DeviceInfo;

    /// Codec the device records backlog audio with.
    fn codec(&self) -> Codec;

    async fn is_connected(&self) -> bool;

    /// `[total_bytes, current_offset]`, or fewer values when nothing is stored.
    async fn get_storage_list(&self) -> Vec<u64>;

    async fn write_storage_command(&self, file_num: u32, command: StorageCommand, offset: u64) -> bool;

    /// Chunks notified on the storage data characteristic.
    async fn storage_byte_stream(&self) -> BoxStream<'static, std::io::Result<Vec<u8>>>;

    async fn is_wifi_sync_supported(&self) -> bool {
        false
    }

    async fn setup_wifi_sync(&self, _credentials: &WifiCredentials) -> WifiSetupResult {
        WifiSetupResult::Rejected("WiFi sync not supported".to_string())
    }

    async fn start_wifi_sync(&self) -> bool {
        false
    }

    async fn stop_wifi_sync(&self) -> bool {
        true
    }

    /// Raw WiFi status codes as the device reports them.
    async fn wifi_status_stream(&self) -> BoxStream<'static, u8> {
        Box::pin(stream::empty())
    }
}
