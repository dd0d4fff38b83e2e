//! Binary frame files: repeated `[u32 LE length][length bytes]` records.

use std::path::Path;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::{WalError, WalResult};
use crate::protocol::Frame;

pub fn encode_frames(frames: &[Frame]) -> Vec<u8> {
    let size: usize = frames.iter().map(|f| 4 + f.len()).sum();
    let mut out = Vec::with_capacity(size);
    for frame in frames {
        out.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        out.extend_from_slice(frame);
    }
    out
}

/// Decode records until the buffer ends, a zero length appears, or a length
/// overruns the buffer. Never fails; a damaged tail just yields fewer frames.
pub fn decode_frames(bytes: &[u8]) -> Vec<Frame> {
    let mut frames = Vec::new();
    let mut offset = 0usize;

    while offset + 4 <= bytes.len() {
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&bytes[offset..offset + 4]);
        let length = u32::from_le_bytes(len_bytes) as usize;
        offset += 4;

        if length == 0 || length > bytes.len() - offset {
            break;
        }
        frames.push(bytes[offset..offset + length].to_vec());
        offset += length;
    }

    frames
}

/// Replace the file with exactly `frames`, via a temp file and rename.
pub async fn write_frames(path: &Path, frames: &[Frame]) -> WalResult<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, encode_frames(frames))
        .await
        .map_err(|e| WalError::io(&tmp, e))?;
    fs::rename(&tmp, path)
        .await
        .map_err(|e| WalError::io(path, e))
}

/// Append records to the file, creating it if needed.
pub async fn append_frames(path: &Path, frames: &[Frame]) -> WalResult<()> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| WalError::io(path, e))?;
    file.write_all(&encode_frames(frames))
        .await
        .map_err(|e| WalError::io(path, e))?;
    file.sync_data().await.map_err(|e| WalError::io(path, e))
}

pub async fn read_frames(path: &Path) -> WalResult<Vec<Frame>> {
    let bytes = fs::read(path).await.map_err(|e| WalError::io(path, e))?;
    Ok(decode_frames(&bytes))
}
