use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::entry::WalEntry;
use super::{WalError, WalResult};

pub const CATALOG_VERSION: u32 = 1;

const PRIMARY_FILE: &str = "wals.json";
const BACKUP_FILE: &str = "wals_backup.json";

/// The persisted metadata document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    pub version: u32,
    pub timestamp_ms: i64,
    pub entries: Vec<WalEntry>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            version: CATALOG_VERSION,
            timestamp_ms: 0,
            entries: Vec::new(),
        }
    }
}

impl Catalog {
    pub fn get(&self, id: &str) -> Option<&WalEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut WalEntry> {
        self.entries.iter_mut().find(|e| e.id == id)
    }
}

/// Which file a catalog was recovered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatalogSource {
    Primary,
    Backup,
    Empty,
}

/// Primary and backup locations of the catalog document.
#[derive(Debug, Clone)]
pub struct CatalogFiles {
    pub primary: PathBuf,
    pub backup: PathBuf,
}

impl CatalogFiles {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            primary: dir.join(PRIMARY_FILE),
            backup: dir.join(BACKUP_FILE),
        }
    }

    /// Load the primary, then the backup, then give up and start empty.
    pub fn load(&self) -> (Catalog, CatalogSource) {
        match read_catalog(&self.primary) {
            Ok(catalog) => return (catalog, CatalogSource::Primary),
            Err(e) => warn!("Primary catalog unreadable ({}), trying backup", e),
        }
        match read_catalog(&self.backup) {
            Ok(catalog) => {
                warn!(entries = catalog.entries.len(), "Recovered catalog from backup");
                (catalog, CatalogSource::Backup)
            }
            Err(e) => {
                warn!("Backup catalog unreadable ({}), starting empty", e);
                (Catalog::default(), CatalogSource::Empty)
            }
        }
    }

    /// Copy primary over backup (best effort), then atomically replace primary.
    pub fn write(&self, json: &[u8]) -> WalResult<()> {
        if self.primary.exists() {
            if let Err(e) = std::fs::copy(&self.primary, &self.backup) {
                debug!("Skipping catalog backup: {}", e);
            }
        }

        let tmp = self.primary.with_extension("tmp");
        std::fs::write(&tmp, json).map_err(|e| WalError::io(&tmp, e))?;
        std::fs::rename(&tmp, &self.primary).map_err(|e| WalError::io(&self.primary, e))
    }

    /// Serialize on the caller, write on the blocking pool.
    pub async fn save(&self, catalog: &Catalog) -> WalResult<()> {
        let json = serde_json::to_vec_pretty(catalog)?;
        let files = self.clone();
        tokio::task::spawn_blocking(move || files.write(&json))
            .await
            .map_err(|e| WalError::Task(e.to_string()))?
    }
}

fn read_catalog(path: &Path) -> WalResult<Catalog> {
    let bytes = std::fs::read(path).map_err(|e| WalError::io(path, e))?;
    Ok(serde_json::from_slice(&bytes)?)
}
