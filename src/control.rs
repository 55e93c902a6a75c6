//! The control file is a JSON sidecar next to the output file holding the
//! download geometry and completion bitfield. Its presence makes a download
//! resumable; it is removed only after a fully verified success.

use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Sidecar suffix appended to the output path.
pub const CONTROL_SUFFIX: &str = "grapnel";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlFile {
    pub gid: String,
    pub total_length: u64,
    pub piece_length: u64,
    pub num_pieces: usize,
    /// Lowercase hex, `ceil(num_pieces / 8)` bytes wide.
    pub bitfield: String,
    pub uris: Vec<String>,
    pub path: String,
}

impl ControlFile {
    /// A control file only resurrects a download when its geometry is sane.
    pub fn is_resumable(&self) -> bool {
        self.total_length > 0 && self.piece_length > 0
    }
}

/// Serializes control-file access for one download. Saves are atomic from
/// the reader's point of view (write-to-temp, then rename).
pub struct Controller {
    path: PathBuf,
    lock: Mutex<()>,
}

impl Controller {
    pub fn new(output_path: &Path) -> Self {
        let mut raw = output_path.as_os_str().to_os_string();
        raw.push(".");
        raw.push(CONTROL_SUFFIX);
        Self {
            path: PathBuf::from(raw),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub async fn save(&self, state: &ControlFile) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let bytes = serde_json::to_vec_pretty(state)
            .map_err(|source| StoreError::Serialize { source })?;

        let tmp = tmp_path(&self.path);
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|source| StoreError::WriteFile {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|source| StoreError::Rename {
                from: tmp,
                to: self.path.clone(),
                source,
            })?;
        Ok(())
    }

    /// Load failure is non-fatal to callers: they fall back to a fresh
    /// download. The error still says what was wrong.
    pub async fn load(&self) -> Result<ControlFile, StoreError> {
        let _guard = self.lock.lock().await;
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|source| StoreError::ReadFile {
                path: self.path.clone(),
                source,
            })?;
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    pub async fn remove(&self) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StoreError::Remove {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut raw = path.as_os_str().to_os_string();
    raw.push(".tmp");
    PathBuf::from(raw)
}
