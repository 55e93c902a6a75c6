//! Cross-process persistence: the engine's non-terminal downloads are
//! serialized to a session file and reconstructed on the next start.

use crate::engine::request_group::DownloadState;
use crate::error::StoreError;
use crate::options::DownloadOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEntry {
    pub gid: String,
    pub uris: Vec<String>,
    pub options: DownloadOptions,
    pub state: DownloadState,
    pub priority: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Session {
    pub downloads: Vec<SessionEntry>,
}

/// Atomic-by-rename save; a missing session file loads as an empty session.
pub struct SessionManager {
    path: PathBuf,
    lock: Mutex<()>,
}

impl SessionManager {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub async fn save(&self, session: &Session) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| StoreError::EnsureDir {
                        path: parent.to_path_buf(),
                        source,
                    })?;
            }
        }

        let bytes = serde_json::to_vec_pretty(session)
            .map_err(|source| StoreError::Serialize { source })?;
        let tmp = {
            let mut raw = self.path.as_os_str().to_os_string();
            raw.push(".tmp");
            PathBuf::from(raw)
        };
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

    pub async fn load(&self) -> Result<Session, StoreError> {
        let _guard = self.lock.lock().await;
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Session::default());
            }
            Err(source) => {
                return Err(StoreError::ReadFile {
                    path: self.path.clone(),
                    source,
                });
            }
        };
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
