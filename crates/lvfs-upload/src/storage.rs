//! Content-addressed archive storage.

use std::{
    io,
    path::PathBuf,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("cannot open {path} for writing in {dir}: {source}")]
    Open {
        dir: PathBuf,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to remove {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Destination for accepted firmware archives.
#[async_trait]
pub trait FirmwareStorage: Send + Sync {
    /// Writes `data` under `filename`, replacing any previous content, and
    /// returns the full destination path. Names embed the content hash, so a
    /// replaced file always holds the same bytes.
    async fn store(&self, filename: &str, data: &[u8]) -> Result<PathBuf, StorageError>;

    async fn remove(&self, filename: &str) -> Result<(), StorageError>;
}

/// Stores archives as plain files inside one upload directory.
#[derive(Debug, Clone)]
pub struct LocalFirmwareStorage {
    upload_dir: PathBuf,
}

impl LocalFirmwareStorage {
    pub fn new(upload_dir: impl Into<PathBuf>) -> Self {
        Self {
            upload_dir: upload_dir.into(),
        }
    }

    /// Creates the upload directory if it is missing.
    pub async fn prepare(&self) -> io::Result<()> {
        fs::create_dir_all(&self.upload_dir).await
    }

    pub fn path_for(&self, filename: &str) -> PathBuf {
        self.upload_dir.join(filename)
    }
}

#[async_trait]
impl FirmwareStorage for LocalFirmwareStorage {
    async fn store(&self, filename: &str, data: &[u8]) -> Result<PathBuf, StorageError> {
        let path = self.path_for(filename);
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await
            .map_err(|source| StorageError::Open {
                dir: self.upload_dir.clone(),
                path: path.clone(),
                source,
            })?;

        let written = async {
            file.write_all(data).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;

        written.map_err(|source| StorageError::Write {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    async fn remove(&self, filename: &str) -> Result<(), StorageError> {
        let path = self.path_for(filename);
        fs::remove_file(&path)
            .await
            .map_err(|source| StorageError::Remove { path, source })
    }
}
