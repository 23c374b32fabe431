//! File storage module
//!
//! Keeps the payload of a single-file torrent in one file on disk.

use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, error, info, trace};

use crate::error::TorrentError;
use crate::storage::backend::Storage;

/// File storage for torrent data
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    file: Mutex<fs::File>,
}

impl FileStorage {
    /// Create (or extend) the file at `path` so it holds `length` bytes
    pub async fn create(path: impl AsRef<Path>, length: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        info!("Creating file storage: {} ({} bytes)", path.display(), length);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                debug!("Creating directory: {}", parent.display());
                fs::create_dir_all(parent).await.map_err(|e| {
                    error!("Failed to create directory '{}': {}", parent.display(), e);
                    TorrentError::storage_error_full("Failed to create directory", parent.display().to_string(), e.to_string())
                })?;
            }
        }

        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await
            .map_err(|e| {
                error!("Failed to create file '{}': {}", path.display(), e);
                TorrentError::storage_error_full("Failed to create file", path.display().to_string(), e.to_string())
            })?;
        file.set_len(length).await.map_err(|e| {
            error!("Failed to set file length for '{}': {}", path.display(), e);
            TorrentError::storage_error_full("Failed to set file length", path.display().to_string(), e.to_string())
        })?;

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Open an existing file read-write, keeping its contents
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        info!("Opening file storage: {}", path.display());
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .await
            .map_err(|e| {
                error!("Failed to open file '{}': {}", path.display(), e);
                TorrentError::storage_error_full("Failed to open file", path.display().to_string(), e.to_string())
            })?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, message: &str, offset: u64, err: std::io::Error) -> TorrentError {
        error!("{} '{}' at offset {}: {}", message, self.path.display(), offset, err);
        TorrentError::storage_error_full(message, format!("{}@{}", self.path.display(), offset), err.to_string())
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn read_at(&self, offset: u64, len: u32) -> Result<Bytes> {
        trace!("Reading {} bytes at offset {}", len, offset);
        let mut file = self.file.lock().await;
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|e| self.io_error("Failed to seek in file", offset, e))?;
        let mut buf = vec![0u8; len as usize];
        file.read_exact(&mut buf)
            .await
            .map_err(|e| self.io_error("Failed to read from file", offset, e))?;
        Ok(Bytes::from(buf))
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        trace!("Writing {} bytes at offset {}", data.len(), offset);
        let mut file = self.file.lock().await;
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|e| self.io_error("Failed to seek in file", offset, e))?;
        file.write_all(data)
            .await
            .map_err(|e| self.io_error("Failed to write to file", offset, e))?;
        file.flush()
            .await
            .map_err(|e| self.io_error("Failed to flush file", offset, e))?;
        Ok(())
    }

    async fn size(&self) -> Result<u64> {
        let file = self.file.lock().await;
        let metadata = file
            .metadata()
            .await
            .map_err(|e| self.io_error("Failed to stat file", 0, e))?;
        Ok(metadata.len())
    }
}
