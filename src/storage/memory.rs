//! In-memory storage
//!
//! A fixed-size byte buffer, handy for tests and small transfers.

use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

use crate::error::TorrentError;
use crate::storage::backend::Storage;

/// Storage backed by a byte vector
#[derive(Debug, Default)]
pub struct MemoryStorage {
    data: Mutex<Vec<u8>>,
}

impl MemoryStorage {
    /// Zero-filled storage of `len` bytes
    pub fn new(len: usize) -> Self {
        Self::from_vec(vec![0; len])
    }

    /// Storage holding `data`
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data: Mutex::new(data) }
    }

    /// Copy out the whole buffer
    pub fn snapshot(&self) -> Vec<u8> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<u8>> {
        // a poisoned buffer is still plain bytes
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn range(len: usize, offset: u64, count: usize) -> Result<std::ops::Range<usize>> {
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        match start.checked_add(count) {
            Some(end) if end <= len => Ok(start..end),
            _ => Err(TorrentError::storage_error_full(
                "Access out of bounds",
                format!("memory@{}", offset),
                format!("{} bytes requested, {} available", count, len),
            )
            .into()),
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn read_at(&self, offset: u64, len: u32) -> Result<Bytes> {
        let data = self.lock();
        let range = Self::range(data.len(), offset, len as usize)?;
        Ok(Bytes::copy_from_slice(&data[range]))
    }

    async fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        let mut data = self.lock();
        let range = Self::range(data.len(), offset, bytes.len())?;
        data[range].copy_from_slice(bytes);
        Ok(())
    }

    async fn size(&self) -> Result<u64> {
        Ok(self.lock().len() as u64)
    }
}
