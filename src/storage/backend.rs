//! Storage backend abstraction
//!
//! The exchange engine only reads and writes the torrent payload by byte
//! offset; how those bytes are laid out on a medium is up to the backend.

use async_trait::async_trait;
use bytes::Bytes;

use anyhow::Result;

/// Random-access store for the torrent payload
///
/// Offsets are relative to the start of the payload. Implementations must
/// be safe to call from several tasks at once.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Read exactly `len` bytes starting at `offset`
    async fn read_at(&self, offset: u64, len: u32) -> Result<Bytes>;

    /// Write `data` starting at `offset`
    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Current size of the store in bytes
    async fn size(&self) -> Result<u64>;
}
