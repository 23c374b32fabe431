//! BitTorrent handshake
//!
//! The 68 byte greeting both sides send before any length-prefixed message.
//! It establishes the torrent (info hash) and the remote peer id.

use anyhow::Result;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace, warn};

use crate::error::TorrentError;
use crate::protocol::PeerId;

/// BitTorrent protocol identifier string
pub const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// Length of the protocol string
pub const PROTOCOL_LENGTH: u8 = 19;

/// Total length of a serialized handshake
pub const HANDSHAKE_LEN: usize = 68;

/// BitTorrent handshake message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Protocol identifier (19 bytes)
    pub protocol_id: [u8; 19],
    /// Reserved bytes, all zero since no extension is supported
    pub reserved: [u8; 8],
    /// Torrent info hash
    pub info_hash: [u8; 20],
    /// Sender's peer ID
    pub peer_id: PeerId,
}

impl Handshake {
    /// Create a new handshake with info_hash and peer_id
    pub fn new(info_hash: [u8; 20], peer_id: PeerId) -> Self {
        let mut protocol_id = [0u8; 19];
        protocol_id.copy_from_slice(PROTOCOL_STRING.as_bytes());
        Self {
            protocol_id,
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }

    /// Generate a random peer ID with "-RE" prefix
    pub fn generate_peer_id() -> PeerId {
        let mut peer_id = [0u8; 20];
        peer_id[0..3].copy_from_slice(b"-RE");
        peer_id[3..8].copy_from_slice(b"0100-");
        peer_id[8..].copy_from_slice(&rand::random::<[u8; 12]>());
        debug!("Generated new peer ID: {}", hex::encode(peer_id));
        peer_id
    }

    /// Serialize the handshake to bytes
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL_LENGTH);
        buf.put_slice(&self.protocol_id);
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.to_vec()
    }

    /// Deserialize a handshake from bytes
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        if data.len() < HANDSHAKE_LEN {
            return Err(TorrentError::protocol_error_with_source(
                "Handshake data too short",
                format!("expected {} bytes, got {}", HANDSHAKE_LEN, data.len()),
            )
            .into());
        }

        if data[0] != PROTOCOL_LENGTH || &data[1..20] != PROTOCOL_STRING.as_bytes() {
            return Err(TorrentError::protocol_error("Invalid protocol string").into());
        }

        let mut protocol_id = [0u8; 19];
        protocol_id.copy_from_slice(&data[1..20]);
        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&data[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&data[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&data[48..68]);

        trace!("Handshake from peer {}", hex::encode(peer_id));
        Ok(Self {
            protocol_id,
            reserved,
            info_hash,
            peer_id,
        })
    }

    /// Validate the handshake's info_hash
    pub fn validate(&self, expected_info_hash: &[u8; 20]) -> bool {
        if self.info_hash != *expected_info_hash {
            warn!(
                "Handshake info hash mismatch: expected {}, got {}",
                hex::encode(expected_info_hash),
                hex::encode(self.info_hash)
            );
            return false;
        }
        true
    }
}

/// Exchange handshakes on a fresh connection and return the remote peer id.
///
/// Both sides write first and then read, so the same call serves dialed and
/// accepted connections.
pub async fn exchange<S>(stream: &mut S, info_hash: [u8; 20], our_peer_id: PeerId) -> Result<PeerId>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ours = Handshake::new(info_hash, our_peer_id);
    stream.write_all(&ours.serialize()).await?;
    stream.flush().await?;

    let mut buf = [0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut buf).await?;
    let theirs = Handshake::deserialize(&buf)?;

    if !theirs.validate(&info_hash) {
        return Err(TorrentError::protocol_error("Handshake info hash mismatch").into());
    }
    if theirs.peer_id == our_peer_id {
        return Err(TorrentError::peer_error("Connected to ourselves").into());
    }
    Ok(theirs.peer_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_serialize_deserialize() {
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        let serialized = handshake.serialize();
        assert_eq!(serialized.len(), HANDSHAKE_LEN);
        assert_eq!(serialized[0], 19);
        assert_eq!(&serialized[1..20], PROTOCOL_STRING.as_bytes());

        let deserialized = Handshake::deserialize(&serialized).unwrap();
        assert_eq!(deserialized, handshake);
    }

    #[test]
    fn test_deserialize_rejects_other_protocols() {
        let mut serialized = Handshake::new([1u8; 20], [2u8; 20]).serialize();
        serialized[5] = b'X';
        assert!(Handshake::deserialize(&serialized).is_err());
        assert!(Handshake::deserialize(&serialized[..40]).is_err());
    }

    #[test]
    fn test_generate_peer_id() {
        let a = Handshake::generate_peer_id();
        let b = Handshake::generate_peer_id();
        assert_eq!(&a[0..3], b"-RE");
        assert_ne!(a, b);
    }

    #[test]
    fn test_handshake_validate() {
        let handshake = Handshake::new([1u8; 20], [2u8; 20]);
        assert!(handshake.validate(&[1u8; 20]));
        assert!(!handshake.validate(&[3u8; 20]));
    }

    #[tokio::test]
    async fn test_exchange_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let info_hash = [7u8; 20];
        let (ra, rb) = tokio::join!(
            exchange(&mut a, info_hash, [1u8; 20]),
            exchange(&mut b, info_hash, [2u8; 20]),
        );
        assert_eq!(ra.unwrap(), [2u8; 20]);
        assert_eq!(rb.unwrap(), [1u8; 20]);
    }

    #[tokio::test]
    async fn test_exchange_info_hash_mismatch() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let (ra, rb) = tokio::join!(
            exchange(&mut a, [7u8; 20], [1u8; 20]),
            exchange(&mut b, [8u8; 20], [2u8; 20]),
        );
        assert!(ra.is_err());
        assert!(rb.is_err());
    }
}
