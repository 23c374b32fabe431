//! Torrent information structures
//!
//! The piece layout and hashes of a single-file torrent, plus the JSON
//! manifest form used to hand it from a seeder to a downloader.

use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tracing::debug;

use crate::error::TorrentError;

/// Piece layout and identity of a torrent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TorrentInfo {
    /// Display name
    pub name: String,
    /// SHA1 identifying the torrent on the wire
    #[serde(with = "hex_hash")]
    pub info_hash: [u8; 20],
    /// Size of each piece in bytes (the last one may be shorter)
    pub piece_length: u32,
    /// Total payload size in bytes
    pub total_length: u64,
    /// SHA1 of every piece
    #[serde(with = "hex_hashes")]
    pub pieces: Vec<[u8; 20]>,
}

impl TorrentInfo {
    /// Build torrent info from its layout, checking that the hash list
    /// matches the piece count.
    pub fn new(name: impl Into<String>, piece_length: u32, total_length: u64, pieces: Vec<[u8; 20]>) -> Result<Self> {
        if piece_length == 0 {
            return Err(TorrentError::validation_error_with_field("piece length must be positive", "piece_length").into());
        }
        if total_length == 0 {
            return Err(TorrentError::validation_error_with_field("torrent must not be empty", "total_length").into());
        }
        let expected = total_length.div_ceil(u64::from(piece_length));
        if expected != pieces.len() as u64 || expected > u64::from(u32::MAX) {
            return Err(TorrentError::validation_error_with_field(
                format!("expected {} piece hashes, got {}", expected, pieces.len()),
                "pieces",
            )
            .into());
        }

        let name = name.into();
        let info_hash = Self::generate_info_hash(piece_length, total_length, &pieces);
        Ok(Self {
            name,
            info_hash,
            piece_length,
            total_length,
            pieces,
        })
    }

    /// Hash `data` piece by piece and build its torrent info
    pub fn from_data(name: impl Into<String>, data: &[u8], piece_length: u32) -> Result<Self> {
        if piece_length == 0 {
            return Err(TorrentError::validation_error_with_field("piece length must be positive", "piece_length").into());
        }
        let pieces: Vec<[u8; 20]> = data
            .chunks(piece_length as usize)
            .map(|chunk| Sha1::digest(chunk).into())
            .collect();
        Self::new(name, piece_length, data.len() as u64, pieces)
    }

    /// Derive the info hash from the piece layout
    pub fn generate_info_hash(piece_length: u32, total_length: u64, pieces: &[[u8; 20]]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(piece_length.to_be_bytes());
        hasher.update(total_length.to_be_bytes());
        for hash in pieces {
            hasher.update(hash);
        }
        hasher.finalize().into()
    }

    /// Number of pieces
    pub fn piece_count(&self) -> u32 {
        self.pieces.len() as u32
    }

    /// Length of piece `index`; zero when out of range
    pub fn piece_len(&self, index: u32) -> u32 {
        if index >= self.piece_count() {
            return 0;
        }
        let start = self.piece_offset(index);
        let end = (start + u64::from(self.piece_length)).min(self.total_length);
        (end - start) as u32
    }

    /// Byte offset of piece `index` in the payload
    pub fn piece_offset(&self, index: u32) -> u64 {
        u64::from(index) * u64::from(self.piece_length)
    }

    /// Get piece hash for a specific piece index
    pub fn piece_hash(&self, index: u32) -> Option<&[u8; 20]> {
        self.pieces.get(index as usize)
    }

    /// Get info hash as a hex string
    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    /// Read a JSON manifest, recomputing the info hash to reject tampering
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TorrentError::storage_error_full("Failed to read manifest", path.display().to_string(), e.to_string())
        })?;
        let info: TorrentInfo = serde_json::from_str(&content).map_err(TorrentError::from)?;
        let rebuilt = TorrentInfo::new(info.name.clone(), info.piece_length, info.total_length, info.pieces.clone())?;
        if rebuilt.info_hash != info.info_hash {
            return Err(TorrentError::validation_error_with_field("info hash does not match piece layout", "info_hash").into());
        }
        debug!("Loaded manifest for {} ({} pieces)", info.info_hash_hex(), info.piece_count());
        Ok(info)
    }

    /// Write the JSON manifest
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(TorrentError::from)?;
        std::fs::write(path, content).map_err(|e| {
            TorrentError::storage_error_full("Failed to write manifest", path.display().to_string(), e.to_string())
        })?;
        Ok(())
    }
}

mod hex_hash {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(hash: &[u8; 20], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(hash))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 20], D::Error> {
        let s = String::deserialize(deserializer)?;
        let mut hash = [0u8; 20];
        hex::decode_to_slice(&s, &mut hash).map_err(D::Error::custom)?;
        Ok(hash)
    }
}

mod hex_hashes {
    use serde::{de::Error, ser::SerializeSeq, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(hashes: &[[u8; 20]], serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(hashes.len()))?;
        for hash in hashes {
            seq.serialize_element(&hex::encode(hash))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<[u8; 20]>, D::Error> {
        let strings = Vec::<String>::deserialize(deserializer)?;
        strings
            .iter()
            .map(|s| {
                let mut hash = [0u8; 20];
                hex::decode_to_slice(s, &mut hash).map_err(D::Error::custom)?;
                Ok(hash)
            })
            .collect()
    }
}
