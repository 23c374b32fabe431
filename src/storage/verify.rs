//! Piece verification

use std::sync::Arc;

use anyhow::Result;
use sha1::{Digest, Sha1};
use tracing::{debug, info, trace};

use crate::protocol::Bitfield;
use crate::storage::backend::Storage;
use crate::torrent::TorrentInfo;

/// Checks an assembled piece before it is stored
pub trait PieceVerifier: Send + Sync {
    /// Whether `data` is the correct content of piece `index`
    fn verify(&self, index: u32, data: &[u8]) -> bool;
}

/// Compares the SHA1 of a piece with the torrent's piece hashes
#[derive(Debug, Clone)]
pub struct Sha1Verifier {
    info: Arc<TorrentInfo>,
}

impl Sha1Verifier {
    pub fn new(info: Arc<TorrentInfo>) -> Self {
        Self { info }
    }
}

impl PieceVerifier for Sha1Verifier {
    fn verify(&self, index: u32, data: &[u8]) -> bool {
        let Some(expected) = self.info.piece_hash(index) else {
            return false;
        };
        let actual: [u8; 20] = Sha1::digest(data).into();
        trace!("Piece {} hash {}", index, hex::encode(actual));
        actual == *expected
    }
}

/// Hash every piece already in `storage` and return the ones that match.
///
/// Used to resume a partial download from an existing file.
pub async fn recheck(storage: &dyn Storage, info: &TorrentInfo, verifier: &dyn PieceVerifier) -> Result<Bitfield> {
    let mut have = Bitfield::new(info.piece_count());
    for index in 0..info.piece_count() {
        let data = storage.read_at(info.piece_offset(index), info.piece_len(index)).await?;
        if verifier.verify(index, &data) {
            have.set(index)?;
        }
    }
    info!("Recheck found {}/{} pieces", have.count(), info.piece_count());
    debug!("Recheck bitfield: {}", have.hex());
    Ok(have)
}
