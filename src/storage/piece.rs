//! Piece and block tracking
//!
//! Torrent-wide ledger of which blocks have arrived, which pieces are being
//! verified and which are complete.

use std::fmt;

use anyhow::Result;
use bytes::Bytes;
use tracing::{debug, trace};

use crate::error::TorrentError;
use crate::peer::LinkId;
use crate::protocol::{Bitfield, BLOCK_LEN};
use crate::torrent::TorrentInfo;

/// Number of blocks in a piece of `piece_len` bytes
pub fn block_count(piece_len: u32) -> u32 {
    piece_len.div_ceil(BLOCK_LEN)
}

/// Length of the block starting at `offset` in a piece of `piece_len` bytes
pub fn block_len(piece_len: u32, offset: u32) -> u32 {
    piece_len.saturating_sub(offset).min(BLOCK_LEN)
}

/// A block within a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockInfo {
    /// Piece index this block belongs to
    pub piece_index: u32,
    /// Offset within the piece
    pub offset: u32,
    /// Length of the block
    pub len: u32,
}

impl BlockInfo {
    /// Create a new block
    pub fn new(piece_index: u32, offset: u32, len: u32) -> Self {
        Self { piece_index, offset, len }
    }

    /// Position of this block in its piece's block bitmap
    pub fn block_index(&self) -> u32 {
        self.offset / BLOCK_LEN
    }
}

impl fmt::Display for BlockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "piece {} @{}+{}", self.piece_index, self.offset, self.len)
    }
}

/// State of a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PieceState {
    /// No block received
    #[default]
    Missing,
    /// Some blocks received
    InProgress,
    /// All blocks received, hash check pending
    Verifying,
    /// Verified and stored
    Complete,
}

/// One piece of the torrent
#[derive(Debug)]
pub struct Piece {
    /// Piece index
    pub index: u32,
    /// Piece length in bytes
    pub length: u32,
    /// Blocks received so far
    blocks: Bitfield,
    state: PieceState,
    buffer: Vec<u8>,
    contributors: Vec<LinkId>,
}

impl Piece {
    fn new(index: u32, length: u32, complete: bool) -> Self {
        let count = block_count(length);
        Self {
            index,
            length,
            blocks: if complete { Bitfield::full(count) } else { Bitfield::new(count) },
            state: if complete { PieceState::Complete } else { PieceState::Missing },
            buffer: Vec::new(),
            contributors: Vec::new(),
        }
    }

    /// Current state
    pub fn state(&self) -> PieceState {
        self.state
    }

    /// Block bitmap
    pub fn blocks(&self) -> &Bitfield {
        &self.blocks
    }

    /// Links that supplied at least one block since the last reset
    pub fn contributors(&self) -> &[LinkId] {
        &self.contributors
    }

    /// Whether blocks can still be accepted for this piece
    pub fn is_wanted(&self) -> bool {
        matches!(self.state, PieceState::Missing | PieceState::InProgress)
    }

    /// Blocks not yet received, in offset order
    pub fn unreceived_blocks(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        let wanted = self.is_wanted();
        (0..self.blocks.len())
            .filter(move |&b| wanted && !self.blocks.has(b))
            .map(move |b| {
                let offset = b * BLOCK_LEN;
                BlockInfo::new(self.index, offset, block_len(self.length, offset))
            })
    }

    fn reset(&mut self) {
        self.blocks.clear_all();
        self.buffer = Vec::new();
        self.contributors.clear();
        self.state = PieceState::Missing;
    }
}

/// Outcome of handing a block to the tracker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    /// The piece is already verifying or complete
    Stale,
    /// This block was already received
    Duplicate,
    /// Stored, the piece still misses blocks
    Stored,
    /// Stored, and it completed the piece: the assembled bytes must be verified
    PieceReady(Bytes),
}

/// Outcome of a piece verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// The piece is now complete
    Completed,
    /// Hash mismatch; the piece was reset. Holds the links that supplied it
    Failed(Vec<LinkId>),
    /// The piece was not verifying
    Ignored,
}

/// Tracks piece and block state for one torrent
#[derive(Debug)]
pub struct PieceTracker {
    pieces: Vec<Piece>,
    have: Bitfield,
}

impl PieceTracker {
    /// Create a tracker; pieces set in `have` start complete
    pub fn new(info: &TorrentInfo, have: Bitfield) -> Result<Self> {
        if have.len() != info.piece_count() {
            return Err(TorrentError::validation_error_with_field(
                format!("bitfield has {} bits for {} pieces", have.len(), info.piece_count()),
                "have",
            )
            .into());
        }
        let pieces = (0..info.piece_count())
            .map(|i| Piece::new(i, info.piece_len(i), have.has(i)))
            .collect();
        Ok(Self { pieces, have })
    }

    /// Number of pieces
    pub fn piece_count(&self) -> u32 {
        self.pieces.len() as u32
    }

    /// Get a piece
    pub fn piece(&self, index: u32) -> Option<&Piece> {
        self.pieces.get(index as usize)
    }

    /// State of piece `index`, `None` when out of range
    pub fn state(&self, index: u32) -> Option<PieceState> {
        self.piece(index).map(Piece::state)
    }

    /// Pieces we hold, verified
    pub fn have(&self) -> &Bitfield {
        &self.have
    }

    /// Whether every piece is complete
    pub fn is_complete(&self) -> bool {
        self.have.all()
    }

    /// Whether `peer` holds a piece we still want
    pub fn wants_any(&self, peer: &Bitfield) -> bool {
        peer.iter_set().any(|i| self.piece(i).map(Piece::is_wanted).unwrap_or(false))
    }

    /// Whether `block` has the layout of a block of its piece
    pub fn check_block(&self, block: &BlockInfo) -> Result<()> {
        let piece = self.piece(block.piece_index).ok_or_else(|| {
            TorrentError::validation_error_with_field(format!("piece {} out of range", block.piece_index), "piece_index")
        })?;
        if block.offset % BLOCK_LEN != 0 || block.offset >= piece.length || block.len != block_len(piece.length, block.offset) {
            return Err(TorrentError::validation_error_with_field(format!("invalid block {}", block), "block").into());
        }
        Ok(())
    }

    /// Store a received block
    pub fn receive_block(&mut self, link: LinkId, block: BlockInfo, data: &[u8]) -> Result<BlockOutcome> {
        self.check_block(&block)?;
        if data.len() != block.len as usize {
            return Err(TorrentError::validation_error_with_field(
                format!("block {} carries {} bytes", block, data.len()),
                "data",
            )
            .into());
        }

        let piece = &mut self.pieces[block.piece_index as usize];
        if !piece.is_wanted() {
            trace!("Ignoring block {} for {:?} piece", block, piece.state);
            return Ok(BlockOutcome::Stale);
        }
        if piece.blocks.has(block.block_index()) {
            return Ok(BlockOutcome::Duplicate);
        }

        if piece.state == PieceState::Missing {
            piece.buffer = vec![0; piece.length as usize];
            piece.state = PieceState::InProgress;
        }
        let start = block.offset as usize;
        piece.buffer[start..start + data.len()].copy_from_slice(data);
        piece.blocks.set(block.block_index())?;
        if !piece.contributors.contains(&link) {
            piece.contributors.push(link);
        }

        if piece.blocks.all() {
            debug!("Piece {} assembled from {} links", piece.index, piece.contributors.len());
            piece.state = PieceState::Verifying;
            return Ok(BlockOutcome::PieceReady(Bytes::from(std::mem::take(&mut piece.buffer))));
        }
        Ok(BlockOutcome::Stored)
    }

    /// Record the hash check of a verifying piece
    pub fn finish_verification(&mut self, index: u32, passed: bool) -> VerifyOutcome {
        let Some(piece) = self.pieces.get_mut(index as usize) else {
            return VerifyOutcome::Ignored;
        };
        if piece.state != PieceState::Verifying {
            return VerifyOutcome::Ignored;
        }

        if passed {
            piece.state = PieceState::Complete;
            piece.contributors.clear();
            // index is in range, so this cannot fail
            let _ = self.have.set(index);
            VerifyOutcome::Completed
        } else {
            let contributors = std::mem::take(&mut piece.contributors);
            piece.reset();
            VerifyOutcome::Failed(contributors)
        }
    }
}
