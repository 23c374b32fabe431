//! Storage module
//!
//! Piece bookkeeping, request scheduling and the payload backends.

pub mod backend;
pub mod download;
pub mod file;
pub mod memory;
pub mod piece;
pub mod verify;

// Re-export backend types
pub use backend::Storage;
pub use file::FileStorage;
pub use memory::MemoryStorage;
pub use verify::{recheck, PieceVerifier, Sha1Verifier};

// Re-export tracking types
pub use download::{PendingRequest, RequestScheduler};
pub use piece::{block_count, block_len, BlockInfo, BlockOutcome, Piece, PieceState, PieceTracker, VerifyOutcome};
