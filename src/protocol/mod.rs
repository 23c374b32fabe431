//! BitTorrent protocol module
//!
//! Implements the BitTorrent peer wire protocol.

pub mod bitfield;
pub mod handshake;
pub mod message;
pub mod wire;

/// Length of the blocks we request
pub const BLOCK_LEN: u32 = 16 * 1024;

/// Reject requests larger than this size
pub const MAX_BLOCK_LEN: u32 = 32 * 1024;

/// The 20 byte peer id exchanged in the handshake
pub type PeerId = [u8; 20];

// Re-export main types
pub use bitfield::{num_bytes, Bitfield};
pub use handshake::{exchange, Handshake, HANDSHAKE_LEN, PROTOCOL_LENGTH, PROTOCOL_STRING};
pub use message::{Message, MessageId};
pub use wire::{write_message, MessageReader};
