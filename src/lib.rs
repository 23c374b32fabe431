//! rust-torrent-engine
//!
//! The data exchange half of a BitTorrent client: peer wire codec, peer
//! links, piece tracking, request scheduling and a per-torrent coordinator.

pub mod cli;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod storage;
pub mod torrent;

pub use error::TorrentError;

pub use cli::{CliArgs, Command, Config};
pub use peer::{LinkId, PeerEvent, PeerEventKind, PeerLink, PeerState, PeerStats};
pub use protocol::{Bitfield, Handshake, Message, MessageId, PeerId};
pub use storage::{
    recheck, BlockInfo, FileStorage, MemoryStorage, PieceTracker, PieceVerifier, RequestScheduler, Sha1Verifier,
    Storage,
};
pub use torrent::{
    CorruptionPolicy, StrikeLimit, TolerateCorruption, Torrent, TorrentConfig, TorrentInfo, TorrentStats,
};
