//! Torrent module
//!
//! Torrent metadata, engine configuration and the coordinator that drives
//! piece exchange with a set of peers.

pub mod choker;
pub mod config;
pub mod coordinator;
pub mod info;
pub mod policy;

pub use choker::{ChokeCandidate, Choker};
pub use config::TorrentConfig;
pub use coordinator::{Torrent, TorrentStats};
pub use info::TorrentInfo;
pub use policy::{CorruptionPolicy, StrikeLimit, TolerateCorruption};
