//! Peer module
//!
//! One connection per peer: its protocol state and its read/write tasks.

pub mod link;
pub mod state;

// Re-export main types
pub use link::{LinkId, LinkParams, PeerEvent, PeerEventKind, PeerLink};
pub use state::{PeerState, PeerStats};
