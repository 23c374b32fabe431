//! Peer state module
//!
//! Choke/interest flags and the remote bitfield of one connection.

use std::net::SocketAddr;

use crate::protocol::{Bitfield, PeerId};

/// Protocol state of one peer connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerState {
    /// We're choking them
    pub am_choking: bool,
    /// We're interested
    pub am_interested: bool,
    /// They're choking us
    pub peer_choking: bool,
    /// They're interested
    pub peer_interested: bool,
    /// Pieces they have, unknown until their first bitfield or have
    pub bitfield: Option<Bitfield>,
}

impl Default for PeerState {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            bitfield: None,
        }
    }
}

impl PeerState {
    /// Check if peer has specific piece
    pub fn has_piece(&self, index: u32) -> bool {
        self.bitfield.as_ref().map(|bf| bf.has(index)).unwrap_or(false)
    }

    /// Check if we can request from peer
    pub fn can_request(&self) -> bool {
        !self.peer_choking && self.am_interested
    }

    /// Get the number of pieces the peer has
    pub fn piece_count(&self) -> u32 {
        self.bitfield.as_ref().map(Bitfield::count).unwrap_or(0)
    }
}

/// Point-in-time view of a peer link
#[derive(Debug, Clone)]
pub struct PeerStats {
    /// Peer address
    pub addr: SocketAddr,
    /// Peer identifier
    pub peer_id: PeerId,
    /// We're choking them
    pub am_choking: bool,
    /// We're interested
    pub am_interested: bool,
    /// They're choking us
    pub peer_choking: bool,
    /// They're interested
    pub peer_interested: bool,
    /// Pieces the peer announced
    pub pieces: u32,
}

impl PeerStats {
    pub fn new(addr: SocketAddr, peer_id: PeerId, state: &PeerState) -> Self {
        Self {
            addr,
            peer_id,
            am_choking: state.am_choking,
            am_interested: state.am_interested,
            peer_choking: state.peer_choking,
            peer_interested: state.peer_interested,
            pieces: state.piece_count(),
        }
    }

    /// Get the peer ID as a hex string
    pub fn peer_id_hex(&self) -> String {
        hex::encode(self.peer_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_state_defaults() {
        let state = PeerState::default();
        assert!(state.am_choking);
        assert!(!state.am_interested);
        assert!(state.peer_choking);
        assert!(!state.peer_interested);
        assert!(state.bitfield.is_none());
    }

    #[test]
    fn test_has_piece() {
        let mut state = PeerState::default();
        assert!(!state.has_piece(0));

        let mut bf = Bitfield::new(8);
        bf.set(0).unwrap();
        bf.set(1).unwrap();
        state.bitfield = Some(bf);

        assert!(state.has_piece(0));
        assert!(state.has_piece(1));
        assert!(!state.has_piece(2));
        assert!(!state.has_piece(8));
        assert_eq!(state.piece_count(), 2);
    }

    #[test]
    fn test_can_request() {
        let mut state = PeerState::default();
        assert!(!state.can_request());

        // Unchoke peer, but not interested
        state.peer_choking = false;
        assert!(!state.can_request());

        state.am_interested = true;
        assert!(state.can_request());
    }

    #[test]
    fn test_stats() {
        let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        let mut state = PeerState::default();
        state.bitfield = Some(Bitfield::full(5));
        let stats = PeerStats::new(addr, [0xAB; 20], &state);
        assert_eq!(stats.addr, addr);
        assert_eq!(stats.pieces, 5);
        assert!(stats.am_choking);
        assert_eq!(stats.peer_id_hex(), "ab".repeat(20));
    }
}
