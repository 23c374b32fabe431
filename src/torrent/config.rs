//! Torrent engine configuration

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::TorrentError;

/// Tunables of one torrent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TorrentConfig {
    /// Address to accept peers on; port 0 picks a free port
    pub listen_addr: SocketAddr,
    /// Silence after which a peer is dropped
    pub read_timeout_secs: u64,
    /// Time allowed to connect and exchange handshakes
    pub handshake_timeout_secs: u64,
    /// Requests in flight per peer
    pub max_pipeline: usize,
    /// Age after which a request is handed to another peer
    pub stall_timeout_secs: u64,
    /// Connected peers at most
    pub max_peers: usize,
    /// Peers we upload to at once, optimistic slot included
    pub max_unchoked: usize,
    pub rechoke_interval_secs: u64,
    /// Rechokes between optimistic slot rotations
    pub optimistic_rounds: u32,
    /// Period of the housekeeping tick (stall expiry)
    pub tick_interval_ms: u64,
    /// Capacity of the link to coordinator event channel
    pub event_queue_len: usize,
    /// Capacity of each link's outbound message queue
    pub outbound_queue_len: usize,
    /// Requests of one peer being read from storage or waiting for queue
    /// space; further requests from that peer are dropped
    pub max_upload_requests: usize,
}

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 6881)),
            read_timeout_secs: 180,
            handshake_timeout_secs: 10,
            max_pipeline: 8,
            stall_timeout_secs: 30,
            max_peers: 50,
            max_unchoked: 4,
            rechoke_interval_secs: 10,
            optimistic_rounds: 3,
            tick_interval_ms: 1000,
            event_queue_len: 256,
            outbound_queue_len: 64,
            max_upload_requests: 32,
        }
    }
}

impl TorrentConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("read_timeout_secs", self.read_timeout_secs),
            ("handshake_timeout_secs", self.handshake_timeout_secs),
            ("max_pipeline", self.max_pipeline as u64),
            ("stall_timeout_secs", self.stall_timeout_secs),
            ("max_peers", self.max_peers as u64),
            ("max_unchoked", self.max_unchoked as u64),
            ("rechoke_interval_secs", self.rechoke_interval_secs),
            ("optimistic_rounds", u64::from(self.optimistic_rounds)),
            ("tick_interval_ms", self.tick_interval_ms),
            ("event_queue_len", self.event_queue_len as u64),
            ("outbound_queue_len", self.outbound_queue_len as u64),
            ("max_upload_requests", self.max_upload_requests as u64),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(TorrentError::config_error_with_field("must be at least 1", field).into());
            }
        }
        if self.max_unchoked > self.max_peers {
            return Err(TorrentError::config_error_with_field("must not exceed max_peers", "max_unchoked").into());
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn rechoke_interval(&self) -> Duration {
        Duration::from_secs(self.rechoke_interval_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}
