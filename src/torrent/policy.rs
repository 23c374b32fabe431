//! What to do with peers that sent corrupt data

use std::collections::HashMap;

use tracing::warn;

use crate::peer::LinkId;

/// Consulted on every piece that fails its hash check
pub trait CorruptionPolicy: Send {
    /// `contributors` supplied blocks of the failed `piece`. Returns the
    /// links to disconnect.
    fn on_hash_failure(&mut self, piece: u32, contributors: &[LinkId]) -> Vec<LinkId>;

    /// Forget a link that went away
    fn forget(&mut self, _link: LinkId) {}
}

/// Keeps every peer connected; the piece is simply fetched again
#[derive(Debug, Default, Clone, Copy)]
pub struct TolerateCorruption;

impl CorruptionPolicy for TolerateCorruption {
    fn on_hash_failure(&mut self, _piece: u32, _contributors: &[LinkId]) -> Vec<LinkId> {
        Vec::new()
    }
}

/// Disconnects a link once it took part in `limit` failed pieces
#[derive(Debug, Clone)]
pub struct StrikeLimit {
    limit: u32,
    strikes: HashMap<LinkId, u32>,
}

impl StrikeLimit {
    pub fn new(limit: u32) -> Self {
        Self {
            limit: limit.max(1),
            strikes: HashMap::new(),
        }
    }

    /// Failed pieces `link` contributed to so far
    pub fn strikes(&self, link: LinkId) -> u32 {
        self.strikes.get(&link).copied().unwrap_or(0)
    }
}

impl CorruptionPolicy for StrikeLimit {
    fn on_hash_failure(&mut self, piece: u32, contributors: &[LinkId]) -> Vec<LinkId> {
        let mut banned = Vec::new();
        for &link in contributors {
            let count = self.strikes.entry(link).or_insert(0);
            *count += 1;
            if *count >= self.limit {
                warn!("Link {} reached {} strikes (last piece {})", link, count, piece);
                banned.push(link);
            }
        }
        banned
    }

    fn forget(&mut self, link: LinkId) {
        self.strikes.remove(&link);
    }
}
