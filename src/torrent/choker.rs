//! Upload slot policy
//!
//! The best uploaders to us get the regular slots; one optimistic slot
//! rotates over everybody else who is interested.

use tokio::time::Instant;
use tracing::debug;

use crate::peer::LinkId;

/// What the choker needs to know about a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChokeCandidate {
    pub link: LinkId,
    /// The peer wants data from us
    pub interested: bool,
    /// Payload bytes the peer has sent us
    pub downloaded: u64,
    pub connected_at: Instant,
}

/// Decides which peers we upload to
#[derive(Debug)]
pub struct Choker {
    max_unchoked: usize,
    optimistic_rounds: u32,
    optimistic: Option<LinkId>,
    rounds: u32,
}

impl Choker {
    pub fn new(max_unchoked: usize, optimistic_rounds: u32) -> Self {
        Self {
            max_unchoked,
            optimistic_rounds: optimistic_rounds.max(1),
            optimistic: None,
            rounds: 0,
        }
    }

    /// The peer holding the optimistic slot
    pub fn optimistic(&self) -> Option<LinkId> {
        self.optimistic
    }

    /// Forget a peer that went away
    pub fn remove(&mut self, link: LinkId) {
        if self.optimistic == Some(link) {
            self.optimistic = None;
        }
    }

    /// Compute the set of peers to unchoke.
    ///
    /// `periodic` marks the timer driven rechoke; only those advance the
    /// optimistic rotation.
    pub fn rechoke(&mut self, candidates: &[ChokeCandidate], periodic: bool) -> Vec<LinkId> {
        let mut interested: Vec<&ChokeCandidate> = candidates.iter().filter(|c| c.interested).collect();
        interested.sort_by(|a, b| {
            b.downloaded
                .cmp(&a.downloaded)
                .then(a.connected_at.cmp(&b.connected_at))
                .then(a.link.cmp(&b.link))
        });

        let regular_slots = self.max_unchoked.saturating_sub(1);
        let mut unchoked: Vec<LinkId> = interested.iter().take(regular_slots).map(|c| c.link).collect();

        let mut rest: Vec<LinkId> = interested.iter().skip(regular_slots).map(|c| c.link).collect();
        rest.sort();

        let mut rotate = false;
        if periodic {
            self.rounds += 1;
            if self.rounds >= self.optimistic_rounds {
                self.rounds = 0;
                rotate = true;
            }
        }

        let keep = self.optimistic.filter(|link| !rotate && rest.contains(link));
        self.optimistic = match keep {
            Some(link) => Some(link),
            None => {
                let next = match self.optimistic {
                    Some(current) => rest.iter().find(|&&l| l > current).or_else(|| rest.first()),
                    None => rest.first(),
                };
                next.copied()
            }
        };
        if self.max_unchoked > 0 {
            if let Some(link) = self.optimistic {
                unchoked.push(link);
            }
        }

        debug!("Rechoke: unchoking {:?} (optimistic {:?})", unchoked, self.optimistic);
        unchoked
    }
}
