//! Request scheduling
//!
//! Decides which blocks to request from which link: rarest piece first,
//! a bounded pipeline per link, one live request per block.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::peer::LinkId;
use crate::protocol::Bitfield;
use crate::storage::piece::{BlockInfo, PieceTracker};

/// A block request in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRequest {
    /// Requested block
    pub block: BlockInfo,
    /// Link the request was sent on
    pub link: LinkId,
    /// When it was sent
    pub issued_at: Instant,
}

/// Block request scheduler for one torrent
#[derive(Debug)]
pub struct RequestScheduler {
    /// How many known peers hold each piece
    availability: Vec<u32>,
    /// Requests in flight, keyed by block
    pending: HashMap<BlockInfo, PendingRequest>,
    /// Requests in flight per link
    per_link: HashMap<LinkId, usize>,
    /// Link whose request for a block expired, and when
    stalled: HashMap<BlockInfo, (LinkId, Instant)>,
    max_pipeline: usize,
    stall_timeout: Duration,
}

impl RequestScheduler {
    /// Create a scheduler
    pub fn new(piece_count: u32, max_pipeline: usize, stall_timeout: Duration) -> Self {
        Self {
            availability: vec![0; piece_count as usize],
            pending: HashMap::new(),
            per_link: HashMap::new(),
            stalled: HashMap::new(),
            max_pipeline,
            stall_timeout,
        }
    }

    /// A peer announced piece `index`
    pub fn peer_has(&mut self, index: u32) {
        if let Some(count) = self.availability.get_mut(index as usize) {
            *count += 1;
        }
    }

    /// A peer holding `bitfield` went away
    pub fn peer_lost(&mut self, bitfield: &Bitfield) {
        for index in bitfield.iter_set() {
            if let Some(count) = self.availability.get_mut(index as usize) {
                *count = count.saturating_sub(1);
            }
        }
    }

    /// Number of known peers holding piece `index`
    pub fn availability(&self, index: u32) -> u32 {
        self.availability.get(index as usize).copied().unwrap_or(0)
    }

    /// Requests in flight on `link`
    pub fn pending_for(&self, link: LinkId) -> usize {
        self.per_link.get(&link).copied().unwrap_or(0)
    }

    /// Total requests in flight
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Link currently owning a request for `block`
    pub fn owner(&self, block: &BlockInfo) -> Option<LinkId> {
        self.pending.get(block).map(|p| p.link)
    }

    /// Pick blocks to request from `link` and record them as pending.
    ///
    /// The caller only plans for links that are interesting and unchoked.
    /// A block whose request on `link` expired is not offered to `link`
    /// again until one more stall timeout has passed.
    pub fn plan(&mut self, link: LinkId, peer: &Bitfield, tracker: &PieceTracker, now: Instant) -> Vec<BlockInfo> {
        let mut slots = self.max_pipeline.saturating_sub(self.pending_for(link));
        if slots == 0 {
            return Vec::new();
        }

        let mut candidates: Vec<u32> = peer
            .iter_set()
            .filter(|&i| tracker.piece(i).map(|p| p.is_wanted()).unwrap_or(false))
            .collect();
        candidates.sort_by_key(|&i| (self.availability(i), i));

        let mut planned = Vec::new();
        'pieces: for index in candidates {
            let Some(piece) = tracker.piece(index) else {
                continue;
            };
            for block in piece.unreceived_blocks() {
                if self.pending.contains_key(&block) || self.stalled_on(&block, link, now) {
                    continue;
                }
                self.stalled.remove(&block);
                self.pending.insert(block, PendingRequest { block, link, issued_at: now });
                planned.push(block);
                slots -= 1;
                if slots == 0 {
                    break 'pieces;
                }
            }
        }

        if !planned.is_empty() {
            *self.per_link.entry(link).or_insert(0) += planned.len();
            trace!("Planned {} requests for link {}", planned.len(), link);
        }
        planned
    }

    /// Clear the pending request for `block` if `link` owns it.
    ///
    /// Returns false for blocks we did not ask this link for.
    pub fn take(&mut self, link: LinkId, block: &BlockInfo) -> bool {
        match self.pending.get(block) {
            Some(p) if p.link == link => {
                self.pending.remove(block);
                self.stalled.remove(block);
                self.decrement(link, 1);
                true
            }
            _ => false,
        }
    }

    /// Remove and return requests older than the stall timeout
    pub fn expire(&mut self, now: Instant) -> Vec<PendingRequest> {
        let timeout = self.stall_timeout;
        self.stalled.retain(|_, (_, since)| now.saturating_duration_since(*since) < timeout);
        let expired: Vec<PendingRequest> = self
            .pending
            .values()
            .filter(|p| now.saturating_duration_since(p.issued_at) >= timeout)
            .copied()
            .collect();
        for request in &expired {
            self.pending.remove(&request.block);
            self.stalled.insert(request.block, (request.link, now));
            self.decrement(request.link, 1);
        }
        if !expired.is_empty() {
            debug!("Expired {} stalled requests", expired.len());
        }
        expired
    }

    /// Drop every request owned by `link`, returning the released blocks
    pub fn release_link(&mut self, link: LinkId) -> Vec<BlockInfo> {
        let released: Vec<BlockInfo> = self
            .pending
            .values()
            .filter(|p| p.link == link)
            .map(|p| p.block)
            .collect();
        for block in &released {
            self.pending.remove(block);
        }
        self.per_link.remove(&link);
        self.stalled.retain(|_, (owner, _)| *owner != link);
        released
    }

    fn stalled_on(&self, block: &BlockInfo, link: LinkId, now: Instant) -> bool {
        match self.stalled.get(block) {
            Some(&(owner, since)) => owner == link && now.saturating_duration_since(since) < self.stall_timeout,
            None => false,
        }
    }

    fn decrement(&mut self, link: LinkId, by: usize) {
        if let Some(count) = self.per_link.get_mut(&link) {
            *count = count.saturating_sub(by);
            if *count == 0 {
                self.per_link.remove(&link);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::BLOCK_LEN;
    use crate::storage::piece::BlockOutcome;
    use crate::torrent::TorrentInfo;

    const PIECE: u32 = 2 * BLOCK_LEN;

    fn setup(pieces: u32) -> (PieceTracker, RequestScheduler) {
        let info = TorrentInfo::new("t", PIECE, u64::from(PIECE) * u64::from(pieces), vec![[0u8; 20]; pieces as usize]).unwrap();
        let tracker = PieceTracker::new(&info, Bitfield::new(pieces)).unwrap();
        let scheduler = RequestScheduler::new(pieces, 4, Duration::from_secs(30));
        (tracker, scheduler)
    }

    fn bitfield(len: u32, set: &[u32]) -> Bitfield {
        let mut bf = Bitfield::new(len);
        for &i in set {
            bf.set(i).unwrap();
        }
        bf
    }

    #[test]
    fn test_rarest_first_then_lowest_index() {
        let (tracker, mut scheduler) = setup(4);
        // piece 0 and 3 are held by two peers, pieces 1 and 2 by one
        for i in [0, 0, 1, 2, 3, 3] {
            scheduler.peer_has(i);
        }
        let peer = bitfield(4, &[0, 1, 2, 3]);
        let planned = scheduler.plan(LinkId(1), &peer, &tracker, Instant::now());
        let pieces: Vec<u32> = planned.iter().map(|b| b.piece_index).collect();
        assert_eq!(pieces, vec![1, 1, 2, 2]);
        assert_eq!(planned[0].offset, 0);
        assert_eq!(planned[1].offset, BLOCK_LEN);
    }

    #[test]
    fn test_pipeline_limit() {
        let (tracker, mut scheduler) = setup(4);
        let peer = bitfield(4, &[0, 1, 2, 3]);
        let now = Instant::now();
        assert_eq!(scheduler.plan(LinkId(1), &peer, &tracker, now).len(), 4);
        assert!(scheduler.plan(LinkId(1), &peer, &tracker, now).is_empty());
        assert_eq!(scheduler.pending_for(LinkId(1)), 4);

        let first = BlockInfo::new(0, 0, BLOCK_LEN);
        assert!(scheduler.take(LinkId(1), &first));
        assert_eq!(scheduler.plan(LinkId(1), &peer, &tracker, now).len(), 1);
    }

    #[test]
    fn test_no_duplicate_requests_across_links() {
        let (tracker, mut scheduler) = setup(2);
        let peer = bitfield(2, &[0, 1]);
        let now = Instant::now();
        let a = scheduler.plan(LinkId(1), &peer, &tracker, now);
        let b = scheduler.plan(LinkId(2), &peer, &tracker, now);
        assert_eq!(a.len(), 4);
        assert!(b.is_empty());
    }

    #[test]
    fn test_skips_pieces_the_peer_lacks() {
        let (tracker, mut scheduler) = setup(3);
        let peer = bitfield(3, &[2]);
        let planned = scheduler.plan(LinkId(1), &peer, &tracker, Instant::now());
        assert!(planned.iter().all(|b| b.piece_index == 2));
        assert_eq!(planned.len(), 2);
    }

    #[test]
    fn test_skips_received_blocks() {
        let (mut tracker, mut scheduler) = setup(1);
        let first = BlockInfo::new(0, 0, BLOCK_LEN);
        let outcome = tracker.receive_block(LinkId(9), first, &[0u8; BLOCK_LEN as usize]).unwrap();
        assert_eq!(outcome, BlockOutcome::Stored);

        let planned = scheduler.plan(LinkId(1), &bitfield(1, &[0]), &tracker, Instant::now());
        assert_eq!(planned, vec![BlockInfo::new(0, BLOCK_LEN, BLOCK_LEN)]);
    }

    #[test]
    fn test_take_rejects_unsolicited() {
        let (tracker, mut scheduler) = setup(1);
        let planned = scheduler.plan(LinkId(1), &bitfield(1, &[0]), &tracker, Instant::now());
        assert!(!scheduler.take(LinkId(2), &planned[0]));
        assert!(!scheduler.take(LinkId(1), &BlockInfo::new(0, 0, 10)));
        assert!(scheduler.take(LinkId(1), &planned[0]));
        assert!(!scheduler.take(LinkId(1), &planned[0]));
    }

    #[test]
    fn test_expired_request_moves_to_another_link() {
        let (tracker, mut scheduler) = setup(1);
        let peer = bitfield(1, &[0]);
        let start = Instant::now();
        let p = LinkId(1);
        let q = LinkId(2);

        let planned = scheduler.plan(p, &peer, &tracker, start);
        assert_eq!(planned.len(), 2);
        assert!(scheduler.plan(q, &peer, &tracker, start).is_empty());

        assert!(scheduler.expire(start + Duration::from_secs(29)).is_empty());
        let expired = scheduler.expire(start + Duration::from_secs(30));
        assert_eq!(expired.len(), 2);
        assert!(expired.iter().all(|r| r.link == p));
        assert_eq!(scheduler.pending_for(p), 0);

        let reassigned = scheduler.plan(q, &peer, &tracker, start + Duration::from_secs(30));
        assert_eq!(reassigned.len(), 2);
        assert_eq!(scheduler.owner(&planned[0]), Some(q));
    }

    #[test]
    fn test_stalled_link_planned_first_leaves_block_to_others() {
        let (tracker, mut scheduler) = setup(1);
        let peer = bitfield(1, &[0]);
        let start = Instant::now();
        let later = start + Duration::from_secs(30);
        let p = LinkId(1);
        let q = LinkId(2);

        assert_eq!(scheduler.plan(p, &peer, &tracker, start).len(), 2);
        assert_eq!(scheduler.expire(later).len(), 2);

        assert!(scheduler.plan(p, &peer, &tracker, later).is_empty());
        let reassigned = scheduler.plan(q, &peer, &tracker, later);
        assert_eq!(reassigned.len(), 2);
        assert!(reassigned.iter().all(|b| scheduler.owner(b) == Some(q)));
    }

    #[test]
    fn test_stalled_link_retries_after_another_timeout() {
        let (tracker, mut scheduler) = setup(1);
        let peer = bitfield(1, &[0]);
        let start = Instant::now();
        let p = LinkId(1);

        scheduler.plan(p, &peer, &tracker, start);
        scheduler.expire(start + Duration::from_secs(30));
        assert!(scheduler.plan(p, &peer, &tracker, start + Duration::from_secs(45)).is_empty());
        assert_eq!(scheduler.plan(p, &peer, &tracker, start + Duration::from_secs(60)).len(), 2);
    }

    #[test]
    fn test_release_link() {
        let (tracker, mut scheduler) = setup(2);
        let peer = bitfield(2, &[0, 1]);
        let now = Instant::now();
        scheduler.plan(LinkId(1), &peer, &tracker, now);
        let released = scheduler.release_link(LinkId(1));
        assert_eq!(released.len(), 4);
        assert_eq!(scheduler.pending_count(), 0);
        assert_eq!(scheduler.plan(LinkId(2), &peer, &tracker, now).len(), 4);
    }

    #[test]
    fn test_availability_tracking() {
        let (_, mut scheduler) = setup(3);
        scheduler.peer_has(0);
        scheduler.peer_has(2);
        scheduler.peer_has(2);
        scheduler.peer_has(7);
        assert_eq!(scheduler.availability(2), 2);
        scheduler.peer_lost(&bitfield(3, &[0, 2]));
        assert_eq!(scheduler.availability(0), 0);
        assert_eq!(scheduler.availability(2), 1);
        scheduler.peer_lost(&bitfield(3, &[0]));
        assert_eq!(scheduler.availability(0), 0);
    }
}
