//! Per-peer performance accounting.
//!
//! Bookkeepers back the membership policy: they decide which member is the
//! *worst peer* for replacement, and on the subscriber side they track
//! which peer every outstanding request was assigned to, plus the ordered
//! alternates that announced the same item.
//!
//! Bookkeepers are plain data; callers serialize access through the
//! manager's membership mutex.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::inet::SockAddr;
use crate::product::NoteReq;

struct PubEntry {
    served: u64,
    seq: u64,
}

/// Publisher-side bookkeeper: counts how many responses each subscriber
/// peer has been served during the current improvement window.
#[derive(Default)]
pub struct PubBookkeeper {
    peers: HashMap<SockAddr, PubEntry>,
    next_seq: u64,
}

impl PubBookkeeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking a peer.
    pub fn add(&mut self, addr: SockAddr) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.peers.insert(addr, PubEntry { served: 0, seq });
    }

    /// Stops tracking a peer.
    pub fn erase(&mut self, addr: &SockAddr) {
        self.peers.remove(addr);
    }

    pub fn contains(&self, addr: &SockAddr) -> bool {
        self.peers.contains_key(addr)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Records one successfully served response.
    pub fn served(&mut self, addr: &SockAddr) {
        if let Some(entry) = self.peers.get_mut(addr) {
            entry.served += 1;
        }
    }

    /// Zeroes every counter. Called at the start of each improvement
    /// window.
    pub fn reset_counts(&mut self) {
        for entry in self.peers.values_mut() {
            entry.served = 0;
        }
    }

    /// The peer with the lowest response count; ties go to the peer that
    /// was inserted first.
    pub fn worst_peer(&self) -> Option<SockAddr> {
        self.peers
            .iter()
            .min_by_key(|(_, entry)| (entry.served, entry.seq))
            .map(|(addr, _)| addr.clone())
    }
}

struct SubEntry {
    requested: HashSet<NoteReq>,
    received: u64,
    has_path: bool,
    seq: u64,
}

/// Subscriber-side bookkeeper.
///
/// Tracks, per peer, the outstanding requests assigned to it and how many
/// responses it has delivered; per item, the arrival-ordered list of peers
/// that announced it. At most one peer holds any item as outstanding.
#[derive(Default)]
pub struct SubBookkeeper {
    peers: HashMap<SockAddr, SubEntry>,
    announced: HashMap<NoteReq, VecDeque<SockAddr>>,
    assigned: HashMap<NoteReq, SockAddr>,
    next_seq: u64,
}

impl SubBookkeeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts tracking a peer with its path-to-publisher flag.
    pub fn add(&mut self, addr: SockAddr, has_path: bool) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.peers.insert(
            addr,
            SubEntry {
                requested: HashSet::new(),
                received: 0,
                has_path,
                seq,
            },
        );
    }

    pub fn contains(&self, addr: &SockAddr) -> bool {
        self.peers.contains_key(addr)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Updates a peer's path-to-publisher flag.
    pub fn set_path(&mut self, addr: &SockAddr, has_path: bool) {
        if let Some(entry) = self.peers.get_mut(addr) {
            entry.has_path = has_path;
        }
    }

    /// Counts of members with and without a path to the publisher.
    pub fn path_counts(&self) -> (usize, usize) {
        let with_path = self.peers.values().filter(|e| e.has_path).count();
        (with_path, self.peers.len() - with_path)
    }

    /// Whether `addr` should request the announced item.
    ///
    /// True iff no peer currently holds the item as outstanding. The
    /// announcement is recorded either way so the peer remains an
    /// alternate; a repeated announcement from the same peer is a no-op
    /// returning false.
    pub fn should_request(&mut self, addr: &SockAddr, item: NoteReq) -> bool {
        if !self.peers.contains_key(addr) {
            return false;
        }

        let announcers = self.announced.entry(item).or_default();
        if announcers.contains(addr) {
            return false;
        }
        announcers.push_back(addr.clone());

        !self.assigned.contains_key(&item)
    }

    /// Records that the item was requested from `addr`.
    pub fn requested(&mut self, addr: &SockAddr, item: NoteReq) {
        if let Some(entry) = self.peers.get_mut(addr) {
            entry.requested.insert(item);
            self.assigned.insert(item, addr.clone());
        }
    }

    /// Handles a delivered item. True only if the item was outstanding
    /// from exactly this peer; the assignment is cleared and the peer's
    /// response count bumped.
    pub fn received(&mut self, addr: &SockAddr, item: NoteReq) -> bool {
        if self.assigned.get(&item) != Some(addr) {
            return false;
        }

        self.assigned.remove(&item);
        self.announced.remove(&item);
        if let Some(entry) = self.peers.get_mut(addr) {
            entry.requested.remove(&item);
            entry.received += 1;
        }
        true
    }

    /// The outstanding requests currently assigned to a peer.
    pub fn requested_of(&self, addr: &SockAddr) -> Vec<NoteReq> {
        self.peers
            .get(addr)
            .map(|entry| entry.requested.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Pops the best alternate for an item: the earliest announcer that is
    /// still a member.
    pub fn pop_best_alt(&mut self, item: NoteReq) -> Option<SockAddr> {
        let announcers = self.announced.get_mut(&item)?;
        while let Some(addr) = announcers.pop_front() {
            if self.peers.contains_key(&addr) {
                return Some(addr);
            }
        }
        None
    }

    /// Purges every trace of a peer. Callers wanting to reassign its
    /// outstanding requests must collect [`requested_of`] first.
    ///
    /// [`requested_of`]: SubBookkeeper::requested_of
    pub fn erase(&mut self, addr: &SockAddr) {
        self.peers.remove(addr);
        for announcers in self.announced.values_mut() {
            announcers.retain(|a| a != addr);
        }
        self.assigned.retain(|_, assignee| assignee != addr);
        self.announced.retain(|_, announcers| !announcers.is_empty());
    }

    /// Zeroes every response counter.
    pub fn reset_counts(&mut self) {
        for entry in self.peers.values_mut() {
            entry.received = 0;
        }
    }

    /// The member with the lowest response count; ties go to the peer
    /// inserted first.
    pub fn worst_peer(&self) -> Option<SockAddr> {
        self.peers
            .iter()
            .min_by_key(|(_, entry)| (entry.received, entry.seq))
            .map(|(addr, _)| addr.clone())
    }

    /// The worst member among those whose path flag matches `has_path`.
    /// Used when replacing a peer so the path balance is preserved.
    pub fn worst_peer_with_path(&self, has_path: bool) -> Option<SockAddr> {
        self.peers
            .iter()
            .filter(|(_, entry)| entry.has_path == has_path)
            .min_by_key(|(_, entry)| (entry.received, entry.seq))
            .map(|(addr, _)| addr.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::product::{DataSegId, ProdIndex};

    fn addr(host: u8) -> SockAddr {
        SockAddr::parse(&format!("10.0.0.{}:38800", host)).unwrap()
    }

    fn item(index: u32) -> NoteReq {
        NoteReq::Prod(ProdIndex::new(index).unwrap())
    }

    #[test]
    fn test_pub_worst_peer_lowest_count() {
        let mut bk = PubBookkeeper::new();
        bk.add(addr(1));
        bk.add(addr(2));

        bk.served(&addr(1));
        bk.served(&addr(1));
        bk.served(&addr(2));

        assert_eq!(bk.worst_peer(), Some(addr(2)));

        bk.reset_counts();
        // Tie: the earliest insertion wins.
        assert_eq!(bk.worst_peer(), Some(addr(1)));
    }

    #[test]
    fn test_should_request_single_assignment() {
        let mut bk = SubBookkeeper::new();
        bk.add(addr(1), false);
        bk.add(addr(2), false);

        assert!(bk.should_request(&addr(1), item(5)));
        bk.requested(&addr(1), item(5));

        // A second announcer becomes an alternate, not an assignee.
        assert!(!bk.should_request(&addr(2), item(5)));

        // Idempotent per (peer, item).
        assert!(!bk.should_request(&addr(1), item(5)));
    }

    #[test]
    fn test_received_only_from_assignee() {
        let mut bk = SubBookkeeper::new();
        bk.add(addr(1), false);
        bk.add(addr(2), false);

        assert!(bk.should_request(&addr(1), item(5)));
        bk.requested(&addr(1), item(5));

        assert!(!bk.received(&addr(2), item(5)));
        assert!(bk.received(&addr(1), item(5)));
        // Cleared after delivery.
        assert!(!bk.received(&addr(1), item(5)));
        assert!(bk.requested_of(&addr(1)).is_empty());
    }

    #[test]
    fn test_reassignment_follows_announcement_order() {
        let mut bk = SubBookkeeper::new();
        bk.add(addr(1), false);
        bk.add(addr(2), false);
        bk.add(addr(3), false);

        let seg = NoteReq::Seg(DataSegId::new(ProdIndex::new(5).unwrap(), 0));
        assert!(bk.should_request(&addr(1), seg));
        bk.requested(&addr(1), seg);
        assert!(!bk.should_request(&addr(2), seg));
        assert!(!bk.should_request(&addr(3), seg));

        // The assignee dies; its outstanding requests move to the next
        // announcer in arrival order.
        let outstanding = bk.requested_of(&addr(1));
        assert_eq!(outstanding, vec![seg]);
        bk.erase(&addr(1));

        assert_eq!(bk.pop_best_alt(seg), Some(addr(2)));
        bk.requested(&addr(2), seg);
        assert!(bk.received(&addr(2), seg));
    }

    #[test]
    fn test_pop_best_alt_skips_dead_members() {
        let mut bk = SubBookkeeper::new();
        bk.add(addr(1), false);
        bk.add(addr(2), false);
        bk.add(addr(3), false);

        assert!(bk.should_request(&addr(1), item(9)));
        bk.requested(&addr(1), item(9));
        assert!(!bk.should_request(&addr(2), item(9)));
        assert!(!bk.should_request(&addr(3), item(9)));

        bk.erase(&addr(1));
        bk.erase(&addr(2));
        assert_eq!(bk.pop_best_alt(item(9)), Some(addr(3)));
        assert_eq!(bk.pop_best_alt(item(9)), None);
    }

    #[test]
    fn test_path_counts_track_flag_updates() {
        let mut bk = SubBookkeeper::new();
        bk.add(addr(1), true);
        bk.add(addr(2), false);
        bk.add(addr(3), false);

        assert_eq!(bk.path_counts(), (1, 2));

        bk.set_path(&addr(2), true);
        assert_eq!(bk.path_counts(), (2, 1));

        bk.erase(&addr(1));
        assert_eq!(bk.path_counts(), (1, 1));
    }

    #[test]
    fn test_worst_peer_with_path_restriction() {
        let mut bk = SubBookkeeper::new();
        bk.add(addr(1), true);
        bk.add(addr(2), false);
        bk.add(addr(3), false);

        // addr(2) delivered more than addr(3).
        bk.requested(&addr(2), item(1));
        assert!(bk.received(&addr(2), item(1)));

        assert_eq!(bk.worst_peer_with_path(false), Some(addr(3)));
        assert_eq!(bk.worst_peer_with_path(true), Some(addr(1)));
        assert_eq!(bk.worst_peer(), Some(addr(1)));
    }
}
