//! Container of active peers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::error::P2pError;
use crate::inet::SockAddr;
use crate::peer::{Peer, PeerManager};
use crate::product::{DataSegId, ProdIndex};

/// The set of active peers, keyed by remote socket address.
///
/// Broadcasts snapshot the membership under a read-mostly lock and enqueue
/// on each peer after the lock is released; a slow peer never stalls the
/// others because every peer owns its own outbound queue.
#[derive(Default)]
pub struct PeerSet {
    peers: RwLock<HashMap<SockAddr, Peer>>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a peer and starts its workers.
    ///
    /// Rejects a duplicate remote address without touching the existing
    /// member.
    pub fn activate(&self, peer: Peer, mgr: Arc<dyn PeerManager>) -> Result<(), P2pError> {
        let mut peers = self.peers.write();
        if peers.contains_key(peer.rmt_addr()) {
            return Err(P2pError::PeerExists(peer.rmt_addr().clone()));
        }

        peer.start(mgr)?;
        peers.insert(peer.rmt_addr().clone(), peer);
        Ok(())
    }

    /// Removes a peer from the set.
    pub fn remove(&self, addr: &SockAddr) -> Option<Peer> {
        self.peers.write().remove(addr)
    }

    /// Looks up a member by remote address.
    pub fn get(&self, addr: &SockAddr) -> Option<Peer> {
        self.peers.read().get(addr).cloned()
    }

    /// Number of active peers.
    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    fn snapshot(&self, exclude: Option<&SockAddr>) -> Vec<Peer> {
        self.peers
            .read()
            .values()
            .filter(|peer| Some(peer.rmt_addr()) != exclude)
            .cloned()
            .collect()
    }

    /// Announces available product information to every peer except the
    /// one it came from.
    pub fn notify_prod_info(&self, index: ProdIndex, exclude: Option<&SockAddr>) {
        for peer in self.snapshot(exclude) {
            let _ = peer.notify_prod_info(index);
        }
    }

    /// Announces an available data segment to every peer except the one it
    /// came from.
    pub fn notify_data_seg(&self, id: DataSegId, exclude: Option<&SockAddr>) {
        for peer in self.snapshot(exclude) {
            let _ = peer.notify_data_seg(id);
        }
    }

    /// Tells every peer that the local node now has a path to the
    /// publisher. `exclude` is the peer whose announcement caused the
    /// transition.
    pub fn got_path(&self, exclude: Option<&SockAddr>) {
        debug!("gained a path to the publisher");
        for peer in self.snapshot(exclude) {
            let _ = peer.notify_pub_path(true);
        }
    }

    /// Tells every peer that the local node no longer has a path to the
    /// publisher.
    pub fn lost_path(&self, exclude: Option<&SockAddr>) {
        debug!("lost the path to the publisher");
        for peer in self.snapshot(exclude) {
            let _ = peer.notify_pub_path(false);
        }
    }

    /// Halts every member.
    pub fn halt(&self) {
        for peer in self.snapshot(None) {
            peer.halt();
        }
    }
}
