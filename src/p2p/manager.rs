//! Top-level controllers of the P2P overlay.
//!
//! A manager owns the peer server socket, the membership state, and the
//! long-running tasks that feed the peer set: the acceptor, the improver,
//! and (subscriber only) the connector. Total task count is bounded by
//! two workers per peer plus the manager's own three tasks.
//!
//! Membership invariant: a peer is present in the peer set, the
//! bookkeeper, and the address index together or in none of them; all
//! three are updated inside one critical section of the membership mutex,
//! and no lock is held across a network call.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr as StdSockAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::{watch, Notify};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::bookkeeper::{PubBookkeeper, SubBookkeeper};
use super::error::P2pError;
use super::peer_set::PeerSet;
use super::server_pool::ServerPool;
use crate::config::P2pConfig;
use crate::inet::SockAddr;
use crate::peer::{Peer, PeerError, PeerManager};
use crate::product::{DataSeg, DataSegId, NoteReq, ProdIndex, ProdInfo};
use crate::repository::Repository;

async fn bind_listener(cfg: &P2pConfig) -> Result<TcpListener, P2pError> {
    let addr = cfg.listen_addr.resolve().await?;
    let socket = match addr {
        StdSockAddr::V4(_) => TcpSocket::new_v4()?,
        StdSockAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(u32::from(cfg.listen_backlog))?)
}

// State common to both manager variants.
struct MgrShared {
    cfg: P2pConfig,
    peer_set: PeerSet,
    done_tx: watch::Sender<bool>,
    running: AtomicBool,
    task_err: Mutex<Option<P2pError>>,
    // Signaled when a membership slot frees up.
    capacity: Notify,
    listener: Mutex<Option<TcpListener>>,
    local_addr: StdSockAddr,
}

impl MgrShared {
    async fn new(cfg: P2pConfig) -> Result<Self, P2pError> {
        cfg.validate()?;
        let listener = bind_listener(&cfg).await?;
        let local_addr = listener.local_addr().map_err(P2pError::Io)?;
        let (done_tx, _) = watch::channel(false);
        Ok(Self {
            cfg,
            peer_set: PeerSet::new(),
            done_tx,
            running: AtomicBool::new(false),
            task_err: Mutex::new(None),
            capacity: Notify::new(),
            listener: Mutex::new(Some(listener)),
            local_addr,
        })
    }

    fn halt(&self) {
        // send_replace so the flag sticks even before any task subscribes
        self.done_tx.send_replace(true);
    }

    fn is_done(&self) -> bool {
        *self.done_tx.borrow()
    }

    async fn wait_done(&self) {
        let mut done_rx = self.done_tx.subscribe();
        while !*done_rx.borrow_and_update() {
            if done_rx.changed().await.is_err() {
                return;
            }
        }
    }

    // Captures the first fatal task error and triggers shutdown.
    fn set_exception(&self, err: P2pError) {
        {
            let mut cell = self.task_err.lock();
            if cell.is_none() {
                error!(%err, "fatal task error, shutting down");
                *cell = Some(err);
            }
        }
        self.halt();
    }

    fn take_exception(&self) -> Option<P2pError> {
        self.task_err.lock().take()
    }

    fn enter_run(&self) -> Result<TcpListener, P2pError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(P2pError::AlreadyRunning);
        }
        if self.is_done() {
            return Err(P2pError::Halted);
        }
        self.listener.lock().take().ok_or(P2pError::AlreadyRunning)
    }
}

// Periodically gives the membership a chance to replace its worst peer.
async fn run_improver(mut done_rx: watch::Receiver<bool>, period: Duration, tick: impl Fn()) {
    loop {
        tokio::select! {
            _ = done_rx.changed() => return,
            _ = sleep(period) => tick(),
        }
    }
}

/// Spawns a peer's orphaned requests at their new assignees.
fn spawn_reassignments(reassigned: Vec<(Peer, NoteReq)>) {
    for (peer, item) in reassigned {
        tokio::spawn(async move {
            let result = match item {
                NoteReq::Prod(index) => peer.request_prod_info(index).await,
                NoteReq::Seg(id) => peer.request_data_seg(id).await,
            };
            if let Err(err) = result {
                debug!(peer = %peer, %item, %err, "reassigned request failed");
            }
        });
    }
}

// ===========================================================================
// Publisher
// ===========================================================================

struct PubMembership {
    bookkeeper: PubBookkeeper,
    index: HashMap<SockAddr, Peer>,
}

struct PubState {
    shared: MgrShared,
    repo: Arc<dyn Repository>,
    membership: Mutex<PubMembership>,
}

/// P2P manager of the publishing node.
///
/// Accepts inbound peers until the peer set is full; once saturated, the
/// improver halts the worst-performing peer each period to open capacity
/// for a better candidate, bounding churn to one replacement per period.
pub struct PublisherManager {
    inner: Arc<PubState>,
}

impl PublisherManager {
    /// Creates the manager and binds its peer server socket.
    pub async fn new(cfg: P2pConfig, repo: Arc<dyn Repository>) -> Result<Self, P2pError> {
        let shared = MgrShared::new(cfg).await?;
        Ok(Self {
            inner: Arc::new(PubState {
                shared,
                repo,
                membership: Mutex::new(PubMembership {
                    bookkeeper: PubBookkeeper::new(),
                    index: HashMap::new(),
                }),
            }),
        })
    }

    /// The bound address of the peer server socket.
    pub fn local_addr(&self) -> StdSockAddr {
        self.inner.shared.local_addr
    }

    /// Number of active peers.
    pub fn size(&self) -> usize {
        self.inner.shared.peer_set.len()
    }

    /// Announces available product information to every peer.
    pub fn notify_prod_info(&self, index: ProdIndex) {
        self.inner.shared.peer_set.notify_prod_info(index, None);
    }

    /// Announces an available data segment to every peer.
    pub fn notify_data_seg(&self, id: DataSegId) {
        self.inner.shared.peer_set.notify_data_seg(id, None);
    }

    /// Executes the manager until [`halt`](PublisherManager::halt) or a
    /// fatal error. Single entry: a second call fails, as does running a
    /// manager that was already halted.
    pub async fn run(&self) -> Result<(), P2pError> {
        let listener = self.inner.shared.enter_run()?;

        let acceptor = tokio::spawn(pub_acceptor(self.inner.clone(), listener));
        let state = self.inner.clone();
        let improver = tokio::spawn(run_improver(
            self.inner.shared.done_tx.subscribe(),
            self.inner.shared.cfg.improvement_period,
            move || state.improve_once(),
        ));

        self.inner.shared.wait_done().await;

        self.inner.shared.peer_set.halt();
        let _ = acceptor.await;
        let _ = improver.await;

        match self.inner.shared.take_exception() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Halts execution. Idempotent and safe from any task.
    pub fn halt(&self) {
        self.inner.shared.halt();
    }
}

impl PubState {
    fn try_add(self: &Arc<Self>, peer: Peer) -> bool {
        let mut m = self.membership.lock();
        if m.index.len() >= usize::from(self.shared.cfg.max_peers) {
            info!(peer = %peer, "rejected: peer set is full");
            return false;
        }

        let addr = peer.rmt_addr().clone();
        m.bookkeeper.add(addr.clone());
        m.index.insert(addr.clone(), peer.clone());
        let mgr: Arc<dyn PeerManager> = self.clone();
        match self.shared.peer_set.activate(peer.clone(), mgr) {
            Ok(()) => {
                info!(peer = %peer, "peer added");
                true
            }
            Err(err) => {
                warn!(peer = %peer, %err, "couldn't activate peer");
                m.bookkeeper.erase(&addr);
                m.index.remove(&addr);
                false
            }
        }
    }

    fn improve_once(&self) {
        let worst = {
            let m = self.membership.lock();
            if m.index.len() >= usize::from(self.shared.cfg.max_peers) {
                m.bookkeeper
                    .worst_peer()
                    .and_then(|addr| m.index.get(&addr).cloned())
            } else {
                None
            }
        };

        if let Some(peer) = worst {
            info!(peer = %peer, "halting worst peer to open capacity");
            peer.halt();
        }
        self.membership.lock().bookkeeper.reset_counts();
    }
}

impl PeerManager for PubState {
    fn recv_pub_path(&self, has_path: bool, peer: &Peer) {
        debug!(peer = %peer, has_path, "subscriber path status");
    }

    fn recv_prod_notice(&self, _index: ProdIndex, _peer: &Peer) -> bool {
        false // The publisher already has everything
    }

    fn recv_seg_notice(&self, _id: DataSegId, _peer: &Peer) -> bool {
        false
    }

    fn recv_prod_request(&self, index: ProdIndex, peer: &Peer) -> Option<ProdInfo> {
        let info = self.repo.get_prod_info(index);
        match info {
            Some(_) => self.membership.lock().bookkeeper.served(peer.rmt_addr()),
            None => debug!(peer = %peer, %index, "no such product"),
        }
        info
    }

    fn recv_seg_request(&self, id: DataSegId, peer: &Peer) -> Option<DataSeg> {
        let seg = self.repo.get_data_seg(id);
        match seg {
            Some(_) => self.membership.lock().bookkeeper.served(peer.rmt_addr()),
            None => debug!(peer = %peer, %id, "no such segment"),
        }
        seg
    }

    fn recv_prod_info(&self, _info: ProdInfo, peer: &Peer) {
        warn!(peer = %peer, "unexpected product info from subscriber");
    }

    fn recv_data_seg(&self, _seg: DataSeg, peer: &Peer) {
        warn!(peer = %peer, "unexpected data segment from subscriber");
    }

    fn stopped(&self, peer: &Peer) {
        let addr = peer.rmt_addr();
        {
            let mut m = self.membership.lock();
            if m.index.remove(addr).is_some() {
                m.bookkeeper.erase(addr);
                self.shared.peer_set.remove(addr);
                info!(peer = %peer, "peer stopped");
            }
        }
        self.shared.capacity.notify_waiters();
    }

    fn fatal(&self, err: PeerError, peer: &Peer) {
        error!(peer = %peer, %err, "peer failed fatally");
        self.shared.set_exception(err.into());
    }
}

async fn pub_acceptor(state: Arc<PubState>, listener: TcpListener) {
    let mut done_rx = state.shared.done_tx.subscribe();

    loop {
        let accepted = tokio::select! {
            _ = done_rx.changed() => return,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, _)) => match Peer::accept(stream, true).await {
                Ok(peer) => {
                    if !state.try_add(peer.clone()) {
                        peer.halt();
                    }
                }
                Err(err) => info!(%err, "inbound handshake failed"),
            },
            Err(err) => {
                if crate::peer::is_transient_io(&err) {
                    warn!(%err, "transient accept failure");
                    continue;
                }
                state.shared.set_exception(P2pError::Io(err));
                return;
            }
        }
    }
}

// ===========================================================================
// Subscriber
// ===========================================================================

struct SubMembership {
    bookkeeper: SubBookkeeper,
    index: HashMap<SockAddr, Peer>,
    // Members this node dialed; their server address is recycled into the
    // pool when they die.
    dialed: HashSet<SockAddr>,
    local_has_path: bool,
}

struct SubState {
    shared: MgrShared,
    repo: Arc<dyn Repository>,
    pool: Arc<ServerPool>,
    membership: Mutex<SubMembership>,
}

/// P2P manager of a subscribing node.
///
/// In addition to the acceptor and improver, runs a connector that dials
/// peer servers from the [`ServerPool`] while the peer set is under
/// capacity. At capacity, an inbound peer is admitted only when it
/// improves the balance between members with and without a path to the
/// publisher; the worst peer of the over-represented group is evicted to
/// make room.
pub struct SubscriberManager {
    inner: Arc<SubState>,
}

impl SubscriberManager {
    /// Creates the manager and binds its peer server socket.
    pub async fn new(
        cfg: P2pConfig,
        repo: Arc<dyn Repository>,
        pool: Arc<ServerPool>,
    ) -> Result<Self, P2pError> {
        let shared = MgrShared::new(cfg).await?;
        Ok(Self {
            inner: Arc::new(SubState {
                shared,
                repo,
                pool,
                membership: Mutex::new(SubMembership {
                    bookkeeper: SubBookkeeper::new(),
                    index: HashMap::new(),
                    dialed: HashSet::new(),
                    local_has_path: false,
                }),
            }),
        })
    }

    /// The bound address of the peer server socket.
    pub fn local_addr(&self) -> StdSockAddr {
        self.inner.shared.local_addr
    }

    /// Number of active peers.
    pub fn size(&self) -> usize {
        self.inner.shared.peer_set.len()
    }

    /// Whether this node currently has a path to the publisher through
    /// any of its peers.
    pub fn has_path_to_pub(&self) -> bool {
        self.inner.membership.lock().local_has_path
    }

    /// Counts of members with and without a path to the publisher.
    pub fn path_counts(&self) -> (usize, usize) {
        self.inner.membership.lock().bookkeeper.path_counts()
    }

    /// Feeds product information received on the multicast channel into
    /// the overlay: stores it and, if newly accepted, notifies peers.
    /// Items already held are suppressed.
    pub fn recv_mcast_prod_info(&self, info: ProdInfo) {
        if self.inner.repo.store_prod_info(info.clone()) {
            self.inner.shared.peer_set.notify_prod_info(info.index(), None);
        }
    }

    /// Feeds a data segment received on the multicast channel into the
    /// overlay.
    pub fn recv_mcast_data_seg(&self, seg: DataSeg) {
        if self.inner.repo.store_data_seg(seg.clone()) {
            self.inner.shared.peer_set.notify_data_seg(seg.id(), None);
        }
    }

    /// Executes the manager until [`halt`](SubscriberManager::halt) or a
    /// fatal error. Single entry: a second call fails, as does running a
    /// manager that was already halted.
    pub async fn run(&self) -> Result<(), P2pError> {
        let listener = self.inner.shared.enter_run()?;

        let acceptor = tokio::spawn(sub_acceptor(self.inner.clone(), listener));
        let connector = tokio::spawn(sub_connector(self.inner.clone()));
        let state = self.inner.clone();
        let improver = tokio::spawn(run_improver(
            self.inner.shared.done_tx.subscribe(),
            self.inner.shared.cfg.improvement_period,
            move || state.improve_once(),
        ));

        self.inner.shared.wait_done().await;

        self.inner.shared.peer_set.halt();
        let _ = acceptor.await;
        let _ = connector.await;
        let _ = improver.await;

        match self.inner.shared.take_exception() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Halts execution. Idempotent and safe from any task.
    pub fn halt(&self) {
        self.inner.shared.halt();
    }
}

impl SubState {
    fn local_has_path(&self) -> bool {
        self.membership.lock().local_has_path
    }

    fn try_add(self: &Arc<Self>, peer: Peer, dialed: bool) -> bool {
        let mut m = self.membership.lock();
        if m.index.len() < usize::from(self.shared.cfg.max_peers) {
            return self.add_locked(&mut m, peer, dialed);
        }

        // Saturated: admit only a peer that improves the path balance, at
        // the cost of the worst member of the over-represented group.
        let rmt_has_path = peer.is_path_to_pub();
        let (num_path, num_no_path) = m.bookkeeper.path_counts();
        let improves = if rmt_has_path {
            num_path < num_no_path
        } else {
            num_no_path < num_path
        };
        if !improves {
            debug!(peer = %peer, "rejected: would not improve path balance");
            return false;
        }

        let Some(worst) = m.bookkeeper.worst_peer_with_path(!rmt_has_path) else {
            debug!(peer = %peer, "rejected: no peer to evict");
            return false;
        };

        let reassigned = self.remove_locked(&mut m, &worst);
        let added = self.add_locked(&mut m, peer, dialed);
        drop(m);
        spawn_reassignments(reassigned);
        added
    }

    fn add_locked(self: &Arc<Self>, m: &mut SubMembership, peer: Peer, dialed: bool) -> bool {
        let addr = peer.rmt_addr().clone();
        let (path_before, _) = m.bookkeeper.path_counts();
        m.bookkeeper.add(addr.clone(), peer.is_path_to_pub());
        m.index.insert(addr.clone(), peer.clone());
        if dialed {
            m.dialed.insert(addr.clone());
        }

        let mgr: Arc<dyn PeerManager> = self.clone();
        match self.shared.peer_set.activate(peer.clone(), mgr) {
            Ok(()) => {
                if path_before == 0 && peer.is_path_to_pub() && !m.local_has_path {
                    m.local_has_path = true;
                    self.shared.peer_set.got_path(Some(&addr));
                }
                info!(peer = %peer, "peer added");
                true
            }
            Err(err) => {
                warn!(peer = %peer, %err, "couldn't activate peer");
                m.bookkeeper.erase(&addr);
                m.index.remove(&addr);
                m.dialed.remove(&addr);
                false
            }
        }
    }

    // Removes a member from all three indexes and computes the
    // reassignment of its outstanding requests. The returned sends must be
    // spawned after the membership lock is released.
    fn remove_locked(&self, m: &mut SubMembership, addr: &SockAddr) -> Vec<(Peer, NoteReq)> {
        let Some(peer) = m.index.remove(addr) else {
            return Vec::new();
        };
        peer.halt();
        self.shared.peer_set.remove(addr);

        let outstanding = m.bookkeeper.requested_of(addr);
        let (path_before, _) = m.bookkeeper.path_counts();
        m.bookkeeper.erase(addr);
        let (path_after, _) = m.bookkeeper.path_counts();

        let mut reassigned = Vec::new();
        for item in outstanding {
            match m.bookkeeper.pop_best_alt(item) {
                Some(alt_addr) => {
                    if let Some(alt) = m.index.get(&alt_addr) {
                        m.bookkeeper.requested(&alt_addr, item);
                        reassigned.push((alt.clone(), item));
                    }
                }
                // Another peer's future notice will re-trigger it.
                None => debug!(%item, "request dropped, no alternate announcer"),
            }
        }

        if m.dialed.remove(addr) {
            self.pool.consider(addr.clone());
        }

        if path_before > 0 && path_after == 0 && m.local_has_path {
            m.local_has_path = false;
            self.shared.peer_set.lost_path(None);
        }

        info!(peer = %peer, "peer removed");
        reassigned
    }

    fn improve_once(&self) {
        let worst = {
            let m = self.membership.lock();
            if m.index.len() >= usize::from(self.shared.cfg.max_peers) {
                m.bookkeeper
                    .worst_peer()
                    .and_then(|addr| m.index.get(&addr).cloned())
            } else {
                None
            }
        };

        if let Some(peer) = worst {
            info!(peer = %peer, "halting worst peer to open capacity");
            peer.halt();
        }
        self.membership.lock().bookkeeper.reset_counts();
    }
}

impl PeerManager for SubState {
    fn recv_pub_path(&self, has_path: bool, peer: &Peer) {
        let addr = peer.rmt_addr();
        let mut m = self.membership.lock();
        if !m.bookkeeper.contains(addr) {
            return;
        }

        let (path_before, _) = m.bookkeeper.path_counts();
        m.bookkeeper.set_path(addr, has_path);
        let (path_after, _) = m.bookkeeper.path_counts();

        if path_before == 0 && path_after > 0 && !m.local_has_path {
            m.local_has_path = true;
            self.shared.peer_set.got_path(Some(addr));
        } else if path_before > 0 && path_after == 0 && m.local_has_path {
            m.local_has_path = false;
            self.shared.peer_set.lost_path(Some(addr));
        }
    }

    fn recv_prod_notice(&self, index: ProdIndex, peer: &Peer) -> bool {
        let item = NoteReq::Prod(index);
        let mut m = self.membership.lock();
        if !m.bookkeeper.should_request(peer.rmt_addr(), item) {
            return false;
        }
        if self.repo.get_prod_info(index).is_some() {
            return false; // Already held
        }
        m.bookkeeper.requested(peer.rmt_addr(), item);
        debug!(peer = %peer, %item, "requesting");
        true
    }

    fn recv_seg_notice(&self, id: DataSegId, peer: &Peer) -> bool {
        let item = NoteReq::Seg(id);
        let mut m = self.membership.lock();
        if !m.bookkeeper.should_request(peer.rmt_addr(), item) {
            return false;
        }
        if self.repo.get_data_seg(id).is_some() {
            return false;
        }
        m.bookkeeper.requested(peer.rmt_addr(), item);
        debug!(peer = %peer, %item, "requesting");
        true
    }

    // Subscribers relay data to each other: requests are served straight
    // from the repository.
    fn recv_prod_request(&self, index: ProdIndex, _peer: &Peer) -> Option<ProdInfo> {
        self.repo.get_prod_info(index)
    }

    fn recv_seg_request(&self, id: DataSegId, _peer: &Peer) -> Option<DataSeg> {
        self.repo.get_data_seg(id)
    }

    fn recv_prod_info(&self, info: ProdInfo, peer: &Peer) {
        let item = NoteReq::Prod(info.index());
        {
            let mut m = self.membership.lock();
            if !m.bookkeeper.received(peer.rmt_addr(), item) {
                debug!(peer = %peer, %item, "ignoring unrequested delivery");
                return;
            }
        }

        if self.repo.store_prod_info(info.clone()) {
            self.shared
                .peer_set
                .notify_prod_info(info.index(), Some(peer.rmt_addr()));
        }
    }

    fn recv_data_seg(&self, seg: DataSeg, peer: &Peer) {
        let item = NoteReq::Seg(seg.id());
        {
            let mut m = self.membership.lock();
            if !m.bookkeeper.received(peer.rmt_addr(), item) {
                debug!(peer = %peer, %item, "ignoring unrequested delivery");
                return;
            }
        }

        if self.repo.store_data_seg(seg.clone()) {
            self.shared
                .peer_set
                .notify_data_seg(seg.id(), Some(peer.rmt_addr()));
        }
    }

    fn stopped(&self, peer: &Peer) {
        let reassigned = {
            let mut m = self.membership.lock();
            self.remove_locked(&mut m, peer.rmt_addr())
        };
        spawn_reassignments(reassigned);
        self.shared.capacity.notify_waiters();
    }

    fn fatal(&self, err: PeerError, peer: &Peer) {
        error!(peer = %peer, %err, "peer failed fatally");
        self.shared.set_exception(err.into());
    }
}

async fn sub_acceptor(state: Arc<SubState>, listener: TcpListener) {
    let mut done_rx = state.shared.done_tx.subscribe();

    loop {
        let accepted = tokio::select! {
            _ = done_rx.changed() => return,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, _)) => match Peer::accept(stream, state.local_has_path()).await {
                Ok(peer) => {
                    if !state.try_add(peer.clone(), false) {
                        peer.halt();
                    }
                }
                Err(err) => info!(%err, "inbound handshake failed"),
            },
            Err(err) => {
                if crate::peer::is_transient_io(&err) {
                    warn!(%err, "transient accept failure");
                    continue;
                }
                state.shared.set_exception(P2pError::Io(err));
                return;
            }
        }
    }
}

// Dials peer servers from the pool while the peer set is under capacity.
async fn sub_connector(state: Arc<SubState>) {
    let mut done_rx = state.shared.done_tx.subscribe();

    loop {
        // Wait for a free slot.
        loop {
            if *done_rx.borrow() {
                return;
            }
            let capacity = state.shared.capacity.notified();
            let size = state.membership.lock().index.len();
            if size < usize::from(state.shared.cfg.max_peers) {
                break;
            }
            tokio::select! {
                _ = done_rx.changed() => return,
                _ = capacity => {}
            }
        }

        let srvr_addr = tokio::select! {
            _ = done_rx.changed() => return,
            addr = state.pool.pop() => addr,
        };

        debug!(%srvr_addr, "connecting to peer server");
        match Peer::connect(srvr_addr.clone(), state.local_has_path()).await {
            Ok(peer) => {
                if !state.try_add(peer.clone(), true) {
                    peer.halt();
                    state.pool.consider(srvr_addr);
                }
            }
            Err(err) if err.is_transient() => {
                info!(%srvr_addr, %err, "couldn't connect to peer server");
                state.pool.consider(srvr_addr);
            }
            Err(err) => {
                state.shared.set_exception(err.into());
                return;
            }
        }
    }
}
