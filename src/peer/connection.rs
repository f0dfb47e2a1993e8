use std::collections::VecDeque;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};
use tracing::{debug, error, info, warn};

use super::error::PeerError;
use super::message::Pdu;
use super::transport::{self, TransportReader, TransportWriter};
use crate::constants::SEND_QUEUE_BOUND;
use crate::inet::SockAddr;
use crate::product::{DataSeg, DataSegId, ProdIndex, ProdInfo};

/// Observer of a [`Peer`]'s receive path.
///
/// Every callback runs on the peer's receive worker, so an implementation
/// must tolerate concurrent invocation from the workers of multiple peers.
/// A `true` return from a notice callback makes the peer request the item;
/// a `Some` return from a request callback makes the peer send the data.
pub trait PeerManager: Send + Sync + 'static {
    /// The remote peer announced whether it has a path to the publisher.
    fn recv_pub_path(&self, has_path: bool, peer: &Peer);

    /// The remote peer announced available product information. Returns
    /// whether the information should be requested from it.
    fn recv_prod_notice(&self, index: ProdIndex, peer: &Peer) -> bool;

    /// The remote peer announced an available data segment. Returns whether
    /// the segment should be requested from it.
    fn recv_seg_notice(&self, id: DataSegId, peer: &Peer) -> bool;

    /// The remote peer asked for product information.
    fn recv_prod_request(&self, index: ProdIndex, peer: &Peer) -> Option<ProdInfo>;

    /// The remote peer asked for a data segment.
    fn recv_seg_request(&self, id: DataSegId, peer: &Peer) -> Option<DataSeg>;

    /// The remote peer delivered product information.
    fn recv_prod_info(&self, info: ProdInfo, peer: &Peer);

    /// The remote peer delivered a data segment.
    fn recv_data_seg(&self, seg: DataSeg, peer: &Peer);

    /// Both of the peer's workers have exited. Invoked exactly once per
    /// started peer.
    fn stopped(&self, peer: &Peer);

    /// The peer failed with an error that is not attributable to the remote
    /// end or the network path.
    fn fatal(&self, _err: PeerError, _peer: &Peer) {}
}

/// Lifecycle states of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PeerState {
    /// Constructed; workers not yet started.
    New = 0,
    /// Send and receive workers are running.
    Running = 1,
    /// Halted or failed; the send queue is flushed best-effort.
    Draining = 2,
    /// Both workers have exited.
    Dead = 3,
}

impl PeerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PeerState::New,
            1 => PeerState::Running,
            2 => PeerState::Draining,
            _ => PeerState::Dead,
        }
    }
}

// Bounded outbound PDU queue. Notices never block: when the queue is full
// the oldest queued notice is dropped to make room. Data and request PDUs
// block the producer until space frees up or the peer stops.
struct SendQueue {
    queue: Mutex<VecDeque<Pdu>>,
    readable: Notify,
    writable: Notify,
    closed: AtomicBool,
    dropped_notices: AtomicU64,
}

impl SendQueue {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            readable: Notify::new(),
            writable: Notify::new(),
            closed: AtomicBool::new(false),
            dropped_notices: AtomicU64::new(0),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    fn push_notice(&self, pdu: Pdu) -> Result<(), PeerError> {
        let mut queue = self.queue.lock();
        if self.is_closed() {
            return Err(PeerError::Stopped);
        }

        if queue.len() >= SEND_QUEUE_BOUND {
            // Oldest-wins: sacrifice the front-most queued notice. If the
            // queue holds no notice at all the new one is the casualty.
            let dropped = self.dropped_notices.fetch_add(1, Ordering::Relaxed) + 1;
            if let Some(pos) = queue.iter().position(Pdu::is_notice) {
                queue.remove(pos);
                queue.push_back(pdu);
            }
            drop(queue);
            debug!(dropped, "send queue full, notice dropped");
        } else {
            queue.push_back(pdu);
            drop(queue);
        }

        self.readable.notify_one();
        Ok(())
    }

    async fn push(&self, pdu: Pdu) -> Result<(), PeerError> {
        let mut pdu = Some(pdu);
        loop {
            let writable = self.writable.notified();
            {
                let mut queue = self.queue.lock();
                if self.is_closed() {
                    return Err(PeerError::Stopped);
                }
                if queue.len() < SEND_QUEUE_BOUND {
                    queue.push_back(pdu.take().expect("pdu consumed twice"));
                    drop(queue);
                    self.readable.notify_one();
                    return Ok(());
                }
            }
            writable.await;
        }
    }

    // Yields queued PDUs until the queue is both closed and drained.
    async fn pop(&self) -> Option<Pdu> {
        loop {
            let readable = self.readable.notified();
            {
                let mut queue = self.queue.lock();
                if let Some(pdu) = queue.pop_front() {
                    drop(queue);
                    self.writable.notify_one();
                    return Some(pdu);
                }
                if self.is_closed() {
                    return None;
                }
            }
            readable.await;
        }
    }
}

struct PeerInner {
    rmt_addr: SockAddr,
    rmt_has_path: AtomicBool,
    state: AtomicU8,
    queue: SendQueue,
    halted_tx: watch::Sender<bool>,
    // Present between construction and start()
    transport: Mutex<Option<(TransportReader, TransportWriter)>>,
    workers_left: AtomicU8,
}

/// One end of a duplex connection to a remote node.
///
/// A `Peer` is a cheap-to-clone handle; equality and hashing use the remote
/// socket address. The peer runs a send worker and a receive worker once
/// [`started`](Peer::start); incoming PDUs are dispatched to the
/// [`PeerManager`] observer.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl Peer {
    /// Dials a remote peer server and performs the handshake.
    ///
    /// Each side opens by announcing its own path-to-publisher status; the
    /// remote's announcement seeds [`is_path_to_pub`](Peer::is_path_to_pub).
    pub async fn connect(rmt_addr: SockAddr, local_has_path: bool) -> Result<Self, PeerError> {
        let std_addr = rmt_addr.resolve().await?;
        let stream = TcpStream::connect(std_addr).await?;
        Self::handshake(stream, rmt_addr, local_has_path).await
    }

    /// Completes the inbound side of the handshake on an accepted stream.
    pub async fn accept(stream: TcpStream, local_has_path: bool) -> Result<Self, PeerError> {
        let rmt_addr = stream.peer_addr()?.into();
        Self::handshake(stream, rmt_addr, local_has_path).await
    }

    async fn handshake(
        stream: TcpStream,
        rmt_addr: SockAddr,
        local_has_path: bool,
    ) -> Result<Self, PeerError> {
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = transport::split(stream);

        writer.send(&Pdu::PubPathNotice(local_has_path)).await?;
        let rmt_has_path = match reader.recv().await? {
            Pdu::PubPathNotice(has_path) => has_path,
            other => {
                return Err(PeerError::Protocol(format!(
                    "expected publisher-path handshake, got {:?}",
                    other.id()
                )))
            }
        };

        let (halted_tx, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(PeerInner {
                rmt_addr,
                rmt_has_path: AtomicBool::new(rmt_has_path),
                state: AtomicU8::new(PeerState::New as u8),
                queue: SendQueue::new(),
                halted_tx,
                transport: Mutex::new(Some((reader, writer))),
                workers_left: AtomicU8::new(2),
            }),
        })
    }

    /// Spawns the send and receive workers, transitioning to `Running`.
    ///
    /// Fails if the peer was already started or halted.
    pub fn start(&self, mgr: Arc<dyn PeerManager>) -> Result<(), PeerError> {
        let inner = &self.inner;
        if inner
            .state
            .compare_exchange(
                PeerState::New as u8,
                PeerState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(PeerError::Stopped);
        }

        let (reader, writer) = inner
            .transport
            .lock()
            .take()
            .expect("transport taken before start");

        let halted_rx = inner.halted_tx.subscribe();
        tokio::spawn(recv_loop(self.clone(), reader, mgr.clone(), halted_rx));
        tokio::spawn(send_loop(self.clone(), writer, mgr));
        Ok(())
    }

    /// The remote peer server's socket address.
    pub fn rmt_addr(&self) -> &SockAddr {
        &self.inner.rmt_addr
    }

    /// Whether the remote node last announced a path to the publisher.
    pub fn is_path_to_pub(&self) -> bool {
        self.inner.rmt_has_path.load(Ordering::Acquire)
    }

    /// The peer's lifecycle state.
    pub fn state(&self) -> PeerState {
        PeerState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Number of notices dropped because the send queue was full.
    pub fn dropped_notices(&self) -> u64 {
        self.inner.queue.dropped_notices.load(Ordering::Relaxed)
    }

    /// Enqueues a path-to-publisher notice. Never blocks.
    pub fn notify_pub_path(&self, has_path: bool) -> Result<(), PeerError> {
        self.inner.queue.push_notice(Pdu::PubPathNotice(has_path))
    }

    /// Enqueues a product-information notice. Never blocks; the oldest
    /// queued notice is dropped if the queue is full.
    pub fn notify_prod_info(&self, index: ProdIndex) -> Result<(), PeerError> {
        self.inner.queue.push_notice(Pdu::ProdInfoNotice(index))
    }

    /// Enqueues a data-segment notice. Never blocks; the oldest queued
    /// notice is dropped if the queue is full.
    pub fn notify_data_seg(&self, id: DataSegId) -> Result<(), PeerError> {
        self.inner.queue.push_notice(Pdu::DataSegNotice(id))
    }

    /// Enqueues a product-information request. Blocks while the send queue
    /// is full; fails fast once the peer is halted.
    pub async fn request_prod_info(&self, index: ProdIndex) -> Result<(), PeerError> {
        self.inner.queue.push(Pdu::ProdInfoRequest(index)).await
    }

    /// Enqueues a data-segment request.
    pub async fn request_data_seg(&self, id: DataSegId) -> Result<(), PeerError> {
        self.inner.queue.push(Pdu::DataSegRequest(id)).await
    }

    /// Enqueues product information for delivery.
    pub async fn send_prod_info(&self, info: ProdInfo) -> Result<(), PeerError> {
        self.inner.queue.push(Pdu::ProdInfo(info)).await
    }

    /// Enqueues a data segment for delivery.
    pub async fn send_data_seg(&self, seg: DataSeg) -> Result<(), PeerError> {
        self.inner.queue.push(Pdu::DataSeg(seg)).await
    }

    /// Halts the peer: new sends fail fast, the send queue is flushed
    /// best-effort, and both workers exit. Idempotent.
    pub fn halt(&self) {
        let prev = self
            .inner
            .state
            .fetch_max(PeerState::Draining as u8, Ordering::AcqRel);
        if prev >= PeerState::Draining as u8 {
            return;
        }
        self.inner.queue.close();
        self.inner.halted_tx.send_replace(true);
    }

    fn set_rmt_has_path(&self, has_path: bool) {
        self.inner.rmt_has_path.store(has_path, Ordering::Release);
    }

    // Called by each worker on exit; the last one marks the peer dead and
    // fires the observer's `stopped` exactly once.
    fn worker_finished(&self, mgr: &Arc<dyn PeerManager>) {
        if self.inner.workers_left.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner
                .state
                .store(PeerState::Dead as u8, Ordering::Release);
            mgr.stopped(self);
        }
    }
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.inner.rmt_addr == other.inner.rmt_addr
    }
}

impl Eq for Peer {}

impl Hash for Peer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.rmt_addr.hash(state);
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("rmt_addr", &self.inner.rmt_addr)
            .field("state", &self.state())
            .finish()
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.rmt_addr)
    }
}

async fn send_loop(peer: Peer, mut writer: TransportWriter, mgr: Arc<dyn PeerManager>) {
    while let Some(pdu) = peer.inner.queue.pop().await {
        if let Err(err) = writer.send(&pdu).await {
            handle_worker_error(&peer, err, &mgr);
            break;
        }
    }

    writer.shutdown().await;
    peer.halt();
    peer.worker_finished(&mgr);
}

async fn recv_loop(
    peer: Peer,
    mut reader: TransportReader,
    mgr: Arc<dyn PeerManager>,
    mut halted_rx: watch::Receiver<bool>,
) {
    loop {
        let result = tokio::select! {
            _ = halted_rx.changed() => break,
            result = reader.recv() => result,
        };

        match result {
            Ok(pdu) => {
                if dispatch(&peer, pdu, &mgr).await.is_err() {
                    break; // Halted while responding
                }
            }
            Err(PeerError::ConnectionClosed) => {
                debug!(peer = %peer, "remote peer closed the connection");
                break;
            }
            Err(err) => {
                handle_worker_error(&peer, err, &mgr);
                break;
            }
        }
    }

    peer.halt();
    peer.worker_finished(&mgr);
}

async fn dispatch(peer: &Peer, pdu: Pdu, mgr: &Arc<dyn PeerManager>) -> Result<(), PeerError> {
    match pdu {
        Pdu::PubPathNotice(has_path) => {
            peer.set_rmt_has_path(has_path);
            mgr.recv_pub_path(has_path, peer);
        }
        Pdu::ProdInfoNotice(index) => {
            if mgr.recv_prod_notice(index, peer) {
                peer.request_prod_info(index).await?;
            }
        }
        Pdu::DataSegNotice(id) => {
            if mgr.recv_seg_notice(id, peer) {
                peer.request_data_seg(id).await?;
            }
        }
        Pdu::ProdInfoRequest(index) => {
            if let Some(info) = mgr.recv_prod_request(index, peer) {
                peer.send_prod_info(info).await?;
            }
        }
        Pdu::DataSegRequest(id) => {
            if let Some(seg) = mgr.recv_seg_request(id, peer) {
                peer.send_data_seg(seg).await?;
            }
        }
        Pdu::ProdInfo(info) => mgr.recv_prod_info(info, peer),
        Pdu::DataSeg(seg) => mgr.recv_data_seg(seg, peer),
    }
    Ok(())
}

fn handle_worker_error(peer: &Peer, err: PeerError, mgr: &Arc<dyn PeerManager>) {
    match &err {
        PeerError::Protocol(_) | PeerError::InvalidPduId(_) | PeerError::Product(_) => {
            warn!(peer = %peer, %err, "protocol violation, dropping peer");
        }
        _ if err.is_transient() => {
            info!(peer = %peer, %err, "peer connection lost");
        }
        _ => {
            error!(peer = %peer, %err, "fatal peer error");
            mgr.fatal(err, peer);
        }
    }
}
