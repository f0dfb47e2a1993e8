use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::*;
use crate::constants::CANON_SEG_SIZE;
use crate::product::{DataSeg, DataSegId, ProdIndex, ProdInfo, Timestamp};

fn prod_index(index: u32) -> ProdIndex {
    ProdIndex::new(index).unwrap()
}

fn sample_info() -> ProdInfo {
    ProdInfo::with_timestamp(
        prod_index(1),
        "product",
        1_000_000,
        Timestamp {
            secs: 1_600_000_000,
            nanos: 123_456_789,
        },
    )
    .unwrap()
}

fn sample_seg() -> DataSeg {
    let id = DataSegId::new(prod_index(1), u32::from(CANON_SEG_SIZE));
    let data = Bytes::from(vec![0xbd; usize::from(CANON_SEG_SIZE)]);
    DataSeg::new(id, 1_000_000, data).unwrap()
}

#[test]
fn test_pdu_round_trip() {
    let seg_id = DataSegId::new(prod_index(42), 1448);
    let pdus = vec![
        Pdu::PubPathNotice(true),
        Pdu::PubPathNotice(false),
        Pdu::ProdInfoNotice(prod_index(42)),
        Pdu::DataSegNotice(seg_id),
        Pdu::ProdInfoRequest(prod_index(42)),
        Pdu::DataSegRequest(seg_id),
        Pdu::ProdInfo(sample_info()),
        Pdu::DataSeg(sample_seg()),
    ];

    for pdu in pdus {
        let mut buf = BytesMut::from(&pdu.encode()[..]);
        let decoded = Pdu::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, pdu);
        assert!(buf.is_empty());
    }
}

#[test]
fn test_decode_incremental() {
    let pdu = Pdu::ProdInfo(sample_info());
    let encoded = pdu.encode();

    let mut buf = BytesMut::new();
    for (i, byte) in encoded.iter().enumerate() {
        buf.extend_from_slice(&[*byte]);
        let result = Pdu::decode(&mut buf).unwrap();
        if i + 1 < encoded.len() {
            assert!(result.is_none(), "decoded early at byte {}", i);
        } else {
            assert_eq!(result.unwrap(), pdu);
        }
    }
}

#[test]
fn test_decode_consecutive_frames() {
    let first = Pdu::ProdInfoNotice(prod_index(1));
    let second = Pdu::DataSegNotice(DataSegId::new(prod_index(2), 2896));

    let mut buf = BytesMut::new();
    buf.extend_from_slice(&first.encode());
    buf.extend_from_slice(&second.encode());

    assert_eq!(Pdu::decode(&mut buf).unwrap().unwrap(), first);
    assert_eq!(Pdu::decode(&mut buf).unwrap().unwrap(), second);
    assert!(Pdu::decode(&mut buf).unwrap().is_none());
}

#[test]
fn test_decode_rejects_unknown_id() {
    let mut buf = BytesMut::from(&[0xffu8, 0, 0][..]);
    assert!(matches!(
        Pdu::decode(&mut buf),
        Err(PeerError::InvalidPduId(0xff))
    ));
}

#[test]
fn test_decode_rejects_unset_index() {
    let mut buf = BytesMut::from(&[PduId::ProdInfoNotice as u8, 0, 0, 0, 0][..]);
    assert!(matches!(
        Pdu::decode(&mut buf),
        Err(PeerError::Product(_))
    ));
}

#[test]
fn test_decode_rejects_bad_path_flag() {
    let mut buf = BytesMut::from(&[PduId::PubPathNotice as u8, 7][..]);
    assert!(matches!(Pdu::decode(&mut buf), Err(PeerError::Protocol(_))));
}

#[derive(Debug)]
enum Event {
    PubPath(bool),
    ProdNotice(ProdIndex),
    SegNotice(DataSegId),
    ProdRequest(ProdIndex),
    SegRequest(DataSegId),
    ProdInfo(ProdInfo),
    DataSeg(DataSeg),
}

// Observer that records every callback and answers from canned data.
struct Recorder {
    events: mpsc::UnboundedSender<Event>,
    request_on_notice: bool,
    prod_info: Option<ProdInfo>,
    data_seg: Option<DataSeg>,
    stopped_count: AtomicUsize,
}

impl Recorder {
    fn new(request_on_notice: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                events: tx,
                request_on_notice,
                prod_info: None,
                data_seg: None,
                stopped_count: AtomicUsize::new(0),
            }),
            rx,
        )
    }

    fn serving(
        prod_info: ProdInfo,
        data_seg: DataSeg,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                events: tx,
                request_on_notice: false,
                prod_info: Some(prod_info),
                data_seg: Some(data_seg),
                stopped_count: AtomicUsize::new(0),
            }),
            rx,
        )
    }
}

impl PeerManager for Recorder {
    fn recv_pub_path(&self, has_path: bool, _peer: &Peer) {
        let _ = self.events.send(Event::PubPath(has_path));
    }

    fn recv_prod_notice(&self, index: ProdIndex, _peer: &Peer) -> bool {
        let _ = self.events.send(Event::ProdNotice(index));
        self.request_on_notice
    }

    fn recv_seg_notice(&self, id: DataSegId, _peer: &Peer) -> bool {
        let _ = self.events.send(Event::SegNotice(id));
        self.request_on_notice
    }

    fn recv_prod_request(&self, index: ProdIndex, _peer: &Peer) -> Option<ProdInfo> {
        let _ = self.events.send(Event::ProdRequest(index));
        self.prod_info.clone()
    }

    fn recv_seg_request(&self, id: DataSegId, _peer: &Peer) -> Option<DataSeg> {
        let _ = self.events.send(Event::SegRequest(id));
        self.data_seg.clone()
    }

    fn recv_prod_info(&self, info: ProdInfo, _peer: &Peer) {
        let _ = self.events.send(Event::ProdInfo(info));
    }

    fn recv_data_seg(&self, seg: DataSeg, _peer: &Peer) {
        let _ = self.events.send(Event::DataSeg(seg));
    }

    fn stopped(&self, _peer: &Peer) {
        self.stopped_count.fetch_add(1, Ordering::SeqCst);
    }
}

async fn peer_pair(a_has_path: bool, b_has_path: bool) -> (Peer, Peer) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let accepted = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        Peer::accept(stream, b_has_path).await.unwrap()
    });
    let a = Peer::connect(addr.into(), a_has_path).await.unwrap();
    let b = accepted.await.unwrap();
    (a, b)
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

#[tokio::test]
async fn test_handshake_exchanges_path_status() {
    let (a, b) = peer_pair(true, false).await;

    // Each side learns the other's status during the handshake.
    assert!(!a.is_path_to_pub());
    assert!(b.is_path_to_pub());
    assert_eq!(a.state(), PeerState::New);
    assert_eq!(b.state(), PeerState::New);
}

#[tokio::test]
async fn test_notice_request_data_exchange() {
    let info = sample_info();
    let seg = sample_seg();

    let (publisher, subscriber) = peer_pair(true, false).await;
    let (pub_mgr, _pub_rx) = Recorder::serving(info.clone(), seg.clone());
    let (sub_mgr, mut sub_rx) = Recorder::new(true);

    publisher.start(pub_mgr).unwrap();
    subscriber.start(sub_mgr).unwrap();

    publisher.notify_prod_info(info.index()).unwrap();
    publisher.notify_data_seg(seg.id()).unwrap();

    // Notice arrives, the subscriber requests, the data comes back.
    assert!(matches!(next_event(&mut sub_rx).await, Event::ProdNotice(i) if i == info.index()));
    assert!(matches!(next_event(&mut sub_rx).await, Event::SegNotice(id) if id == seg.id()));
    assert!(matches!(next_event(&mut sub_rx).await, Event::ProdInfo(got) if got == info));
    assert!(matches!(next_event(&mut sub_rx).await, Event::DataSeg(got) if got == seg));

    publisher.halt();
    subscriber.halt();
}

#[tokio::test]
async fn test_request_served_from_observer() {
    let info = sample_info();
    let seg = sample_seg();

    let (server, client) = peer_pair(true, false).await;
    let (srv_mgr, mut srv_rx) = Recorder::serving(info.clone(), seg.clone());
    let (cli_mgr, mut cli_rx) = Recorder::new(false);

    server.start(srv_mgr).unwrap();
    client.start(cli_mgr).unwrap();

    client.request_prod_info(info.index()).await.unwrap();
    client.request_data_seg(seg.id()).await.unwrap();

    assert!(matches!(next_event(&mut srv_rx).await, Event::ProdRequest(_)));
    assert!(matches!(next_event(&mut srv_rx).await, Event::SegRequest(_)));
    assert!(matches!(next_event(&mut cli_rx).await, Event::ProdInfo(got) if got == info));
    assert!(matches!(next_event(&mut cli_rx).await, Event::DataSeg(got) if got == seg));

    server.halt();
    client.halt();
}

#[tokio::test]
async fn test_halt_stops_both_sides_once() {
    let (a, b) = peer_pair(false, false).await;
    let (a_mgr, _a_rx) = Recorder::new(false);
    let (b_mgr, _b_rx) = Recorder::new(false);

    a.start(a_mgr.clone()).unwrap();
    b.start(b_mgr.clone()).unwrap();

    a.halt();
    a.halt(); // Idempotent

    timeout(Duration::from_secs(5), async {
        while a_mgr.stopped_count.load(Ordering::SeqCst) == 0
            || b_mgr.stopped_count.load(Ordering::SeqCst) == 0
        {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("peers did not stop");

    assert_eq!(a_mgr.stopped_count.load(Ordering::SeqCst), 1);
    assert_eq!(b_mgr.stopped_count.load(Ordering::SeqCst), 1);
    assert_eq!(a.state(), PeerState::Dead);

    // Sends fail fast once halted.
    assert!(matches!(
        a.request_prod_info(prod_index(1)).await,
        Err(PeerError::Stopped)
    ));
    assert!(matches!(
        a.notify_prod_info(prod_index(1)),
        Err(PeerError::Stopped)
    ));
}

#[tokio::test]
async fn test_start_twice_fails() {
    let (a, b) = peer_pair(false, false).await;
    let (a_mgr, _a_rx) = Recorder::new(false);
    let (b_mgr, _b_rx) = Recorder::new(false);

    a.start(a_mgr.clone()).unwrap();
    assert!(matches!(a.start(a_mgr), Err(PeerError::Stopped)));

    a.halt();
    b.start(b_mgr).unwrap();
    b.halt();
}

#[tokio::test]
async fn test_peer_equality_on_remote_address() {
    let (a, b) = peer_pair(false, false).await;

    let a2 = a.clone();
    assert_eq!(a, a2);
    assert_ne!(a, b);
    assert_eq!(a.rmt_addr(), a2.rmt_addr());
}
