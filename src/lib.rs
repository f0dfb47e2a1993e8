//! hycast - peer-to-peer data-product distribution
//!
//! This library implements the P2P overlay of a publish/subscribe content
//! distribution system: a single publisher multicasts immutable
//! data-products to many subscribers, and the subscribers repair multicast
//! losses by exchanging notices, requests, and data with neighbor peers
//! over TCP.
//!
//! # Modules
//!
//! - [`product`] - Products, segments, and their identifiers
//! - [`peer`] - Wire codec and the per-peer protocol state machine
//! - [`p2p`] - Peer set, bookkeepers, and the publisher/subscriber managers
//! - [`inet`] - Socket addresses of peer servers
//! - [`repository`] - Interface to the product store
//! - [`mcast`] - Interface to the multicast transport
//! - [`config`] - Node configuration

pub mod config;
pub mod constants;
pub mod inet;
pub mod mcast;
pub mod p2p;
pub mod peer;
pub mod product;
pub mod repository;

pub use config::P2pConfig;
pub use inet::{InetAddr, SockAddr};
pub use mcast::McastSender;
pub use p2p::{P2pError, PeerSet, PublisherManager, ServerPool, SubscriberManager};
pub use peer::{Peer, PeerError, PeerManager, PeerState};
pub use product::{
    DataSeg, DataSegId, NoteReq, ProdIndex, ProdInfo, ProdSize, ProductError, SegOffset, SegSize,
    Timestamp,
};
pub use repository::Repository;
