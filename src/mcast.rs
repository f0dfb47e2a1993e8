//! Interface to the multicast transport.
//!
//! The publisher multicasts product information and data segments on a
//! source-specific multicast group; subscribers receive them there and use
//! the P2P overlay only to repair losses. The transport itself lives
//! outside the P2P core: the publisher side is consumed through
//! [`McastSender`], and the subscriber side feeds each received item into
//! `SubscriberManager::recv_mcast_prod_info` /
//! `SubscriberManager::recv_mcast_data_seg` so notices for items already
//! held are suppressed.

use std::io;

use crate::product::{DataSeg, ProdInfo};

/// Publisher-side multicast transmitter.
pub trait McastSender: Send + Sync + 'static {
    /// Multicasts product information to the group.
    fn send_prod_info(&self, info: &ProdInfo) -> io::Result<()>;

    /// Multicasts a data segment to the group.
    fn send_data_seg(&self, seg: &DataSeg) -> io::Result<()>;
}
