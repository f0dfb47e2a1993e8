//! Peer wire protocol.
//!
//! This module implements one end of a duplex peer connection: the framed
//! PDU codec, the split transport, and the [`Peer`] state machine with its
//! send and receive workers. Incoming PDUs are classified as notices,
//! requests, data, or control and dispatched to a [`PeerManager`] observer.

mod connection;
mod error;
mod message;
mod transport;

pub use connection::{Peer, PeerManager, PeerState};
pub(crate) use error::is_transient_io;
pub use error::PeerError;
pub use message::{Pdu, PduId};
pub use transport::{split, TransportReader, TransportWriter};

#[cfg(test)]
mod tests;
