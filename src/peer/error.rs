use std::io;

use thiserror::Error;

use crate::product::ProductError;

/// Errors that can occur during peer communication.
#[derive(Debug, Error)]
pub enum PeerError {
    /// Network I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Received an unknown PDU id.
    #[error("invalid pdu id: {0}")]
    InvalidPduId(u8),

    /// Received a malformed protocol data unit.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A PDU carried an invalid product-model value.
    #[error("invalid product field: {0}")]
    Product(#[from] ProductError),

    /// The connection was closed by the remote peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// The peer has been halted; no further sends are possible.
    #[error("peer stopped")]
    Stopped,
}

impl PeerError {
    /// Whether this error indicates a failure of the remote end or the
    /// network path rather than of the local process.
    ///
    /// Transient errors terminate the affected peer only; anything else on
    /// a manager-owned socket is fatal to the whole P2P node.
    pub fn is_transient(&self) -> bool {
        match self {
            PeerError::Io(err) => is_transient_io(err),
            PeerError::ConnectionClosed | PeerError::Stopped => true,
            PeerError::InvalidPduId(_) | PeerError::Protocol(_) | PeerError::Product(_) => true,
        }
    }
}

/// Transient socket errors: the remote end or the network path failed.
pub(crate) fn is_transient_io(err: &io::Error) -> bool {
    use io::ErrorKind::*;

    matches!(
        err.kind(),
        ConnectionReset
            | ConnectionRefused
            | ConnectionAborted
            | NetworkUnreachable
            | NetworkDown
            | HostUnreachable
            | BrokenPipe
            | UnexpectedEof
            | TimedOut
    )
}
