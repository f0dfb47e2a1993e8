use std::io;

use thiserror::Error;

use crate::inet::SockAddr;
use crate::peer::PeerError;

/// Errors that can occur while running the P2P overlay.
#[derive(Debug, Error)]
pub enum P2pError {
    /// I/O error on a manager-owned socket. Fatal to the manager.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A peer-level failure surfaced to the manager.
    #[error("peer error: {0}")]
    Peer(#[from] PeerError),

    /// `run()` was called on a manager that is already running.
    #[error("manager is already running")]
    AlreadyRunning,

    /// `run()` was called on a manager that was already halted.
    #[error("manager is halted")]
    Halted,

    /// A peer with the same remote address is already a member.
    #[error("peer {0} is already a member")]
    PeerExists(SockAddr),

    /// Invalid configuration or argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
