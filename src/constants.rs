//! Protocol constants and tuning parameters.

use std::time::Duration;

// ============================================================================
// Segment sizing
// ============================================================================

/// Canonical data-segment size in bytes.
///
/// Derived from an Ethernet MTU: 1500 minus the IP header (20), the TCP
/// header (20), and the segment framing (PDU id plus product index, offset,
/// and product size).
pub const CANON_SEG_SIZE: u16 = 1448;

// ============================================================================
// Peer tuning
// ============================================================================

/// Bound on a peer's outbound PDU queue.
pub const SEND_QUEUE_BOUND: usize = 256;

// ============================================================================
// Manager defaults
// ============================================================================

/// Default maximum number of active peers.
pub const DEFAULT_MAX_PEERS: u16 = 8;

/// Default peer-improvement period.
pub const DEFAULT_IMPROVEMENT_PERIOD: Duration = Duration::from_secs(60);

/// Default listen backlog for the peer server socket.
pub const DEFAULT_LISTEN_BACKLOG: u16 = 8;

// ============================================================================
// Server pool
// ============================================================================

/// Cool-down before a failed server address becomes eligible for redial.
pub const SERVER_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Maximum random jitter added to [`SERVER_RETRY_DELAY`].
pub const SERVER_RETRY_JITTER: Duration = Duration::from_secs(15);
