//! P2P node configuration.

use std::net::Ipv4Addr;
use std::time::Duration;

use crate::constants::{
    CANON_SEG_SIZE, DEFAULT_IMPROVEMENT_PERIOD, DEFAULT_LISTEN_BACKLOG, DEFAULT_MAX_PEERS,
};
use crate::inet::{InetAddr, SockAddr};
use crate::p2p::P2pError;

/// Configuration of a P2P node, publisher or subscriber.
#[derive(Debug, Clone)]
pub struct P2pConfig {
    /// Maximum number of active peers.
    pub max_peers: u16,
    /// Period of the peer-improvement cycle.
    pub improvement_period: Duration,
    /// Address the peer server listens on.
    pub listen_addr: SockAddr,
    /// Listen backlog of the peer server socket.
    pub listen_backlog: u16,
    /// Source-specific multicast group for product data.
    pub mcast_group_addr: SockAddr,
    /// Interface the multicast socket binds to.
    pub mcast_iface: InetAddr,
    /// Canonical data-segment size in bytes.
    pub canon_seg_size: u16,
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            max_peers: DEFAULT_MAX_PEERS,
            improvement_period: DEFAULT_IMPROVEMENT_PERIOD,
            listen_addr: SockAddr::new(InetAddr::V4(Ipv4Addr::UNSPECIFIED), 38800),
            listen_backlog: DEFAULT_LISTEN_BACKLOG,
            // Default group lies in the source-specific multicast range.
            mcast_group_addr: SockAddr::new(InetAddr::V4(Ipv4Addr::new(232, 1, 1, 1)), 38801),
            mcast_iface: InetAddr::V4(Ipv4Addr::UNSPECIFIED),
            canon_seg_size: CANON_SEG_SIZE,
        }
    }
}

impl P2pConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), P2pError> {
        if self.max_peers == 0 {
            return Err(P2pError::InvalidArgument("max_peers is zero".into()));
        }
        if self.improvement_period.is_zero() {
            return Err(P2pError::InvalidArgument(
                "improvement_period is zero".into(),
            ));
        }
        if self.canon_seg_size == 0 || self.canon_seg_size > CANON_SEG_SIZE {
            return Err(P2pError::InvalidArgument(format!(
                "canon_seg_size {} not in 1..={}",
                self.canon_seg_size, CANON_SEG_SIZE
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(P2pConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let mut cfg = P2pConfig::default();
        cfg.max_peers = 0;
        assert!(matches!(
            cfg.validate(),
            Err(P2pError::InvalidArgument(_))
        ));

        let mut cfg = P2pConfig::default();
        cfg.improvement_period = Duration::ZERO;
        assert!(cfg.validate().is_err());

        let mut cfg = P2pConfig::default();
        cfg.canon_seg_size = CANON_SEG_SIZE + 1;
        assert!(cfg.validate().is_err());
    }
}
