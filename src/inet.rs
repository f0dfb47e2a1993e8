//! Internet addresses of peer servers.
//!
//! A [`SockAddr`] names a remote peer server by IPv4 address, IPv6 address,
//! or hostname, plus a port. Addresses are totally ordered (IPv4 before
//! IPv6 before names) so membership decisions that need a deterministic
//! tie-break can sort on them.

use std::cmp::Ordering;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr as StdSockAddr};

use tokio::net::lookup_host;

/// An internet address: IPv4, IPv6, or a hostname.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InetAddr {
    /// An IPv4 address.
    V4(Ipv4Addr),
    /// An IPv6 address.
    V6(Ipv6Addr),
    /// An unresolved hostname.
    Name(String),
}

impl InetAddr {
    fn tag(&self) -> u8 {
        match self {
            InetAddr::V4(_) => 0,
            InetAddr::V6(_) => 1,
            InetAddr::Name(_) => 2,
        }
    }
}

impl Ord for InetAddr {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (InetAddr::V4(a), InetAddr::V4(b)) => a.cmp(b),
            (InetAddr::V6(a), InetAddr::V6(b)) => a.cmp(b),
            (InetAddr::Name(a), InetAddr::Name(b)) => a.cmp(b),
            _ => self.tag().cmp(&other.tag()),
        }
    }
}

impl PartialOrd for InetAddr {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for InetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InetAddr::V4(addr) => write!(f, "{}", addr),
            InetAddr::V6(addr) => write!(f, "{}", addr),
            InetAddr::Name(name) => write!(f, "{}", name),
        }
    }
}

impl From<IpAddr> for InetAddr {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(addr) => InetAddr::V4(addr),
            IpAddr::V6(addr) => InetAddr::V6(addr),
        }
    }
}

/// Socket address of a peer server: an [`InetAddr`] plus a port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SockAddr {
    /// Host part.
    pub addr: InetAddr,
    /// Port in host byte order.
    pub port: u16,
}

impl SockAddr {
    /// Creates a socket address.
    pub fn new(addr: InetAddr, port: u16) -> Self {
        Self { addr, port }
    }

    /// Parses `host:port`. The host may be an IPv4 address, a bracketed
    /// IPv6 address, or a hostname.
    pub fn parse(s: &str) -> Option<Self> {
        if let Ok(std) = s.parse::<StdSockAddr>() {
            return Some(std.into());
        }
        let (host, port) = s.rsplit_once(':')?;
        let port = port.parse().ok()?;
        if host.is_empty() {
            return None;
        }
        Some(Self::new(InetAddr::Name(host.to_string()), port))
    }

    /// Resolves to a connectable address. Hostnames go through the system
    /// resolver; the first result wins.
    pub async fn resolve(&self) -> io::Result<StdSockAddr> {
        match &self.addr {
            InetAddr::V4(addr) => Ok(StdSockAddr::new(IpAddr::V4(*addr), self.port)),
            InetAddr::V6(addr) => Ok(StdSockAddr::new(IpAddr::V6(*addr), self.port)),
            InetAddr::Name(name) => {
                let mut addrs = lookup_host((name.as_str(), self.port)).await?;
                addrs.next().ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("no addresses for {}", name),
                    )
                })
            }
        }
    }
}

impl From<StdSockAddr> for SockAddr {
    fn from(std: StdSockAddr) -> Self {
        Self::new(std.ip().into(), std.port())
    }
}

impl fmt::Display for SockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.addr {
            InetAddr::V6(addr) => write!(f, "[{}]:{}", addr, self.port),
            _ => write!(f, "{}:{}", self.addr, self.port),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let v4 = SockAddr::parse("127.0.0.1:38800").unwrap();
        assert_eq!(v4.addr, InetAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(v4.port, 38800);

        let v6 = SockAddr::parse("[::1]:38800").unwrap();
        assert_eq!(v6.addr, InetAddr::V6(Ipv6Addr::LOCALHOST));

        let name = SockAddr::parse("localhost:38800").unwrap();
        assert_eq!(name.addr, InetAddr::Name("localhost".to_string()));

        assert!(SockAddr::parse("no-port").is_none());
        assert!(SockAddr::parse(":38800").is_none());
    }

    #[test]
    fn test_ordering_across_variants() {
        let v4 = SockAddr::parse("250.1.1.1:1").unwrap();
        let v6 = SockAddr::parse("[::1]:1").unwrap();
        let name = SockAddr::new(InetAddr::Name("a".to_string()), 1);

        // v4 < v6 < name regardless of payload
        assert!(v4 < v6);
        assert!(v6 < name);
        assert!(v4 < name);
    }

    #[test]
    fn test_ordering_within_variant() {
        let a = SockAddr::parse("10.0.0.1:2").unwrap();
        let b = SockAddr::parse("10.0.0.2:1").unwrap();
        assert!(a < b);

        let p1 = SockAddr::parse("10.0.0.1:1").unwrap();
        let p2 = SockAddr::parse("10.0.0.1:2").unwrap();
        assert!(p1 < p2);
    }

    #[test]
    fn test_display_round_trip() {
        for s in ["127.0.0.1:6881", "[::1]:6881", "example.com:6881"] {
            let addr = SockAddr::parse(s).unwrap();
            assert_eq!(addr.to_string(), s);
        }
    }
}
