//! Pool of candidate peer-server addresses.

use std::collections::VecDeque;
use std::time::Instant;

use parking_lot::Mutex;
use rand::Rng as _;
use tokio::sync::Notify;
use tracing::debug;

use crate::constants::{SERVER_RETRY_DELAY, SERVER_RETRY_JITTER};
use crate::inet::SockAddr;

struct PoolEntry {
    addr: SockAddr,
    ready_at: Instant,
}

/// Queue of remote peer servers a subscriber may dial.
///
/// Addresses that failed are re-enqueued with a cool-down plus random
/// jitter so a refused server is not hammered. [`pop`](ServerPool::pop)
/// blocks until an address becomes eligible and is safe to race against
/// cancellation: an address is only removed when it is returned.
#[derive(Default)]
pub struct ServerPool {
    queue: Mutex<VecDeque<PoolEntry>>,
    available: Notify,
}

impl ServerPool {
    /// Creates a pool seeded with immediately-eligible addresses.
    pub fn new(addrs: impl IntoIterator<Item = SockAddr>) -> Self {
        let now = Instant::now();
        let queue = addrs
            .into_iter()
            .map(|addr| PoolEntry {
                addr,
                ready_at: now,
            })
            .collect();
        Self {
            queue: Mutex::new(queue),
            available: Notify::new(),
        }
    }

    /// Adds an address, eligible immediately.
    pub fn add(&self, addr: SockAddr) {
        self.queue.lock().push_back(PoolEntry {
            addr,
            ready_at: Instant::now(),
        });
        self.available.notify_waiters();
    }

    /// Re-enqueues an address for a later retry.
    pub fn consider(&self, addr: SockAddr) {
        let jitter_ms = rand::rng().random_range(0..=SERVER_RETRY_JITTER.as_millis() as u64);
        let ready_at =
            Instant::now() + SERVER_RETRY_DELAY + std::time::Duration::from_millis(jitter_ms);
        debug!(%addr, "server recycled for retry");

        self.queue.lock().push_back(PoolEntry { addr, ready_at });
        self.available.notify_waiters();
    }

    /// Number of queued addresses, eligible or cooling down.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Removes and returns the first eligible address, waiting for one if
    /// necessary.
    pub async fn pop(&self) -> SockAddr {
        loop {
            let notified = self.available.notified();

            let next_ready = {
                let mut queue = self.queue.lock();
                let now = Instant::now();
                if let Some(pos) = queue.iter().position(|entry| entry.ready_at <= now) {
                    return queue.remove(pos).expect("position valid").addr;
                }
                queue.iter().map(|entry| entry.ready_at).min()
            };

            match next_ready {
                Some(at) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(at.into()) => {}
                    }
                }
                None => notified.await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    fn addr(host: u8) -> SockAddr {
        SockAddr::parse(&format!("10.0.0.{}:38800", host)).unwrap()
    }

    #[tokio::test]
    async fn test_pop_returns_seeded_addresses_in_order() {
        let pool = ServerPool::new([addr(1), addr(2)]);
        assert_eq!(pool.pop().await, addr(1));
        assert_eq!(pool.pop().await, addr(2));
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn test_pop_blocks_until_added() {
        let pool = ServerPool::new([]);

        let blocked = timeout(Duration::from_millis(50), pool.pop()).await;
        assert!(blocked.is_err());

        pool.add(addr(3));
        let popped = timeout(Duration::from_secs(1), pool.pop()).await.unwrap();
        assert_eq!(popped, addr(3));
    }

    #[tokio::test]
    async fn test_consider_applies_cool_down() {
        let pool = ServerPool::new([]);
        pool.consider(addr(4));
        assert_eq!(pool.len(), 1);

        // Not eligible inside the cool-down window.
        let blocked = timeout(Duration::from_millis(50), pool.pop()).await;
        assert!(blocked.is_err());
        assert_eq!(pool.len(), 1);
    }
}
