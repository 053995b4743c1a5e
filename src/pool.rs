//! The bounded proxy hand-off between validators and lanes, and the registry
//! of egress IPs already in use.

use std::collections::HashSet;

use parking_lot::Mutex;

use crate::proxy::{Egress, Proxy};

/// Bounded FIFO of routes ready to be used by a lane.
///
/// Capacity equals the lane count, so validators can never run further ahead
/// of the lanes than one proxy per lane. Clones share the same channel.
#[derive(Clone)]
pub struct ProxyPool {
    tx: async_channel::Sender<Egress>,
    rx: async_channel::Receiver<Egress>,
}

impl ProxyPool {
    /// Create a new pool holding at most `capacity` routes.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = async_channel::bounded(capacity.max(1));
        Self { tx, rx }
    }

    /// Wait for a route. Returns `None` once the pool is closed and drained.
    pub async fn take(&self) -> Option<Egress> {
        self.rx.recv().await.ok()
    }

    /// Hand a route to the lanes, waiting while the pool is full.
    /// Returns `false` if the pool was closed and the route dropped.
    pub async fn put(&self, egress: Egress) -> bool {
        self.tx.send(egress).await.is_ok()
    }

    /// Close the pool. Waiting lanes drain what is queued, then see `None`.
    pub fn close(&self) {
        self.tx.close();
    }

    /// Whether the pool has been closed.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Number of routes currently queued.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Whether no route is queued.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Maximum number of queued routes.
    pub fn capacity(&self) -> usize {
        self.tx.capacity().unwrap_or(usize::MAX)
    }
}

/// Result of offering a validated proxy to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The IP was new and recorded; carries the registry size after insertion.
    Accepted(usize),
    /// Another proxy already exits through this IP.
    Duplicate,
    /// Every lane already has a unique proxy.
    Full,
}

#[derive(Default)]
struct Registry {
    ips: HashSet<String>,
    proxies: HashSet<String>,
}

/// Append-only set of egress IPs observed through validated proxies.
///
/// Admission checks uniqueness and the lane limit under one lock, so the set
/// can never hold more entries than lanes nor the same IP twice.
#[derive(Default)]
pub struct UniqueIps {
    inner: Mutex<Registry>,
}

impl UniqueIps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `ip` for `proxy` if it is unseen and fewer than `limit` are recorded.
    pub fn admit(&self, proxy: &Proxy, ip: &str, limit: usize) -> Admission {
        let mut registry = self.inner.lock();
        if registry.ips.contains(ip) {
            registry.proxies.insert(proxy.address.clone());
            return Admission::Duplicate;
        }
        if registry.ips.len() >= limit {
            return Admission::Full;
        }
        registry.ips.insert(ip.to_string());
        registry.proxies.insert(proxy.address.clone());
        Admission::Accepted(registry.ips.len())
    }

    /// Whether `proxy` was already accepted or found to share an accepted IP,
    /// so probing it again is pointless.
    pub fn knows_proxy(&self, proxy: &Proxy) -> bool {
        self.inner.lock().proxies.contains(&proxy.address)
    }

    /// Whether every one of `proxies` is known, checked under one lock.
    pub fn knows_all(&self, proxies: &[Proxy]) -> bool {
        let registry = self.inner.lock();
        proxies.iter().all(|p| registry.proxies.contains(&p.address))
    }

    /// Whether `ip` is already recorded.
    pub fn contains(&self, ip: &str) -> bool {
        self.inner.lock().ips.contains(ip)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().ips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
