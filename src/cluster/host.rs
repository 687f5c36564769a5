//! Cluster hosts and the thread-safe host registry.

use std::collections::HashMap;
use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Reachability state of a single cluster host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    /// Known, not yet confirmed reachable.
    Pending,
    /// At least one worker holds a live connection pool to the host.
    Up,
    /// The host failed; a reconnection schedule is active until it comes
    /// back up or is removed from the cluster.
    Down,
}

impl HostState {
    fn from_u8(value: u8) -> HostState {
        match value {
            0 => HostState::Pending,
            1 => HostState::Up,
            _ => HostState::Down,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            HostState::Pending => 0,
            HostState::Up => 1,
            HostState::Down => 2,
        }
    }
}

impl Display for HostState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostState::Pending => write!(f, "PENDING"),
            HostState::Up => write!(f, "UP"),
            HostState::Down => write!(f, "DOWN"),
        }
    }
}

/// A single node of the database cluster, identified by network address.
///
/// Hosts are shared by reference counting. The registry is the sole
/// authority for creation and removal, but a request already routed to a
/// host may outlive its eviction from the registry, so the host is only
/// destroyed once the last holder drops it.
#[derive(Debug)]
pub struct Host {
    address: SocketAddr,
    // Written only from the session event loop, read from any thread.
    state: AtomicU8,
    // Reconciliation mark, interpreted against the registry's current
    // mark value. Hosts whose mark does not match are stale.
    mark: AtomicBool,
}

impl Host {
    fn new(address: SocketAddr, mark: bool) -> Self {
        Host {
            address,
            state: AtomicU8::new(HostState::Pending.as_u8()),
            mark: AtomicBool::new(mark),
        }
    }

    /// Network address of the host, its identity within the cluster.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Current reachability state.
    pub fn state(&self) -> HostState {
        HostState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the host is currently considered usable.
    pub fn is_up(&self) -> bool {
        self.state() == HostState::Up
    }

    pub(crate) fn set_state(&self, state: HostState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn set_mark(&self, mark: bool) {
        self.mark.store(mark, Ordering::Release);
    }

    fn mark(&self) -> bool {
        self.mark.load(Ordering::Acquire)
    }
}

impl PartialEq for Host {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Host {}

#[derive(Debug)]
struct RegistryInner {
    hosts: HashMap<SocketAddr, Arc<Host>>,
    // Mark value considered "fresh". Flipped at the end of every purge,
    // which unmarks all surviving hosts for the next reconciliation pass.
    current_mark: bool,
}

/// Thread-safe mapping from network address to host state.
///
/// The registry may be read from any thread; mutations are only ever
/// applied by the session event loop (or by the control connection
/// running on it), which keeps host state transitions totally ordered.
#[derive(Debug)]
pub struct HostRegistry {
    inner: Mutex<RegistryInner>,
}

impl HostRegistry {
    pub(crate) fn new() -> Self {
        HostRegistry {
            inner: Mutex::new(RegistryInner {
                hosts: HashMap::new(),
                current_mark: true,
            }),
        }
    }

    /// Looks up a host. With `should_mark` the host is marked fresh for
    /// the current reconciliation pass.
    pub fn get(&self, address: SocketAddr, should_mark: bool) -> Option<Arc<Host>> {
        let inner = self.inner.lock();
        let host = inner.hosts.get(&address)?;
        if should_mark {
            host.set_mark(inner.current_mark);
        }
        Some(host.clone())
    }

    /// Returns the existing host or inserts a new one in `Pending` state.
    /// Idempotent. The boolean reports whether an insertion happened.
    pub fn add(&self, address: SocketAddr, should_mark: bool) -> (Arc<Host>, bool) {
        let mut inner = self.inner.lock();
        let current_mark = inner.current_mark;
        match inner.hosts.get(&address) {
            Some(host) => {
                if should_mark {
                    host.set_mark(current_mark);
                }
                (host.clone(), false)
            }
            None => {
                let mark = if should_mark {
                    current_mark
                } else {
                    !current_mark
                };
                let host = Arc::new(Host::new(address, mark));
                inner.hosts.insert(address, host.clone());
                (host, true)
            }
        }
    }

    pub(crate) fn remove(&self, address: SocketAddr) -> Option<Arc<Host>> {
        self.inner.lock().hosts.remove(&address)
    }

    /// Removes and returns every host left unmarked since the last
    /// reconciliation pass, then starts the next pass by flipping the
    /// expected mark (instantly unmarking all survivors).
    pub fn purge(&self) -> Vec<Arc<Host>> {
        let mut inner = self.inner.lock();
        let current_mark = inner.current_mark;
        let stale: Vec<SocketAddr> = inner
            .hosts
            .iter()
            .filter(|(_, host)| host.mark() != current_mark)
            .map(|(address, _)| *address)
            .collect();
        let removed = stale
            .iter()
            .filter_map(|address| inner.hosts.remove(address))
            .collect();
        inner.current_mark = !current_mark;
        removed
    }

    /// A point-in-time copy of all registered hosts.
    pub fn snapshot(&self) -> Vec<Arc<Host>> {
        self.inner.lock().hosts.values().cloned().collect()
    }

    /// Number of registered hosts.
    pub fn len(&self) -> usize {
        self.inner.lock().hosts.len()
    }

    /// Whether the registry holds no hosts.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().hosts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, last], 9042))
    }

    #[test]
    fn add_is_idempotent_and_unique() {
        let registry = HostRegistry::new();
        let (first, inserted) = registry.add(addr(1), true);
        assert!(inserted);
        let (second, inserted) = registry.add(addr(1), true);
        assert!(!inserted);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn new_hosts_start_pending() {
        let registry = HostRegistry::new();
        let (host, _) = registry.add(addr(1), true);
        assert_eq!(host.state(), HostState::Pending);
        assert!(!host.is_up());
    }

    #[test]
    fn purge_removes_exactly_the_unmarked_hosts() {
        let registry = HostRegistry::new();
        registry.add(addr(1), true);
        registry.add(addr(2), true);
        registry.add(addr(3), false);

        let removed = registry.purge();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].address(), addr(3));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn purge_starts_a_fresh_reconciliation_pass() {
        let registry = HostRegistry::new();
        registry.add(addr(1), true);
        registry.add(addr(2), true);
        registry.purge();

        // Re-confirm only one host; the other must go on the next pass.
        registry.get(addr(1), true);
        let removed = registry.purge();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].address(), addr(2));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn re_adding_marks_an_existing_host() {
        let registry = HostRegistry::new();
        registry.add(addr(1), true);
        registry.purge();

        registry.add(addr(1), true);
        assert!(registry.purge().is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn host_survives_removal_while_referenced() {
        let registry = HostRegistry::new();
        let (host, _) = registry.add(addr(1), true);
        let removed = registry.remove(addr(1)).unwrap();
        assert!(Arc::ptr_eq(&host, &removed));
        assert!(registry.is_empty());
        // The in-flight reference keeps the host alive.
        assert_eq!(host.address(), addr(1));
    }
}
