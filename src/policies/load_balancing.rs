//! Load balancing policy interface.
//!
//! A policy turns a request plus the current host registry into an
//! ordered sequence of candidate hosts. The session tries candidates in
//! order and falls through on assignment failure. Concrete production
//! policies (token-aware, DC-aware, ...) are built on top of this trait
//! outside the core; [`RoundRobinPolicy`] is the minimal default a fresh
//! session starts with.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;

use crate::cluster::host::{Host, HostRegistry};

/// Per-request information available to load balancing policies.
#[derive(Default, Clone, Debug)]
#[non_exhaustive]
pub struct RoutingInfo<'a> {
    /// Keyspace the request executes against, if known.
    pub keyspace: Option<&'a str>,
}

/// Ordered sequence of candidate hosts for one request.
pub type Plan = Box<dyn Iterator<Item = Arc<Host>> + Send>;

/// Policy that decides which hosts to contact for each request.
pub trait LoadBalancingPolicy: Send + Sync + fmt::Debug {
    /// Called once with the initial topology, right before the session
    /// becomes ready.
    fn init(&self, _hosts: &[Arc<Host>]) {}

    /// Produces an ordered sequence of candidate hosts for a request.
    fn plan(&self, request: &RoutingInfo<'_>, registry: &HostRegistry) -> Plan;

    /// A host was inserted into the registry.
    fn on_host_added(&self, _host: &Arc<Host>) {}

    /// A host was removed from the registry.
    fn on_host_removed(&self, _host: &Arc<Host>) {}

    /// A host transitioned to `Up`.
    fn on_host_up(&self, _host: &Arc<Host>) {}

    /// A host transitioned to `Down`.
    fn on_host_down(&self, _host: &Arc<Host>) {}

    /// Name of the policy, used in logs.
    fn name(&self) -> &'static str;
}

/// Rotates over all `Up` hosts, starting from a random offset so that
/// multiple sessions don't all hit the same host first.
#[derive(Debug)]
pub struct RoundRobinPolicy {
    index: AtomicUsize,
}

impl RoundRobinPolicy {
    /// Creates the policy with a randomized starting offset.
    pub fn new() -> Self {
        RoundRobinPolicy {
            index: AtomicUsize::new(rand::rng().random_range(0..4096)),
        }
    }
}

impl Default for RoundRobinPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancingPolicy for RoundRobinPolicy {
    fn plan(&self, _request: &RoutingInfo<'_>, registry: &HostRegistry) -> Plan {
        let mut hosts: Vec<Arc<Host>> = registry
            .snapshot()
            .into_iter()
            .filter(|host| host.is_up())
            .collect();
        if hosts.is_empty() {
            return Box::new(std::iter::empty());
        }
        // Sort for a stable rotation order; snapshot order is arbitrary.
        hosts.sort_unstable_by_key(|host| host.address());
        let offset = self.index.fetch_add(1, Ordering::Relaxed) % hosts.len();
        hosts.rotate_left(offset);
        Box::new(hosts.into_iter())
    }

    fn name(&self) -> &'static str {
        "RoundRobinPolicy"
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::cluster::host::HostState;

    fn registry_with_up_hosts(count: u8) -> HostRegistry {
        let registry = HostRegistry::new();
        for i in 1..=count {
            let (host, _) = registry.add(SocketAddr::from(([10, 0, 0, i], 9042)), true);
            host.set_state(HostState::Up);
        }
        registry
    }

    #[test]
    fn plan_rotates_over_all_up_hosts() {
        let registry = registry_with_up_hosts(3);
        let policy = RoundRobinPolicy::new();

        let first_of_each: Vec<SocketAddr> = (0..3)
            .map(|_| {
                policy
                    .plan(&RoutingInfo::default(), &registry)
                    .next()
                    .unwrap()
                    .address()
            })
            .collect();

        // Three consecutive plans start at three distinct hosts.
        let mut unique = first_of_each.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), 3);
    }

    #[test]
    fn plan_contains_every_up_host_once() {
        let registry = registry_with_up_hosts(4);
        let policy = RoundRobinPolicy::new();

        let mut planned: Vec<SocketAddr> = policy
            .plan(&RoutingInfo::default(), &registry)
            .map(|host| host.address())
            .collect();
        planned.sort_unstable();
        planned.dedup();
        assert_eq!(planned.len(), 4);
    }

    #[test]
    fn plan_skips_hosts_that_are_not_up() {
        let registry = registry_with_up_hosts(2);
        let (down, _) = registry.add(SocketAddr::from(([10, 0, 0, 9], 9042)), true);
        down.set_state(HostState::Down);
        let (pending, _) = registry.add(SocketAddr::from(([10, 0, 0, 8], 9042)), true);
        assert_eq!(pending.state(), HostState::Pending);

        let policy = RoundRobinPolicy::new();
        let planned: Vec<Arc<Host>> = policy.plan(&RoutingInfo::default(), &registry).collect();
        assert_eq!(planned.len(), 2);
        assert!(planned.iter().all(|host| host.is_up()));
    }

    #[test]
    fn plan_is_empty_without_up_hosts() {
        let registry = HostRegistry::new();
        registry.add(SocketAddr::from(([10, 0, 0, 1], 9042)), true);

        let policy = RoundRobinPolicy::new();
        assert_eq!(policy.plan(&RoutingInfo::default(), &registry).count(), 0);
    }
}
