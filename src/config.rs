//! Session configuration.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::cluster::control::ControlConnection;
use crate::cluster::resolve::KnownNode;
use crate::network::connection::ConnectionFactory;
use crate::policies::load_balancing::{LoadBalancingPolicy, RoundRobinPolicy};
use crate::policies::reconnect::{
    ExponentialReconnectPolicy, FixedReconnectPolicy, ReconnectPolicy,
};

/// Configuration of a [`Session`](crate::session::Session).
///
/// The protocol seams (the connection factory and the control
/// connection) are mandatory; everything else has a sensible default
/// and is set through the public fields or the builder-style helpers.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct SessionConfig {
    /// Initial peers the session contacts to discover the cluster.
    pub known_nodes: Vec<KnownNode>,

    /// Number of worker event loops. Each worker holds its own
    /// connection pool to every live host.
    pub worker_count: usize,

    /// Opens data-plane connections for the worker pool.
    pub connection_factory: Arc<dyn ConnectionFactory>,

    /// Supplies cluster topology and host status notifications.
    pub control_connection: Arc<dyn ControlConnection>,

    /// Initial load balancing policy. Replaceable at runtime through
    /// [`Session::set_load_balancing_policy`](crate::session::Session::set_load_balancing_policy).
    pub load_balancing_policy: Arc<dyn LoadBalancingPolicy>,

    /// Backoff schedule for hosts that went down normally.
    pub reconnect_policy: Arc<dyn ReconnectPolicy>,

    /// Backoff schedule for hosts lost to a critical failure. Kept
    /// separate so critical failures can reconnect on an accelerated
    /// schedule.
    pub critical_reconnect_policy: Arc<dyn ReconnectPolicy>,

    /// Bound on each contact point DNS lookup. `None` waits forever.
    pub hostname_resolution_timeout: Option<Duration>,
}

impl SessionConfig {
    /// Creates a configuration with default policies and no contact
    /// points.
    pub fn new(
        connection_factory: Arc<dyn ConnectionFactory>,
        control_connection: Arc<dyn ControlConnection>,
    ) -> Self {
        SessionConfig {
            known_nodes: Vec::new(),
            worker_count: 1,
            connection_factory,
            control_connection,
            load_balancing_policy: Arc::new(RoundRobinPolicy::new()),
            reconnect_policy: Arc::new(FixedReconnectPolicy::default()),
            critical_reconnect_policy: Arc::new(ExponentialReconnectPolicy::default()),
            hostname_resolution_timeout: Some(Duration::from_secs(5)),
        }
    }

    /// Adds a contact point hostname ("db1.example.com:9042" or a bare
    /// hostname, resolved with the default port).
    pub fn add_known_node(&mut self, hostname: impl AsRef<str>) {
        self.known_nodes
            .push(KnownNode::Hostname(hostname.as_ref().to_owned()));
    }

    /// Adds a contact point address.
    pub fn add_known_node_addr(&mut self, node_addr: SocketAddr) {
        self.known_nodes.push(KnownNode::Address(node_addr));
    }

    /// Adds a list of contact point hostnames.
    pub fn add_known_nodes(&mut self, hostnames: impl IntoIterator<Item = impl AsRef<str>>) {
        for hostname in hostnames {
            self.add_known_node(hostname);
        }
    }

    /// Adds a list of contact point addresses.
    pub fn add_known_nodes_addr(
        &mut self,
        node_addrs: impl IntoIterator<Item = impl std::borrow::Borrow<SocketAddr>>,
    ) {
        for address in node_addrs {
            self.add_known_node_addr(*address.borrow());
        }
    }
}
