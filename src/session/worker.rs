//! The session event loop.
//!
//! Owns all cluster state: the worker pool, per-worker pool
//! availability, the connect and close protocols, and reconnection
//! scheduling. Everything in here runs on the single session event-loop
//! thread; the only concurrency is the `LocalSet` tasks it spawns for
//! DNS lookups, the control connection and reconnect timers, which all
//! report back through the session event channel.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::spawn_local;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::control::ControlHandle;
use crate::cluster::host::{Host, HostState};
use crate::cluster::resolve::{resolve_hostname, KnownNode};
use crate::errors::{ConnectionError, NewSessionError, RequestError};
use crate::network::worker::{WorkerCommand, WorkerHandle};
use crate::policies::load_balancing::RoutingInfo;
use crate::policies::reconnect::ReconnectSchedule;
use crate::session::channel::{PendingRequest, RequestWakeup};
use crate::session::event::SessionEvent;
use crate::session::future::{CloseResolver, ConnectResolver};
use crate::session::SessionShared;

/// Bookkeeping for the single in-flight connect.
///
/// The connect protocol is counter-driven: contact point resolutions,
/// worker startups and pool establishment attempts are all counted out
/// and back in, and the connect finishes once every counter returns to
/// zero with the control connection ready.
struct ConnectInFlight {
    resolver: ConnectResolver,
    pending_resolves: usize,
    pending_workers: usize,
    pending_pools: usize,
    ready_seen: bool,
    pools_started: bool,
    any_pool: bool,
    contact_points: Vec<SocketAddr>,
    failed_hostnames: Vec<String>,
}

pub(crate) struct SessionWorker {
    shared: Arc<SessionShared>,
    events: UnboundedReceiver<SessionEvent>,
    wakeup: RequestWakeup,

    workers: Vec<WorkerHandle>,
    // pool_hosts[w] is the set of hosts worker w holds a live pool to;
    // the routing fallback below only ever assigns within this set.
    // pool_opening[w] holds the opens worker w has not answered yet, so
    // each worker sees at most one AddPool per host at a time and every
    // AddPool sent is matched by exactly one PoolReady or PoolError.
    pool_hosts: Vec<HashSet<SocketAddr>>,
    pool_opening: Vec<HashSet<SocketAddr>>,
    current_worker: usize,

    connect: Option<ConnectInFlight>,
    control_token: CancellationToken,

    // One backoff schedule per down host; `reconnect_pending` holds the
    // hosts with a timer currently running, so a host is never double
    // scheduled.
    reconnect_schedules: HashMap<SocketAddr, Box<dyn ReconnectSchedule>>,
    reconnect_pending: HashSet<SocketAddr>,
}

impl SessionWorker {
    pub(crate) fn new(
        shared: Arc<SessionShared>,
        events: UnboundedReceiver<SessionEvent>,
        wakeup: RequestWakeup,
    ) -> Self {
        SessionWorker {
            shared,
            events,
            wakeup,
            workers: Vec::new(),
            pool_hosts: Vec::new(),
            pool_opening: Vec::new(),
            current_worker: 0,
            connect: None,
            control_token: CancellationToken::new(),
            reconnect_schedules: HashMap::new(),
            reconnect_pending: HashSet::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        debug!("Session event loop started");
        let close_resolver = loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(SessionEvent::Close { resolver }) => {
                        self.begin_close();
                        break Some(resolver);
                    }
                    Some(event) => self.handle_event(event),
                    None => break None,
                },
                _ = self.wakeup.ready() => self.dispatch_requests(),
            }
        };
        self.shutdown(close_resolver);
    }

    fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Connect { keyspace, resolver } => self.on_connect(keyspace, resolver),
            SessionEvent::Close { .. } => unreachable!("close is handled by the run loop"),
            SessionEvent::ContactPointResolved { address, hostname } => {
                self.on_contact_point_resolved(address, hostname)
            }
            SessionEvent::ControlReady => self.on_control_ready(),
            SessionEvent::ControlClosed => self.on_control_closed(),
            SessionEvent::ControlError { code, message } => self.on_control_error(code, message),
            SessionEvent::HostAdd {
                address,
                is_initial_connection,
            } => self.on_host_add(address, is_initial_connection),
            SessionEvent::HostRemove { address } => self.on_host_remove(address),
            SessionEvent::HostUp { address } => self.on_host_up(address),
            SessionEvent::HostDown {
                address,
                is_critical_failure,
            } => self.on_host_down(address, is_critical_failure),
            SessionEvent::HostsPurged { hosts } => {
                for host in hosts {
                    self.drop_host(&host);
                }
            }
            SessionEvent::SetKeyspace { keyspace } => {
                for worker in &self.workers {
                    let _ = worker.send(WorkerCommand::SetKeyspace {
                        keyspace: keyspace.clone(),
                    });
                }
            }
            SessionEvent::WorkerStarted { worker } => self.on_worker_started(worker),
            SessionEvent::PoolReady { worker, address } => self.on_pool_ready(worker, address),
            SessionEvent::PoolError {
                worker,
                address,
                error,
            } => self.on_pool_error(worker, address, error),
            SessionEvent::PoolClosed { worker, address } => self.on_pool_closed(worker, address),
            SessionEvent::Reconnect { address } => self.on_reconnect(address),
        }
    }

    // -----------------------------------------------------------------
    // Connect protocol
    // -----------------------------------------------------------------

    fn on_connect(&mut self, keyspace: Option<String>, resolver: ConnectResolver) {
        if self.connect.is_some() || self.shared.is_connected() {
            // The handle-side compare-and-swap makes this unreachable,
            // but a stray event must not wedge the future.
            resolver.fail(NewSessionError::AlreadyConnecting);
            return;
        }
        if let Some(keyspace) = &keyspace {
            self.shared.store_keyspace(keyspace);
        }

        let nodes = self.shared.config.known_nodes.clone();
        self.connect = Some(ConnectInFlight {
            resolver,
            pending_resolves: nodes.len(),
            pending_workers: 0,
            pending_pools: 0,
            ready_seen: false,
            pools_started: false,
            any_pool: false,
            contact_points: Vec::new(),
            failed_hostnames: Vec::new(),
        });

        let timeout = self.shared.config.hostname_resolution_timeout;
        for node in nodes {
            let events = self.shared.events.clone();
            match node {
                KnownNode::Address(address) => {
                    let _ = events.send(SessionEvent::ContactPointResolved {
                        address: Some(address),
                        hostname: None,
                    });
                }
                KnownNode::Hostname(hostname) => {
                    spawn_local(async move {
                        let resolved = resolve_hostname(&hostname, timeout).await;
                        let address = match resolved {
                            Ok(address) => Some(address),
                            Err(error) => {
                                warn!("Failed to resolve {}: {}", hostname, error);
                                None
                            }
                        };
                        let _ = events.send(SessionEvent::ContactPointResolved {
                            address,
                            hostname: Some(hostname),
                        });
                    });
                }
            }
        }
    }

    fn on_contact_point_resolved(
        &mut self,
        address: Option<SocketAddr>,
        hostname: Option<String>,
    ) {
        if let Some(address) = address {
            self.shared.registry.add(address, true);
        }
        let Some(connect) = &mut self.connect else {
            return;
        };
        connect.pending_resolves = connect.pending_resolves.saturating_sub(1);
        match address {
            Some(address) => connect.contact_points.push(address),
            None => {
                if let Some(hostname) = hostname {
                    connect.failed_hostnames.push(hostname);
                }
            }
        }
        if connect.pending_resolves > 0 {
            return;
        }
        let failed = if connect.contact_points.is_empty() {
            Some(std::mem::take(&mut connect.failed_hostnames))
        } else {
            None
        };
        match failed {
            Some(failed) => {
                self.fail_connect(NewSessionError::FailedToResolveAnyHostname(failed))
            }
            None => self.start_control(),
        }
    }

    fn start_control(&mut self) {
        let Some(connect) = &self.connect else {
            return;
        };
        let contact_points: Arc<[SocketAddr]> = connect.contact_points.clone().into();
        info!("Contact points resolved: {:?}", contact_points);
        let handle = ControlHandle::new(
            self.shared.events.clone(),
            self.control_token.clone(),
            contact_points,
        );
        let control = self.shared.config.control_connection.clone();
        spawn_local(control.run(handle));
    }

    fn on_control_ready(&mut self) {
        let Some(connect) = &mut self.connect else {
            debug!("Control connection re-established");
            return;
        };
        if connect.ready_seen {
            return;
        }
        connect.ready_seen = true;
        info!("Control connection established");
        self.start_workers();
        self.maybe_start_pools();
    }

    fn on_control_error(&mut self, code: u16, message: String) {
        if self.connect.is_some() {
            self.fail_connect(NewSessionError::ControlConnection { code, message });
        } else {
            warn!("Control connection error {}: {}", code, message);
        }
    }

    fn on_control_closed(&mut self) {
        if self.connect.is_some() {
            self.fail_connect(NewSessionError::ControlConnection {
                code: 0,
                message: "control connection closed".to_owned(),
            });
        } else {
            info!("Control connection closed");
        }
    }

    fn start_workers(&mut self) {
        let count = self.shared.config.worker_count.max(1);
        debug!("Starting {} workers", count);
        for index in 0..count {
            let spawned = WorkerHandle::spawn(
                index,
                self.shared.config.connection_factory.clone(),
                self.shared.events.clone(),
            );
            match spawned {
                Ok(handle) => {
                    if let Some(keyspace) = self.shared.keyspace() {
                        let _ = handle.send(WorkerCommand::SetKeyspace { keyspace });
                    }
                    self.workers.push(handle);
                    self.pool_hosts.push(HashSet::new());
                    self.pool_opening.push(HashSet::new());
                }
                Err(error) => {
                    self.fail_connect(NewSessionError::InitThread(Arc::new(error)));
                    return;
                }
            }
        }
        if let Some(connect) = &mut self.connect {
            connect.pending_workers = self.workers.len();
        }
    }

    fn on_worker_started(&mut self, worker: usize) {
        debug!("Worker {} ready", worker);
        if let Some(connect) = &mut self.connect {
            connect.pending_workers = connect.pending_workers.saturating_sub(1);
        }
        self.maybe_start_pools();
    }

    fn maybe_start_pools(&mut self) {
        let start = matches!(
            &self.connect,
            Some(c) if c.ready_seen
                && c.pending_resolves == 0
                && c.pending_workers == 0
                && !c.pools_started
        );
        if !start {
            return;
        }
        if let Some(connect) = &mut self.connect {
            connect.pools_started = true;
        }
        for host in self.shared.registry.snapshot() {
            self.add_pools_for_host(&host);
        }
        // Covers the empty-topology case, where no pool was requested.
        self.try_finish_connect();
    }

    fn try_finish_connect(&mut self) {
        let done = matches!(
            &self.connect,
            Some(c) if c.ready_seen
                && c.pools_started
                && c.pending_resolves == 0
                && c.pending_workers == 0
                && c.pending_pools == 0
        );
        if !done {
            return;
        }
        let Some(connect) = self.connect.take() else {
            return;
        };
        if !connect.any_pool {
            warn!("Session connect failed: no connection pool could be established");
            connect.resolver.fail(NewSessionError::NoHostsAvailable);
            self.rollback_connect();
            return;
        }

        let snapshot = self.shared.registry.snapshot();
        self.shared.policy.get().init(&snapshot);
        // Hosts that came up short of a pool go straight onto the
        // ordinary reconnect schedule.
        for host in &snapshot {
            if !host.is_up() {
                self.schedule_reconnect(host.address(), false);
            }
        }
        self.shared.set_connected();
        info!("Session is connected");
        connect.resolver.resolve();
        self.dispatch_requests();
    }

    fn fail_connect(&mut self, error: NewSessionError) {
        if let Some(connect) = self.connect.take() {
            warn!("Session connect failed: {}", error);
            connect.resolver.fail(error);
            self.rollback_connect();
        }
    }

    /// Undoes a partial connect: stops the control connection, tears
    /// down any workers already started and re-arms for a fresh attempt.
    fn rollback_connect(&mut self) {
        self.control_token.cancel();
        self.control_token = CancellationToken::new();
        self.shutdown_workers();
        self.reconnect_schedules.clear();
        self.reconnect_pending.clear();
        self.shared.reset_connect_state();
    }

    // -----------------------------------------------------------------
    // Topology
    // -----------------------------------------------------------------

    fn on_host_add(&mut self, address: SocketAddr, is_initial_connection: bool) {
        let (host, inserted) = self.shared.registry.add(address, true);
        if inserted {
            info!("[{}] Discovered new host", address);
            self.shared.policy.get().on_host_added(&host);
        }
        if is_initial_connection {
            // Pools for the initial topology come up in one batch once
            // all workers are running.
            return;
        }
        if matches!(&self.connect, Some(c) if !c.pools_started) {
            return;
        }
        self.add_pools_for_host(&host);
    }

    fn on_host_remove(&mut self, address: SocketAddr) {
        let Some(host) = self.shared.registry.remove(address) else {
            return;
        };
        info!("[{}] Host removed from cluster", address);
        self.drop_host(&host);
    }

    fn on_host_up(&mut self, address: SocketAddr) {
        let (host, inserted) = self.shared.registry.add(address, true);
        if inserted {
            self.shared.policy.get().on_host_added(&host);
        }
        if self.connect.is_some() {
            return;
        }
        let missing = self
            .pool_hosts
            .iter()
            .any(|pools| !pools.contains(&address));
        if missing {
            self.add_pools_for_host(&host);
        } else if !self.pool_hosts.is_empty() && !host.is_up() {
            host.set_state(HostState::Up);
            info!("[{}] Host is up", address);
            self.shared.policy.get().on_host_up(&host);
        }
    }

    fn on_host_down(&mut self, address: SocketAddr, is_critical_failure: bool) {
        let Some(host) = self.shared.registry.get(address, false) else {
            return;
        };
        for (index, worker) in self.workers.iter().enumerate() {
            if self.pool_hosts[index].remove(&address) {
                let command = if is_critical_failure {
                    WorkerCommand::FailPool { address }
                } else {
                    WorkerCommand::RemovePool { address }
                };
                let _ = worker.send(command);
            }
        }
        if host.state() != HostState::Down {
            host.set_state(HostState::Down);
            warn!(
                "[{}] Host is down{}",
                address,
                if is_critical_failure {
                    " (critical failure)"
                } else {
                    ""
                }
            );
            self.shared.policy.get().on_host_down(&host);
        }
        if self.connect.is_none() {
            self.schedule_reconnect(address, is_critical_failure);
        }
    }

    /// Teardown shared by removal and purge: the host is already out of
    /// the registry, only pools, policy and reconnect state remain.
    fn drop_host(&mut self, host: &Arc<Host>) {
        let address = host.address();
        for (index, worker) in self.workers.iter().enumerate() {
            if self.pool_hosts[index].remove(&address) {
                let _ = worker.send(WorkerCommand::RemovePool { address });
            }
        }
        self.shared.policy.get().on_host_removed(host);
        self.reconnect_schedules.remove(&address);
        self.reconnect_pending.remove(&address);
    }

    // -----------------------------------------------------------------
    // Pool feedback
    // -----------------------------------------------------------------

    fn add_pools_for_host(&mut self, host: &Arc<Host>) {
        let address = host.address();
        for (index, worker) in self.workers.iter().enumerate() {
            if self.pool_hosts[index].contains(&address)
                || self.pool_opening[index].contains(&address)
            {
                continue;
            }
            if worker.send(WorkerCommand::AddPool { host: host.clone() }).is_err() {
                continue;
            }
            self.pool_opening[index].insert(address);
            if let Some(connect) = &mut self.connect {
                if connect.pools_started {
                    connect.pending_pools += 1;
                }
            }
        }
    }

    fn on_pool_ready(&mut self, worker: usize, address: SocketAddr) {
        if let Some(opening) = self.pool_opening.get_mut(worker) {
            opening.remove(&address);
        }
        match self.shared.registry.get(address, false) {
            Some(host) => {
                if let Some(pools) = self.pool_hosts.get_mut(worker) {
                    pools.insert(address);
                }
                self.reconnect_schedules.remove(&address);
                if host.state() != HostState::Up {
                    host.set_state(HostState::Up);
                    info!("[{}] Host is up", address);
                    self.shared.policy.get().on_host_up(&host);
                }
            }
            None => {
                // The host was evicted while the pool was opening.
                if let Some(handle) = self.workers.get(worker) {
                    let _ = handle.send(WorkerCommand::RemovePool { address });
                }
            }
        }
        if let Some(connect) = &mut self.connect {
            connect.pending_pools = connect.pending_pools.saturating_sub(1);
            connect.any_pool = true;
            self.try_finish_connect();
        }
    }

    fn on_pool_error(&mut self, worker: usize, address: SocketAddr, error: ConnectionError) {
        if let Some(opening) = self.pool_opening.get_mut(worker) {
            opening.remove(&address);
        }
        warn!(
            "[{}] Worker {} failed to open connection pool: {}",
            address, worker, error
        );
        if let Some(connect) = &mut self.connect {
            connect.pending_pools = connect.pending_pools.saturating_sub(1);
            self.try_finish_connect();
            return;
        }
        self.on_pool_lost(address, false);
    }

    fn on_pool_closed(&mut self, worker: usize, address: SocketAddr) {
        if let Some(pools) = self.pool_hosts.get_mut(worker) {
            pools.remove(&address);
        }
        self.on_pool_lost(address, false);
    }

    /// A pool attempt failed or a live pool broke; once no worker has a
    /// pool left to the host, the host is down and reconnection starts.
    fn on_pool_lost(&mut self, address: SocketAddr, is_critical_failure: bool) {
        if self.pool_hosts.iter().any(|pools| pools.contains(&address)) {
            return;
        }
        let Some(host) = self.shared.registry.get(address, false) else {
            return;
        };
        if host.state() != HostState::Down {
            host.set_state(HostState::Down);
            warn!("[{}] Host is down", address);
            self.shared.policy.get().on_host_down(&host);
        }
        self.schedule_reconnect(address, is_critical_failure);
    }

    // -----------------------------------------------------------------
    // Reconnection
    // -----------------------------------------------------------------

    fn schedule_reconnect(&mut self, address: SocketAddr, is_critical_failure: bool) {
        if !self.reconnect_pending.insert(address) {
            return;
        }
        let policy = if is_critical_failure {
            self.shared.config.critical_reconnect_policy.clone()
        } else {
            self.shared.config.reconnect_policy.clone()
        };
        let delay = self
            .reconnect_schedules
            .entry(address)
            .or_insert_with(|| policy.new_schedule())
            .next_delay();
        debug!("[{}] Next reconnection attempt in {:?}", address, delay);
        let events = self.shared.events.clone();
        spawn_local(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(SessionEvent::Reconnect { address });
        });
    }

    fn on_reconnect(&mut self, address: SocketAddr) {
        self.reconnect_pending.remove(&address);
        if self.connect.is_some() {
            return;
        }
        let Some(host) = self.shared.registry.get(address, false) else {
            self.reconnect_schedules.remove(&address);
            return;
        };
        if host.is_up() {
            self.reconnect_schedules.remove(&address);
            return;
        }
        debug!("[{}] Attempting to reconnect", address);
        self.add_pools_for_host(&host);
    }

    // -----------------------------------------------------------------
    // Request routing
    // -----------------------------------------------------------------

    fn dispatch_requests(&mut self) {
        for request in self.shared.queue.drain() {
            self.route(request);
        }
    }

    fn route(&mut self, request: PendingRequest) {
        if !self.shared.is_connected() {
            request.resolver.fail(RequestError::NoHostsAvailable);
            return;
        }
        let policy = self.shared.policy.get();
        let info = RoutingInfo {
            keyspace: request.keyspace.as_deref(),
        };
        let plan = policy.plan(&info, &self.shared.registry);

        let mut pending = request;
        for host in plan {
            let Some(worker) = self.pick_worker(host.address()) else {
                continue;
            };
            match self.workers[worker].send(WorkerCommand::Execute {
                request: pending,
                host,
            }) {
                Ok(()) => return,
                Err(WorkerCommand::Execute { request, .. }) => pending = request,
                Err(_) => return,
            }
        }
        pending.resolver.fail(RequestError::NoHostsAvailable);
    }

    /// Round-robins over the workers holding a live pool to the host.
    /// The cursor keeps advancing across calls so consecutive requests
    /// spread over the pool even when they target the same host.
    fn pick_worker(&mut self, address: SocketAddr) -> Option<usize> {
        let count = self.workers.len();
        for _ in 0..count {
            let worker = self.current_worker % count;
            self.current_worker = self.current_worker.wrapping_add(1);
            if self.pool_hosts[worker].contains(&address) {
                return Some(worker);
            }
        }
        None
    }

    // -----------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------

    fn begin_close(&mut self) {
        info!("Session close requested");
        if let Some(connect) = self.connect.take() {
            connect.resolver.fail(NewSessionError::SessionClosing);
        }
        self.control_token.cancel();
    }

    fn shutdown(mut self, close_resolver: Option<CloseResolver>) {
        // The queue is closed by `Session::close` before the close event
        // is sent, so this backlog is final.
        for request in self.shared.queue.close() {
            request.resolver.fail(RequestError::SessionClosing);
        }
        self.shutdown_workers();
        if let Some(resolver) = close_resolver {
            resolver.resolve();
        }
        debug!("Session event loop stopped");
    }

    fn shutdown_workers(&mut self) {
        for worker in &self.workers {
            let _ = worker.send(WorkerCommand::Shutdown);
        }
        for worker in &mut self.workers {
            debug!("Waiting for worker {} to stop", worker.index());
            worker.join();
        }
        self.workers.clear();
        self.pool_hosts.clear();
        self.pool_opening.clear();
    }
}
