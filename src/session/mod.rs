//! `Session` holds the client's cluster connections and the event loop
//! that drives them.
//!
//! The session core is split across three kinds of threads:
//!
//! * application threads, which enqueue requests and block on futures,
//! * the single session event-loop thread, which owns all cluster and
//!   routing state, and
//! * worker threads, each owning a shard of connection pools.
//!
//! All state transitions flow through the event loop, which is what
//! keeps them totally ordered without any wide locks.

pub(crate) mod channel;
pub(crate) mod event;
pub mod future;
mod worker;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::LocalSet;
use tracing::debug;

use crate::cluster::host::{Host, HostRegistry};
use crate::config::SessionConfig;
use crate::errors::{NewSessionError, RequestError};
use crate::network::connection::{RequestKind, RequestPayload};
use crate::policies::load_balancing::LoadBalancingPolicy;
use crate::session::channel::{PendingRequest, RequestQueue, RequestWakeup};
use crate::session::event::SessionEvent;
use crate::session::future::{CloseFuture, ConnectFuture, RequestFuture};
use crate::session::worker::SessionWorker;
use crate::statement::Statement;

// Session-level connect state, advanced by compare-and-swap so a second
// connect is rejected synchronously.
const NOT_CONNECTED: u8 = 0;
const CONNECTING: u8 = 1;
const CONNECTED: u8 = 2;

/// Inputs consumed exactly once by the event-loop thread.
#[derive(Debug)]
struct LoopInputs {
    events: UnboundedReceiver<SessionEvent>,
    wakeup: RequestWakeup,
}

/// Hot-swappable load balancing policy.
///
/// `arc-swap` needs a sized pointee, so the trait object sits one level
/// down behind a sized slot.
#[derive(Debug)]
pub(crate) struct PolicyCell {
    slot: ArcSwap<PolicySlot>,
}

#[derive(Debug)]
struct PolicySlot(Arc<dyn LoadBalancingPolicy>);

impl PolicyCell {
    fn new(policy: Arc<dyn LoadBalancingPolicy>) -> Self {
        PolicyCell {
            slot: ArcSwap::from_pointee(PolicySlot(policy)),
        }
    }

    pub(crate) fn get(&self) -> Arc<dyn LoadBalancingPolicy> {
        self.slot.load().0.clone()
    }

    fn set(&self, policy: Arc<dyn LoadBalancingPolicy>) {
        self.slot.store(Arc::new(PolicySlot(policy)));
    }
}

#[derive(Debug)]
pub(crate) struct SessionShared {
    pub(crate) config: SessionConfig,
    pub(crate) registry: HostRegistry,
    // Empty string means "no keyspace".
    keyspace: Mutex<String>,
    pub(crate) policy: PolicyCell,
    pub(crate) queue: RequestQueue,
    pub(crate) events: UnboundedSender<SessionEvent>,
    loop_inputs: Mutex<Option<LoopInputs>>,
    connect_state: AtomicU8,
    thread: Mutex<Option<JoinHandle<()>>>,
    close_future: Mutex<Option<CloseFuture>>,
}

/// A cluster session: the handle applications use to execute requests.
///
/// Cheaply cloneable; all clones drive the same underlying session. The
/// session stays fully usable from synchronous code: `execute` and
/// `connect` return blocking futures rather than `async` ones.
#[derive(Debug, Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    /// Creates a session in the `NOT_CONNECTED` state. The event loop is
    /// started by [`init`](Self::init) (or lazily by
    /// [`connect`](Self::connect)).
    pub fn new(config: SessionConfig) -> Session {
        let (events, event_receiver) = unbounded_channel();
        let (queue, wakeup) = RequestQueue::new();
        let policy = config.load_balancing_policy.clone();
        Session {
            shared: Arc::new(SessionShared {
                config,
                registry: HostRegistry::new(),
                keyspace: Mutex::new(String::new()),
                policy: PolicyCell::new(policy),
                queue,
                events,
                loop_inputs: Mutex::new(Some(LoopInputs {
                    events: event_receiver,
                    wakeup,
                })),
                connect_state: AtomicU8::new(NOT_CONNECTED),
                thread: Mutex::new(None),
                close_future: Mutex::new(None),
            }),
        }
    }

    /// Starts the session event-loop thread.
    ///
    /// Fails with [`NewSessionError::AlreadyInitialized`] on a second
    /// call and with [`NewSessionError::SessionClosing`] once the
    /// session was closed. Calling this explicitly is optional;
    /// `connect` initializes on demand.
    pub fn init(&self) -> Result<(), NewSessionError> {
        // Serialized with close() through the close_future lock, so a
        // concurrent close cannot slip between the check and the spawn.
        let closing = self.shared.close_future.lock();
        if closing.is_some() {
            return Err(NewSessionError::SessionClosing);
        }
        let mut slot = self.shared.loop_inputs.lock();
        match slot.take() {
            Some(inputs) => self.spawn_event_loop(&mut slot, inputs),
            None => Err(NewSessionError::AlreadyInitialized),
        }
    }

    fn ensure_initialized(&self) -> Result<(), NewSessionError> {
        let closing = self.shared.close_future.lock();
        if closing.is_some() {
            return Err(NewSessionError::SessionClosing);
        }
        let mut slot = self.shared.loop_inputs.lock();
        match slot.take() {
            Some(inputs) => self.spawn_event_loop(&mut slot, inputs),
            None => Ok(()),
        }
    }

    fn spawn_event_loop(
        &self,
        slot: &mut Option<LoopInputs>,
        inputs: LoopInputs,
    ) -> Result<(), NewSessionError> {
        // Built here so a runtime construction error surfaces to the
        // caller instead of dying inside the new thread.
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(error) => {
                *slot = Some(inputs);
                return Err(NewSessionError::InitThread(Arc::new(error)));
            }
        };
        let shared = self.shared.clone();
        let thread = std::thread::Builder::new()
            .name("session-event-loop".to_owned())
            .spawn(move || {
                let local = LocalSet::new();
                let worker = SessionWorker::new(shared, inputs.events, inputs.wakeup);
                local.block_on(&runtime, worker.run());
            })
            .map_err(|error| NewSessionError::InitThread(Arc::new(error)))?;
        *self.shared.thread.lock() = Some(thread);
        Ok(())
    }

    /// Starts the session-level connect protocol: resolve contact
    /// points, bring up the control connection, discover the topology
    /// and open connection pools on every worker.
    ///
    /// The returned future owns the session until its result is taken.
    /// Only one connect may be in flight; a concurrent attempt fails
    /// with [`NewSessionError::AlreadyConnecting`] without disturbing
    /// the first. A closed session fails the connect with
    /// [`NewSessionError::SessionClosing`].
    pub fn connect(&self, keyspace: Option<&str>) -> ConnectFuture {
        if self.shared.config.known_nodes.is_empty() {
            return ConnectFuture::failed(NewSessionError::EmptyContactPoints);
        }
        if let Err(error) = self.ensure_initialized() {
            return ConnectFuture::failed(error);
        }
        if self
            .shared
            .connect_state
            .compare_exchange(NOT_CONNECTED, CONNECTING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return ConnectFuture::failed(NewSessionError::AlreadyConnecting);
        }

        let (future, resolver) = ConnectFuture::new(self.clone());
        debug!("Starting session connect");
        if let Err(rejected) = self.shared.events.send(SessionEvent::Connect {
            keyspace: keyspace.map(str::to_owned),
            resolver,
        }) {
            // The event loop is gone; fail the future it carried.
            if let SessionEvent::Connect { resolver, .. } = rejected.0 {
                resolver.fail(NewSessionError::SessionClosing);
            }
        }
        future
    }

    /// Enqueues a statement for execution and returns its future.
    pub fn execute(&self, statement: &Statement) -> RequestFuture {
        self.submit(RequestKind::Query, statement)
    }

    /// Enqueues a server-side prepare and returns its future.
    pub fn prepare(&self, statement: &Statement) -> RequestFuture {
        self.submit(RequestKind::Prepare, statement)
    }

    fn submit(&self, kind: RequestKind, statement: &Statement) -> RequestFuture {
        let (future, resolver) = RequestFuture::new();
        let keyspace = statement
            .keyspace()
            .map(str::to_owned)
            .or_else(|| self.keyspace());
        let request = PendingRequest {
            payload: RequestPayload {
                kind,
                body: statement.body().clone(),
            },
            keyspace,
            resolver,
        };
        if let Err(rejected) = self.shared.queue.push(request) {
            rejected.resolver.fail(RequestError::SessionClosing);
        }
        future
    }

    /// The keyspace requests execute against by default.
    pub fn keyspace(&self) -> Option<String> {
        let keyspace = self.shared.keyspace.lock();
        if keyspace.is_empty() {
            None
        } else {
            Some(keyspace.clone())
        }
    }

    /// Switches the default keyspace, propagating it to every existing
    /// and future connection. Returns `false` once the session is
    /// closing.
    pub fn set_keyspace(&self, keyspace: impl Into<String>) -> bool {
        let keyspace = keyspace.into();
        *self.shared.keyspace.lock() = keyspace.clone();
        self.shared
            .events
            .send(SessionEvent::SetKeyspace { keyspace })
            .is_ok()
    }

    /// Replaces the load balancing policy. Requests already planned keep
    /// their old plan; every later request uses the new policy.
    pub fn set_load_balancing_policy(&self, policy: Arc<dyn LoadBalancingPolicy>) {
        self.shared.policy.set(policy);
    }

    /// Looks up a host in the registry. With `should_mark` the host is
    /// marked fresh for the current reconciliation pass.
    pub fn get_host(&self, address: SocketAddr, should_mark: bool) -> Option<Arc<Host>> {
        self.shared.registry.get(address, should_mark)
    }

    /// Evicts every host not re-confirmed since the previous purge and
    /// starts the next reconciliation pass. Connection pools to evicted
    /// hosts are torn down asynchronously.
    pub fn purge_hosts(&self) -> Vec<Arc<Host>> {
        let removed = self.shared.registry.purge();
        if !removed.is_empty() {
            let _ = self.shared.events.send(SessionEvent::HostsPurged {
                hosts: removed.clone(),
            });
        }
        removed
    }

    /// A point-in-time copy of all registered hosts.
    pub fn hosts(&self) -> Vec<Arc<Host>> {
        self.shared.registry.snapshot()
    }

    /// Injects a control-connection readiness notification, as if the
    /// control connection reported it. Returns `false` once the event
    /// loop is gone.
    pub fn notify_ready(&self) -> bool {
        self.shared.events.send(SessionEvent::ControlReady).is_ok()
    }

    /// Injects a control-connection closed notification. Returns
    /// `false` once the event loop is gone.
    pub fn notify_closed(&self) -> bool {
        self.shared.events.send(SessionEvent::ControlClosed).is_ok()
    }

    /// Reports a host joining the cluster. Returns `false` once the
    /// event loop is gone.
    pub fn notify_host_add(&self, address: SocketAddr) -> bool {
        self.shared
            .events
            .send(SessionEvent::HostAdd {
                address,
                is_initial_connection: false,
            })
            .is_ok()
    }

    /// Reports a host leaving the cluster. Returns `false` once the
    /// event loop is gone.
    pub fn notify_host_remove(&self, address: SocketAddr) -> bool {
        self.shared
            .events
            .send(SessionEvent::HostRemove { address })
            .is_ok()
    }

    /// Reports a host back up. Returns `false` once the event loop is
    /// gone.
    pub fn notify_host_up(&self, address: SocketAddr) -> bool {
        self.shared
            .events
            .send(SessionEvent::HostUp { address })
            .is_ok()
    }

    /// Reports a host down. With `is_critical_failure`, requests already
    /// routed to the host fail fast and reconnection runs on the
    /// accelerated schedule. Returns `false` once the event loop is
    /// gone.
    pub fn notify_host_down(&self, address: SocketAddr, is_critical_failure: bool) -> bool {
        self.shared
            .events
            .send(SessionEvent::HostDown {
                address,
                is_critical_failure,
            })
            .is_ok()
    }

    /// Starts closing the session and returns a future of the shutdown.
    ///
    /// Idempotent: every call (from any clone, on any thread) returns a
    /// future of the same single shutdown. New requests are rejected
    /// immediately; queued and in-flight ones fail with
    /// [`RequestError::SessionClosing`].
    pub fn close(&self) -> CloseFuture {
        let mut slot = self.shared.close_future.lock();
        if let Some(future) = &*slot {
            return future.clone();
        }

        debug!("Closing session");
        // Stop intake first so the backlog below is final.
        for request in self.shared.queue.close() {
            request.resolver.fail(RequestError::SessionClosing);
        }
        // Dropping unconsumed loop inputs disconnects the event channel:
        // a never-initialized session cannot be started after this point
        // and notifications report the event loop as gone.
        drop(self.shared.loop_inputs.lock().take());

        let thread = self.shared.thread.lock().take();
        let future = match thread {
            // The event loop never ran; there is nothing to stop.
            None => CloseFuture::resolved(),
            Some(thread) => {
                let (future, resolver) = CloseFuture::new(Some(thread));
                // If the loop is already gone the resolver is dropped
                // here, which completes the future; wait() then joins
                // the exited thread.
                let _ = self
                    .shared
                    .events
                    .send(SessionEvent::Close { resolver });
                future
            }
        };
        *slot = Some(future.clone());
        future
    }
}

impl SessionShared {
    pub(crate) fn set_connected(&self) {
        self.connect_state.store(CONNECTED, Ordering::Release);
    }

    pub(crate) fn reset_connect_state(&self) {
        self.connect_state.store(NOT_CONNECTED, Ordering::Release);
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connect_state.load(Ordering::Acquire) == CONNECTED
    }

    pub(crate) fn store_keyspace(&self, keyspace: &str) {
        *self.keyspace.lock() = keyspace.to_owned();
    }

    pub(crate) fn keyspace(&self) -> Option<String> {
        let keyspace = self.keyspace.lock();
        if keyspace.is_empty() {
            None
        } else {
            Some(keyspace.clone())
        }
    }
}
