//! Worker pool: independent event loops owning shards of connections.
//!
//! Each worker is an OS thread running a current-thread runtime. The
//! session event loop assigns every request to exactly one worker; a
//! worker's connections are never touched from any other thread. Workers
//! report pool establishment and loss back to the session through the
//! session event channel.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::{spawn_local, LocalSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::cluster::host::Host;
use crate::errors::{ConnectionError, RequestError};
use crate::network::connection::{Connection, ConnectionFactory};
use crate::session::channel::PendingRequest;
use crate::session::event::SessionEvent;

#[derive(Debug)]
pub(crate) enum WorkerCommand {
    /// Open a connection pool to the host. Answered with exactly one
    /// `PoolReady` or `PoolError` event (duplicates while an open is in
    /// flight are dropped).
    AddPool { host: Arc<Host> },
    /// Drop the pool; in-flight requests on it are left to finish.
    RemovePool { address: SocketAddr },
    /// Drop the pool and fail its in-flight requests fast (critical
    /// host failure).
    FailPool { address: SocketAddr },
    /// Execute a request against the pool for `host`.
    Execute {
        request: PendingRequest,
        host: Arc<Host>,
    },
    /// Switch current and future connections to the keyspace.
    SetKeyspace { keyspace: String },
    /// Stop the worker loop; in-flight requests fail with a
    /// session-closing error.
    Shutdown,
}

/// Session-side handle to one worker.
#[derive(Debug)]
pub(crate) struct WorkerHandle {
    index: usize,
    commands: UnboundedSender<WorkerCommand>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    /// Spawns a worker thread with its own event loop.
    pub(crate) fn spawn(
        index: usize,
        factory: Arc<dyn ConnectionFactory>,
        events: UnboundedSender<SessionEvent>,
    ) -> std::io::Result<WorkerHandle> {
        let (commands, command_receiver) = unbounded_channel();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let thread = std::thread::Builder::new()
            .name(format!("tidepool-worker-{index}"))
            .spawn(move || {
                let local = LocalSet::new();
                let worker = Worker::new(index, factory, events);
                local.block_on(&runtime, worker.run(command_receiver));
            })?;
        Ok(WorkerHandle {
            index,
            commands,
            thread: Some(thread),
        })
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    /// Hands a command to the worker; gives it back if the worker loop
    /// is gone.
    pub(crate) fn send(&self, command: WorkerCommand) -> Result<(), WorkerCommand> {
        self.commands.send(command).map_err(|rejected| rejected.0)
    }

    /// Joins the worker thread. Callers send `Shutdown` first.
    pub(crate) fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct PoolShard {
    connection: Arc<dyn Connection>,
    cancel: CancellationToken,
}

struct Worker {
    index: usize,
    factory: Arc<dyn ConnectionFactory>,
    events: UnboundedSender<SessionEvent>,
    shards: Rc<RefCell<HashMap<SocketAddr, PoolShard>>>,
    opening: Rc<RefCell<HashSet<SocketAddr>>>,
    keyspace: Rc<RefCell<Option<String>>>,
}

impl Worker {
    fn new(
        index: usize,
        factory: Arc<dyn ConnectionFactory>,
        events: UnboundedSender<SessionEvent>,
    ) -> Self {
        Worker {
            index,
            factory,
            events,
            shards: Rc::new(RefCell::new(HashMap::new())),
            opening: Rc::new(RefCell::new(HashSet::new())),
            keyspace: Rc::new(RefCell::new(None)),
        }
    }

    async fn run(self, mut commands: UnboundedReceiver<WorkerCommand>) {
        debug!("Worker {} started", self.index);
        let _ = self.events.send(SessionEvent::WorkerStarted { worker: self.index });

        while let Some(command) = commands.recv().await {
            match command {
                WorkerCommand::AddPool { host } => self.add_pool(host.address()),
                WorkerCommand::RemovePool { address } => {
                    if self.shards.borrow_mut().remove(&address).is_some() {
                        debug!("[{}] worker {} dropped connection pool", address, self.index);
                    }
                }
                WorkerCommand::FailPool { address } => {
                    if let Some(shard) = self.shards.borrow_mut().remove(&address) {
                        debug!(
                            "[{}] worker {} failing in-flight requests after critical failure",
                            address, self.index
                        );
                        shard.cancel.cancel();
                    }
                }
                WorkerCommand::Execute { request, host } => self.execute(request, &host),
                WorkerCommand::SetKeyspace { keyspace } => self.set_keyspace(keyspace),
                WorkerCommand::Shutdown => break,
            }
        }

        // Dropping the local set cancels outstanding request tasks; their
        // resolvers fail the futures with a session-closing error.
        debug!("Worker {} stopped", self.index);
    }

    fn add_pool(&self, address: SocketAddr) {
        if self.shards.borrow().contains_key(&address) {
            let _ = self.events.send(SessionEvent::PoolReady {
                worker: self.index,
                address,
            });
            return;
        }
        if !self.opening.borrow_mut().insert(address) {
            trace!("[{}] worker {} pool open already in flight", address, self.index);
            return;
        }

        let factory = self.factory.clone();
        let events = self.events.clone();
        let shards = self.shards.clone();
        let opening = self.opening.clone();
        let keyspace = self.keyspace.clone();
        let worker = self.index;
        spawn_local(async move {
            let result = factory.open(address).await;
            opening.borrow_mut().remove(&address);
            match result {
                Ok(connection) => {
                    let current_keyspace = keyspace.borrow().clone();
                    if let Some(name) = current_keyspace {
                        if let Err(error) = connection.set_keyspace(&name).await {
                            warn!("[{}] failed to set keyspace on new connection: {}", address, error);
                            let _ = events.send(SessionEvent::PoolError {
                                worker,
                                address,
                                error,
                            });
                            return;
                        }
                    }
                    shards.borrow_mut().insert(
                        address,
                        PoolShard {
                            connection,
                            cancel: CancellationToken::new(),
                        },
                    );
                    debug!("[{}] worker {} opened connection pool", address, worker);
                    let _ = events.send(SessionEvent::PoolReady { worker, address });
                }
                Err(error) => {
                    debug!("[{}] worker {} failed to connect: {}", address, worker, error);
                    let _ = events.send(SessionEvent::PoolError {
                        worker,
                        address,
                        error,
                    });
                }
            }
        });
    }

    fn execute(&self, request: PendingRequest, host: &Arc<Host>) {
        let address = host.address();
        let Some((connection, cancel)) = self
            .shards
            .borrow()
            .get(&address)
            .map(|shard| (shard.connection.clone(), shard.cancel.clone()))
        else {
            // The pool vanished between assignment and delivery.
            request.resolver.fail(RequestError::NoHostsAvailable);
            return;
        };

        let PendingRequest {
            payload, resolver, ..
        } = request;
        let events = self.events.clone();
        let shards = self.shards.clone();
        let worker = self.index;
        spawn_local(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    resolver.fail(RequestError::HostCriticalFailure(address));
                }
                result = connection.request(&payload) => {
                    match result {
                        Ok(response) => resolver.resolve(response),
                        Err(error) => {
                            let broken = matches!(error, ConnectionError::Io(_));
                            resolver.fail(RequestError::Connection(error));
                            if broken && shards.borrow_mut().remove(&address).is_some() {
                                let _ = events.send(SessionEvent::PoolClosed { worker, address });
                            }
                        }
                    }
                }
            }
        });
    }

    fn set_keyspace(&self, name: String) {
        *self.keyspace.borrow_mut() = Some(name.clone());
        let connections: Vec<(SocketAddr, Arc<dyn Connection>)> = self
            .shards
            .borrow()
            .iter()
            .map(|(address, shard)| (*address, shard.connection.clone()))
            .collect();
        for (address, connection) in connections {
            let name = name.clone();
            spawn_local(async move {
                if let Err(error) = connection.set_keyspace(&name).await {
                    // The keyspace sticks for future connections; a
                    // broken one will surface on its next request.
                    warn!("[{}] failed to switch keyspace: {}", address, error);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use bytes::Bytes;

    use super::*;
    use crate::cluster::host::HostRegistry;
    use crate::network::connection::{RequestKind, RequestPayload, ResponsePayload};
    use crate::session::future::{RequestFuture, RequestResolver};

    #[derive(Debug)]
    struct EchoConnection {
        delay: Option<Duration>,
    }

    #[async_trait]
    impl Connection for EchoConnection {
        async fn request(
            &self,
            request: &RequestPayload,
        ) -> Result<ResponsePayload, ConnectionError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            Ok(ResponsePayload(request.body.clone()))
        }

        async fn set_keyspace(&self, _keyspace: &str) -> Result<(), ConnectionError> {
            Ok(())
        }
    }

    #[derive(Debug)]
    struct EchoFactory {
        delay: Option<Duration>,
        refuse: bool,
        opened: AtomicUsize,
    }

    impl EchoFactory {
        fn new() -> Self {
            EchoFactory {
                delay: None,
                refuse: false,
                opened: AtomicUsize::new(0),
            }
        }

        fn slow(delay: Duration) -> Self {
            EchoFactory {
                delay: Some(delay),
                ..Self::new()
            }
        }

        fn refusing() -> Self {
            EchoFactory {
                refuse: true,
                ..Self::new()
            }
        }
    }

    #[async_trait]
    impl ConnectionFactory for EchoFactory {
        async fn open(
            &self,
            _address: SocketAddr,
        ) -> Result<Arc<dyn Connection>, ConnectionError> {
            if self.refuse {
                return Err(ConnectionError::Protocol("connection refused".into()));
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(EchoConnection { delay: self.delay }))
        }
    }

    struct WorkerFixture {
        handle: WorkerHandle,
        events: UnboundedReceiver<SessionEvent>,
        host: Arc<Host>,
    }

    fn fixture(factory: EchoFactory) -> WorkerFixture {
        let (events_tx, events) = unbounded_channel();
        let handle = WorkerHandle::spawn(0, Arc::new(factory), events_tx).unwrap();
        let registry = HostRegistry::new();
        let (host, _) = registry.add(SocketAddr::from(([10, 0, 0, 1], 9042)), true);
        WorkerFixture {
            handle,
            events,
            host,
        }
    }

    fn pending(tag: &str) -> (PendingRequest, RequestFuture) {
        let (future, resolver): (RequestFuture, RequestResolver) = RequestFuture::new();
        (
            PendingRequest {
                payload: RequestPayload {
                    kind: RequestKind::Query,
                    body: Bytes::copy_from_slice(tag.as_bytes()),
                },
                keyspace: None,
                resolver,
            },
            future,
        )
    }

    impl WorkerFixture {
        fn shutdown(mut self) {
            let _ = self.handle.send(WorkerCommand::Shutdown);
            self.handle.join();
        }
    }

    #[test]
    #[ntest::timeout(10000)]
    fn add_pool_then_execute_round_trips() {
        let mut fx = fixture(EchoFactory::new());
        assert_matches!(
            fx.events.blocking_recv(),
            Some(SessionEvent::WorkerStarted { worker: 0 })
        );

        fx.handle
            .send(WorkerCommand::AddPool {
                host: fx.host.clone(),
            })
            .unwrap();
        assert_matches!(
            fx.events.blocking_recv(),
            Some(SessionEvent::PoolReady { worker: 0, .. })
        );

        let (request, future) = pending("ping");
        fx.handle
            .send(WorkerCommand::Execute {
                request,
                host: fx.host.clone(),
            })
            .unwrap();
        assert_matches!(
            future.take_result(),
            Some(Ok(ResponsePayload(body))) if body == Bytes::from_static(b"ping")
        );

        fx.shutdown();
    }

    #[test]
    #[ntest::timeout(10000)]
    fn factory_failure_reports_pool_error() {
        let mut fx = fixture(EchoFactory::refusing());
        assert_matches!(
            fx.events.blocking_recv(),
            Some(SessionEvent::WorkerStarted { .. })
        );
        fx.handle
            .send(WorkerCommand::AddPool {
                host: fx.host.clone(),
            })
            .unwrap();
        assert_matches!(
            fx.events.blocking_recv(),
            Some(SessionEvent::PoolError { worker: 0, .. })
        );
        fx.shutdown();
    }

    #[test]
    #[ntest::timeout(10000)]
    fn fail_pool_cancels_in_flight_requests() {
        let mut fx = fixture(EchoFactory::slow(Duration::from_secs(60)));
        assert_matches!(
            fx.events.blocking_recv(),
            Some(SessionEvent::WorkerStarted { .. })
        );
        fx.handle
            .send(WorkerCommand::AddPool {
                host: fx.host.clone(),
            })
            .unwrap();
        assert_matches!(
            fx.events.blocking_recv(),
            Some(SessionEvent::PoolReady { .. })
        );

        let (request, future) = pending("stuck");
        fx.handle
            .send(WorkerCommand::Execute {
                request,
                host: fx.host.clone(),
            })
            .unwrap();
        fx.handle
            .send(WorkerCommand::FailPool {
                address: fx.host.address(),
            })
            .unwrap();

        assert!(future.wait_for(Duration::from_secs(5)));
        assert_matches!(
            future.take_result(),
            Some(Err(RequestError::HostCriticalFailure(_)))
        );
        fx.shutdown();
    }

    #[test]
    #[ntest::timeout(10000)]
    fn shutdown_fails_in_flight_requests() {
        let mut fx = fixture(EchoFactory::slow(Duration::from_secs(60)));
        assert_matches!(
            fx.events.blocking_recv(),
            Some(SessionEvent::WorkerStarted { .. })
        );
        fx.handle
            .send(WorkerCommand::AddPool {
                host: fx.host.clone(),
            })
            .unwrap();
        assert_matches!(
            fx.events.blocking_recv(),
            Some(SessionEvent::PoolReady { .. })
        );

        let (request, future) = pending("stuck");
        fx.handle
            .send(WorkerCommand::Execute {
                request,
                host: fx.host.clone(),
            })
            .unwrap();
        fx.shutdown();

        assert_matches!(
            future.take_result(),
            Some(Err(RequestError::SessionClosing))
        );
    }

    #[test]
    #[ntest::timeout(10000)]
    fn execute_without_pool_fails_fast() {
        let mut fx = fixture(EchoFactory::new());
        assert_matches!(
            fx.events.blocking_recv(),
            Some(SessionEvent::WorkerStarted { .. })
        );
        let (request, future) = pending("nowhere");
        fx.handle
            .send(WorkerCommand::Execute {
                request,
                host: fx.host.clone(),
            })
            .unwrap();
        assert_matches!(
            future.take_result(),
            Some(Err(RequestError::NoHostsAvailable))
        );
        fx.shutdown();
    }
}
