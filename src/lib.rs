//! Session orchestration core for a CQL-compatible cluster driver.
//!
//! This crate contains the threading and cluster-state machinery of a
//! database driver: the [`Session`] and its event loop, the worker pool
//! executing requests over per-worker connection pools, the host
//! registry with its reconciliation marks, pluggable
//! [load balancing](policies::load_balancing) and
//! [reconnection](policies::reconnect) policies, and the blocking
//! futures that bridge the driver's internal threads and application
//! code.
//!
//! The protocol layer is deliberately absent. Framing, handshakes and
//! statement serialization plug in through two seams:
//!
//! * [`ConnectionFactory`](network::connection::ConnectionFactory) opens
//!   the data-plane connections workers execute requests on, and
//! * [`ControlConnection`](cluster::control::ControlConnection) supplies
//!   cluster topology and host status notifications.
//!
//! # Threading model
//!
//! A session runs one dedicated event-loop thread plus a configurable
//! number of worker threads. All cluster state transitions are applied
//! on the event-loop thread, which keeps them totally ordered without
//! coarse locking; workers own their connections outright and never
//! share them. Application threads interact with the session only
//! through the cross-thread request queue and the blocking futures in
//! [`session::future`].
//!
//! # Connecting and executing
//!
//! ```ignore
//! let mut config = SessionConfig::new(connection_factory, control_connection);
//! config.add_known_node("db1.example.com:9042");
//! config.worker_count = 4;
//!
//! let session = Session::new(config)
//!     .connect(Some("store"))
//!     .take_session()
//!     .unwrap()?;
//!
//! let future = session.execute(&Statement::new(payload));
//! let response = future.take_result().unwrap()?;
//!
//! session.close().wait();
//! ```
//!
//! A dropped, unconsumed [`ConnectFuture`](session::future::ConnectFuture)
//! closes the session it carries, so a half-connected session can never
//! leak its threads.

pub mod cluster;
pub mod config;
pub mod errors;
pub mod network;
pub mod policies;
pub mod session;
pub mod statement;

pub use cluster::host::{Host, HostRegistry, HostState};
pub use cluster::resolve::KnownNode;
pub use config::SessionConfig;
pub use errors::{ConnectionError, NewSessionError, RequestError};
pub use session::future::{CloseFuture, ConnectFuture, RequestFuture};
pub use session::Session;
pub use statement::Statement;
