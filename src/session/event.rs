//! Events marshaled onto the session event loop.
//!
//! Every topology or lifecycle transition travels through this channel,
//! which is what keeps host state changes totally ordered: they are only
//! ever applied on the single session event-loop thread.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::cluster::host::Host;
use crate::errors::ConnectionError;
use crate::session::future::{CloseResolver, ConnectResolver};

#[derive(Debug)]
pub(crate) enum SessionEvent {
    /// Start the session-level connect protocol.
    Connect {
        keyspace: Option<String>,
        resolver: ConnectResolver,
    },
    /// Begin the shutdown protocol; resolved once workers are joined.
    Close { resolver: CloseResolver },

    /// One contact point finished resolving.
    ContactPointResolved {
        address: Option<SocketAddr>,
        hostname: Option<String>,
    },

    // Control-plane inputs (see `cluster::control::ControlHandle`).
    ControlReady,
    ControlClosed,
    ControlError {
        code: u16,
        message: String,
    },
    HostAdd {
        address: SocketAddr,
        is_initial_connection: bool,
    },
    HostRemove {
        address: SocketAddr,
    },
    HostUp {
        address: SocketAddr,
    },
    HostDown {
        address: SocketAddr,
        is_critical_failure: bool,
    },
    /// Hosts evicted by a reconciliation purge; workers must drop their
    /// pools and policies must forget them.
    HostsPurged {
        hosts: Vec<Arc<Host>>,
    },
    /// Apply a new keyspace on the event loop (and on every worker).
    SetKeyspace {
        keyspace: String,
    },

    // Worker pool feedback.
    WorkerStarted {
        worker: usize,
    },
    PoolReady {
        worker: usize,
        address: SocketAddr,
    },
    PoolError {
        worker: usize,
        address: SocketAddr,
        error: ConnectionError,
    },
    PoolClosed {
        worker: usize,
        address: SocketAddr,
    },

    /// A per-host reconnection timer fired.
    Reconnect {
        address: SocketAddr,
    },
}
