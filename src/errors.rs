//! Error types reported through session and request futures.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;

/// Error that occurred during session initialization or connect.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum NewSessionError {
    /// List of contact points passed in the session config is empty.
    /// There needs to be at least one node to connect to.
    #[error("Empty contact point list")]
    EmptyContactPoints,

    /// Failed to resolve any of the hostnames passed as contact points.
    #[error("Couldn't resolve any hostname: {0:?}")]
    FailedToResolveAnyHostname(Vec<String>),

    /// A session-level connect was requested while another one is still
    /// in flight. Only one connect may be outstanding at a time.
    #[error("Session connect already in progress")]
    AlreadyConnecting,

    /// `Session::init` was called more than once.
    #[error("Session event loop is already running")]
    AlreadyInitialized,

    /// The control connection reported an error during connect.
    #[error("Control connection error {code}: {message}")]
    ControlConnection {
        /// Protocol- or implementation-defined error code.
        code: u16,
        /// Human-readable description reported by the control connection.
        message: String,
    },

    /// No connection pool could be established to any discovered host.
    #[error("Unable to connect to any cluster host")]
    NoHostsAvailable,

    /// The session was closed while the operation was in flight.
    #[error("Session is closing")]
    SessionClosing,

    /// Failed to spawn the session event-loop thread or build its runtime.
    #[error("Failed to start the session event loop: {0}")]
    InitThread(Arc<std::io::Error>),
}

/// Error that resolved a single request's future.
///
/// Per-request errors are local: they never tear down the session.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum RequestError {
    /// The load balancing policy produced no viable host, or no worker
    /// holds a live connection to any candidate.
    #[error("No hosts available for the request")]
    NoHostsAvailable,

    /// The session started closing before the request completed.
    #[error("Session is closing")]
    SessionClosing,

    /// The host the request was routed to reported a critical failure;
    /// the request was failed fast instead of awaiting a timeout.
    #[error("Host {0} reported a critical failure")]
    HostCriticalFailure(SocketAddr),

    /// The connection executing the request reported an error.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Error reported by a connection or a connection factory.
///
/// Produced by [`Connection`](crate::network::connection::Connection) and
/// [`ConnectionFactory`](crate::network::connection::ConnectionFactory)
/// implementations, which live outside this crate.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionError {
    /// Input/output error, connection broken etc. A worker drops the
    /// affected connection when it sees this.
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    /// The protocol layer rejected the request or the response.
    #[error("Protocol Error: {0}")]
    Protocol(String),

    /// The connection attempt did not complete in time.
    #[error("Connect timeout")]
    Timeout,
}

impl From<std::io::Error> for ConnectionError {
    fn from(err: std::io::Error) -> Self {
        ConnectionError::Io(Arc::new(err))
    }
}
