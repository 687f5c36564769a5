//! Connection seam.
//!
//! Framing, handshake and authentication live in the protocol layer
//! outside this crate. The worker pool only needs to open connections,
//! send opaque payloads and receive opaque responses.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::errors::ConnectionError;

/// Kind of a request, as understood by the protocol layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Execute a statement.
    Query,
    /// Prepare a statement on the server.
    Prepare,
}

/// Serialized request handed to a connection.
#[derive(Debug, Clone)]
pub struct RequestPayload {
    /// What the payload asks the server to do.
    pub kind: RequestKind,
    /// The serialized body, produced by the external codec.
    pub body: Bytes,
}

/// Opaque response produced by a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponsePayload(pub Bytes);

/// A single live connection to one host.
///
/// A connection is owned by exactly one worker, but implementations must
/// multiplex concurrent requests internally: the worker issues
/// overlapping `request` calls for pipelined execution.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Executes one request and waits for its response.
    async fn request(&self, request: &RequestPayload)
        -> Result<ResponsePayload, ConnectionError>;

    /// Switches the connection to the given keyspace.
    async fn set_keyspace(&self, keyspace: &str) -> Result<(), ConnectionError>;
}

/// Opens connections for the worker pool.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + fmt::Debug {
    /// Opens a connection to `address`, including whatever handshake the
    /// protocol layer requires.
    async fn open(&self, address: SocketAddr) -> Result<Arc<dyn Connection>, ConnectionError>;
}
