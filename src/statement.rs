//! Statements submitted for execution.
//!
//! Serialization to the wire format is the job of the protocol codec,
//! which is external to this crate; a statement carries the payload the
//! codec produced, plus the hints load balancing policies may use.

use bytes::Bytes;

/// A single pre-serialized statement.
#[derive(Debug, Clone)]
pub struct Statement {
    body: Bytes,
    keyspace: Option<String>,
}

impl Statement {
    /// Creates a statement from a payload produced by the protocol codec.
    pub fn new(body: impl Into<Bytes>) -> Self {
        Statement {
            body: body.into(),
            keyspace: None,
        }
    }

    /// Sets the keyspace hint passed to the load balancing policy.
    pub fn with_keyspace(mut self, keyspace: impl Into<String>) -> Self {
        self.keyspace = Some(keyspace.into());
        self
    }

    /// The serialized payload.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// The keyspace hint, if set.
    pub fn keyspace(&self) -> Option<&str> {
        self.keyspace.as_deref()
    }
}
