//! Control connection seam.
//!
//! The control connection itself, with its metadata queries and server
//! event parsing, lives outside this crate. The session runs one
//! implementation of [`ControlConnection`] on its own event loop and
//! consumes its notifications through [`ControlHandle`].

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::session::event::SessionEvent;

/// Dedicated cluster-metadata connection driven by the session.
#[async_trait]
pub trait ControlConnection: Send + Sync + fmt::Debug {
    /// Runs the control connection until shutdown is requested.
    ///
    /// Implementations dial one of [`ControlHandle::contact_points`],
    /// perform the initial topology fetch by calling
    /// [`ControlHandle::on_add`] for every discovered host followed by
    /// [`ControlHandle::on_ready`] (or [`ControlHandle::on_error`] on
    /// failure), then keep reporting topology and status changes until
    /// [`ControlHandle::cancelled`] resolves.
    async fn run(self: Arc<Self>, handle: ControlHandle);
}

/// Callback surface the control connection uses to report into the
/// session event loop.
///
/// All notification methods are non-blocking and may be called from any
/// thread; they marshal the event onto the session event loop. Events
/// arriving after the session shut down are silently dropped.
#[derive(Clone)]
pub struct ControlHandle {
    events: UnboundedSender<SessionEvent>,
    shutdown: CancellationToken,
    contact_points: Arc<[SocketAddr]>,
}

impl fmt::Debug for ControlHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlHandle")
            .field("contact_points", &self.contact_points)
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl ControlHandle {
    pub(crate) fn new(
        events: UnboundedSender<SessionEvent>,
        shutdown: CancellationToken,
        contact_points: Arc<[SocketAddr]>,
    ) -> Self {
        ControlHandle {
            events,
            shutdown,
            contact_points,
        }
    }

    /// Addresses the control connection should try to dial, in order.
    pub fn contact_points(&self) -> &[SocketAddr] {
        &self.contact_points
    }

    /// The initial topology fetch completed; the session may bring up its
    /// worker pool.
    pub fn on_ready(&self) {
        let _ = self.events.send(SessionEvent::ControlReady);
    }

    /// The control connection failed. During connect this aborts the
    /// whole attempt; afterwards it is absorbed into host state.
    pub fn on_error(&self, code: u16, message: impl Into<String>) {
        let _ = self.events.send(SessionEvent::ControlError {
            code,
            message: message.into(),
        });
    }

    /// The control connection shut down.
    pub fn on_closed(&self) {
        let _ = self.events.send(SessionEvent::ControlClosed);
    }

    /// A host joined the cluster (or was seen in the initial topology
    /// fetch, with `is_initial_connection` set).
    pub fn on_add(&self, address: SocketAddr, is_initial_connection: bool) {
        let _ = self.events.send(SessionEvent::HostAdd {
            address,
            is_initial_connection,
        });
    }

    /// A host left the cluster.
    pub fn on_remove(&self, address: SocketAddr) {
        let _ = self.events.send(SessionEvent::HostRemove { address });
    }

    /// A host became reachable again.
    pub fn on_up(&self, address: SocketAddr) {
        let _ = self.events.send(SessionEvent::HostUp { address });
    }

    /// A host became unreachable. With `is_critical_failure` the session
    /// fails all requests already routed to it instead of letting them
    /// run into timeouts, and reconnects on the accelerated schedule.
    pub fn on_down(&self, address: SocketAddr, is_critical_failure: bool) {
        let _ = self.events.send(SessionEvent::HostDown {
            address,
            is_critical_failure,
        });
    }

    /// Resolves once the session asks the control connection to stop.
    pub async fn cancelled(&self) {
        self.shutdown.cancelled().await;
    }

    /// Whether the session asked the control connection to stop.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
