//! One-shot cross-thread result cells.
//!
//! Futures bridge the session's internal event loops and application
//! threads: the loop resolves them, application threads block in
//! [`wait`](RequestFuture::wait) / [`wait_for`](RequestFuture::wait_for)
//! until they do. Each future is an explicit state machine guarded by a
//! mutex/condvar pair, with a take-at-most-once result transfer.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::errors::{NewSessionError, RequestError};
use crate::network::connection::ResponsePayload;
use crate::session::Session;

// ---------------------------------------------------------------------
// Request futures
// ---------------------------------------------------------------------

#[derive(Debug)]
enum RequestState {
    Pending,
    Complete(ResponsePayload),
    Failed(RequestError),
    Taken,
}

#[derive(Debug)]
struct RequestShared {
    state: Mutex<RequestState>,
    cond: Condvar,
}

impl RequestShared {
    fn transition(&self, next: RequestState) {
        let mut state = self.state.lock();
        if matches!(*state, RequestState::Pending) {
            *state = next;
            self.cond.notify_all();
        }
    }
}

/// Future of a single `execute` / `prepare` request.
#[derive(Debug)]
pub struct RequestFuture {
    shared: Arc<RequestShared>,
}

impl RequestFuture {
    pub(crate) fn new() -> (RequestFuture, RequestResolver) {
        let shared = Arc::new(RequestShared {
            state: Mutex::new(RequestState::Pending),
            cond: Condvar::new(),
        });
        (
            RequestFuture {
                shared: shared.clone(),
            },
            RequestResolver { shared },
        )
    }

    /// Blocks the calling thread until the request completes or fails.
    pub fn wait(&self) {
        let mut state = self.shared.state.lock();
        while matches!(*state, RequestState::Pending) {
            self.shared.cond.wait(&mut state);
        }
    }

    /// Blocks for at most `timeout`. Returns whether the request
    /// completed within the bound; a timeout does not cancel it and a
    /// later `wait`/`wait_for` will still observe the real outcome.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while matches!(*state, RequestState::Pending) {
            if self.shared.cond.wait_until(&mut state, deadline).timed_out() {
                return !matches!(*state, RequestState::Pending);
            }
        }
        true
    }

    /// Whether the request already completed or failed.
    pub fn is_complete(&self) -> bool {
        !matches!(*self.shared.state.lock(), RequestState::Pending)
    }

    /// Waits for completion and transfers the result out. Returns `None`
    /// if the result was already taken.
    pub fn take_result(&self) -> Option<Result<ResponsePayload, RequestError>> {
        self.wait();
        let mut state = self.shared.state.lock();
        match std::mem::replace(&mut *state, RequestState::Taken) {
            RequestState::Complete(response) => Some(Ok(response)),
            RequestState::Failed(error) => Some(Err(error)),
            RequestState::Taken => None,
            RequestState::Pending => unreachable!("wait() returned while pending"),
        }
    }
}

/// Resolving side of a [`RequestFuture`], held by the session core.
///
/// Dropping an unresolved resolver fails the future with a
/// session-closing error, so no request is ever left pending.
#[derive(Debug)]
pub(crate) struct RequestResolver {
    shared: Arc<RequestShared>,
}

impl RequestResolver {
    pub(crate) fn resolve(self, response: ResponsePayload) {
        self.shared.transition(RequestState::Complete(response));
    }

    pub(crate) fn fail(self, error: RequestError) {
        self.shared.transition(RequestState::Failed(error));
    }
}

impl Drop for RequestResolver {
    fn drop(&mut self) {
        self.shared
            .transition(RequestState::Failed(RequestError::SessionClosing));
    }
}

// ---------------------------------------------------------------------
// Connect future
// ---------------------------------------------------------------------

enum ConnectState {
    Pending {
        session: Session,
    },
    Complete {
        session: Session,
    },
    Failed {
        // A connect that got far enough to have a running event loop
        // still carries the session, so cleanup can close it.
        session: Option<Session>,
        error: NewSessionError,
    },
    Taken,
}

struct ConnectShared {
    state: Mutex<ConnectState>,
    cond: Condvar,
}

/// Future of a session-level connect.
///
/// The future owns the connecting [`Session`] until the result is taken.
/// Dropping it unconsumed closes the session and synchronously waits for
/// the close, so no event-loop thread or connection can leak.
pub struct ConnectFuture {
    shared: Arc<ConnectShared>,
}

impl std::fmt::Debug for ConnectFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ConnectFuture")
    }
}

impl ConnectFuture {
    pub(crate) fn new(session: Session) -> (ConnectFuture, ConnectResolver) {
        let shared = Arc::new(ConnectShared {
            state: Mutex::new(ConnectState::Pending { session }),
            cond: Condvar::new(),
        });
        (
            ConnectFuture {
                shared: shared.clone(),
            },
            ConnectResolver { shared },
        )
    }

    /// A connect rejected up front (e.g. another connect is in flight).
    pub(crate) fn failed(error: NewSessionError) -> ConnectFuture {
        ConnectFuture {
            shared: Arc::new(ConnectShared {
                state: Mutex::new(ConnectState::Failed {
                    session: None,
                    error,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Blocks the calling thread until the connect completes or fails.
    pub fn wait(&self) {
        let mut state = self.shared.state.lock();
        while matches!(*state, ConnectState::Pending { .. }) {
            self.shared.cond.wait(&mut state);
        }
    }

    /// Blocks for at most `timeout`. Returns whether the connect
    /// finished within the bound; a timeout does not cancel it.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while matches!(*state, ConnectState::Pending { .. }) {
            if self.shared.cond.wait_until(&mut state, deadline).timed_out() {
                return !matches!(*state, ConnectState::Pending { .. });
            }
        }
        true
    }

    /// Whether the connect already completed or failed.
    pub fn is_complete(&self) -> bool {
        !matches!(*self.shared.state.lock(), ConnectState::Pending { .. })
    }

    /// Waits for completion and transfers ownership of the connected
    /// session out. Returns `None` if the result was already taken.
    ///
    /// If the connect failed, the half-connected session is closed and
    /// the close is waited for before the error is reported, so nothing
    /// keeps running behind a failed connect.
    pub fn take_session(&self) -> Option<Result<Session, NewSessionError>> {
        self.wait();
        let mut state = self.shared.state.lock();
        match std::mem::replace(&mut *state, ConnectState::Taken) {
            ConnectState::Complete { session } => Some(Ok(session)),
            ConnectState::Failed { session, error } => {
                drop(state);
                if let Some(session) = session {
                    session.close().wait();
                }
                Some(Err(error))
            }
            ConnectState::Taken => None,
            ConnectState::Pending { .. } => unreachable!("wait() returned while pending"),
        }
    }
}

impl Drop for ConnectFuture {
    fn drop(&mut self) {
        // The future was dropped before anyone obtained the session.
        if let Some(Ok(session)) = self.take_session() {
            session.close().wait();
        }
    }
}

/// Resolving side of a [`ConnectFuture`], held by the session event loop.
pub(crate) struct ConnectResolver {
    shared: Arc<ConnectShared>,
}

impl std::fmt::Debug for ConnectResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ConnectResolver")
    }
}

impl ConnectResolver {
    fn transition(&self, to_failed: Option<NewSessionError>) {
        let mut state = self.shared.state.lock();
        if let ConnectState::Pending { .. } = &*state {
            let ConnectState::Pending { session } =
                std::mem::replace(&mut *state, ConnectState::Taken)
            else {
                unreachable!()
            };
            *state = match to_failed {
                None => ConnectState::Complete { session },
                Some(error) => ConnectState::Failed {
                    session: Some(session),
                    error,
                },
            };
            self.shared.cond.notify_all();
        }
    }

    pub(crate) fn resolve(self) {
        self.transition(None);
    }

    pub(crate) fn fail(self, error: NewSessionError) {
        self.transition(Some(error));
    }
}

impl Drop for ConnectResolver {
    fn drop(&mut self) {
        self.transition(Some(NewSessionError::SessionClosing));
    }
}

// ---------------------------------------------------------------------
// Close future
// ---------------------------------------------------------------------

struct CloseState {
    done: bool,
    // Joined exactly once, by whichever waiter observes completion
    // first; guarded by the same lock as the result state.
    thread: Option<JoinHandle<()>>,
}

struct CloseShared {
    state: Mutex<CloseState>,
    cond: Condvar,
}

/// Future of a session close.
///
/// Cloneable: every holder observes the same eventual completion. The
/// session's event-loop thread is joined exactly once, by the first
/// waiter that sees the close finish.
#[derive(Clone)]
pub struct CloseFuture {
    shared: Arc<CloseShared>,
}

impl std::fmt::Debug for CloseFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CloseFuture")
    }
}

impl CloseFuture {
    pub(crate) fn new(thread: Option<JoinHandle<()>>) -> (CloseFuture, CloseResolver) {
        let shared = Arc::new(CloseShared {
            state: Mutex::new(CloseState {
                done: false,
                thread,
            }),
            cond: Condvar::new(),
        });
        (
            CloseFuture {
                shared: shared.clone(),
            },
            CloseResolver { shared },
        )
    }

    /// A close that has nothing to stop (the event loop never ran).
    pub(crate) fn resolved() -> CloseFuture {
        CloseFuture {
            shared: Arc::new(CloseShared {
                state: Mutex::new(CloseState {
                    done: true,
                    thread: None,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Blocks until the session is fully closed and its event-loop
    /// thread has been joined.
    pub fn wait(&self) {
        let mut state = self.shared.state.lock();
        while !state.done {
            self.shared.cond.wait(&mut state);
        }
        if let Some(thread) = state.thread.take() {
            let _ = thread.join();
        }
    }

    /// Bounded [`wait`](Self::wait). Returns whether the close finished
    /// within the bound.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while !state.done {
            if self.shared.cond.wait_until(&mut state, deadline).timed_out() && !state.done {
                return false;
            }
        }
        if let Some(thread) = state.thread.take() {
            let _ = thread.join();
        }
        true
    }
}

/// Resolving side of a [`CloseFuture`], held by the session event loop.
pub(crate) struct CloseResolver {
    shared: Arc<CloseShared>,
}

impl std::fmt::Debug for CloseResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CloseResolver")
    }
}

impl CloseResolver {
    pub(crate) fn resolve(self) {
        self.shared.mark_done();
    }
}

impl CloseShared {
    fn mark_done(&self) {
        let mut state = self.state.lock();
        if !state.done {
            state.done = true;
            self.cond.notify_all();
        }
    }
}

impl Drop for CloseResolver {
    fn drop(&mut self) {
        // Wake waiters even if the event loop bailed out abnormally.
        self.shared.mark_done();
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use assert_matches::assert_matches;
    use bytes::Bytes;

    use super::*;

    fn response(text: &str) -> ResponsePayload {
        ResponsePayload(Bytes::copy_from_slice(text.as_bytes()))
    }

    #[test]
    fn wait_for_times_out_then_wait_sees_the_result() {
        let (future, resolver) = RequestFuture::new();
        assert!(!future.wait_for(Duration::from_millis(50)));

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            resolver.resolve(response("done"));
        });

        future.wait();
        assert_matches!(future.take_result(), Some(Ok(r)) if r == response("done"));
        handle.join().unwrap();
    }

    #[test]
    fn take_result_transfers_at_most_once() {
        let (future, resolver) = RequestFuture::new();
        resolver.resolve(response("once"));
        assert_matches!(future.take_result(), Some(Ok(_)));
        assert_matches!(future.take_result(), None);
    }

    #[test]
    fn dropped_resolver_fails_the_future() {
        let (future, resolver) = RequestFuture::new();
        drop(resolver);
        assert_matches!(
            future.take_result(),
            Some(Err(RequestError::SessionClosing))
        );
    }

    #[test]
    fn failure_wins_over_late_timeout() {
        let (future, resolver) = RequestFuture::new();
        resolver.fail(RequestError::NoHostsAvailable);
        assert!(future.wait_for(Duration::from_millis(10)));
        assert_matches!(
            future.take_result(),
            Some(Err(RequestError::NoHostsAvailable))
        );
    }

    #[test]
    fn many_waiters_all_wake() {
        let (future, resolver) = RequestFuture::new();
        let future = Arc::new(future);
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let future = future.clone();
                thread::spawn(move || future.wait_for(Duration::from_secs(5)))
            })
            .collect();
        resolver.resolve(response("all"));
        for waiter in waiters {
            assert!(waiter.join().unwrap());
        }
    }

    #[test]
    fn close_future_clones_observe_one_completion() {
        let (future, resolver) = CloseFuture::new(None);
        let second = future.clone();
        assert!(!future.wait_for(Duration::from_millis(20)));
        resolver.resolve();
        assert!(future.wait_for(Duration::from_secs(1)));
        second.wait();
    }

    #[test]
    fn close_future_joins_the_thread_exactly_once() {
        let thread = thread::spawn(|| {});
        let (future, resolver) = CloseFuture::new(Some(thread));
        let second = future.clone();
        resolver.resolve();
        future.wait();
        // The handle is gone; a second wait must not try to join again.
        second.wait();
    }
}
