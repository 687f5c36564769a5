//! Cross-thread request handoff.
//!
//! Arbitrary application threads enqueue requests; the single session
//! event loop drains them. The storage is a finely-locked deque, paired
//! with an edge-triggered wakeup channel: a wakeup is sent only when the
//! queue transitions from empty to non-empty, so bursts coalesce into
//! one drain pass, and a wakeup racing an already-drained queue is a
//! harmless no-op.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::network::connection::RequestPayload;
use crate::session::future::RequestResolver;

/// One queued unit of work: the serialized payload plus the future that
/// must eventually be resolved or failed.
#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub(crate) payload: RequestPayload,
    pub(crate) keyspace: Option<String>,
    pub(crate) resolver: RequestResolver,
}

#[derive(Debug)]
struct QueueInner {
    items: VecDeque<PendingRequest>,
    closed: bool,
}

/// Multi-producer side of the request channel.
#[derive(Debug)]
pub(crate) struct RequestQueue {
    inner: Mutex<QueueInner>,
    wakeup: UnboundedSender<()>,
}

/// Consumer-side wakeup handle, owned by the session event loop.
#[derive(Debug)]
pub(crate) struct RequestWakeup {
    signal: UnboundedReceiver<()>,
}

impl RequestQueue {
    pub(crate) fn new() -> (RequestQueue, RequestWakeup) {
        let (wakeup, signal) = unbounded_channel();
        (
            RequestQueue {
                inner: Mutex::new(QueueInner {
                    items: VecDeque::new(),
                    closed: false,
                }),
                wakeup,
            },
            RequestWakeup { signal },
        )
    }

    /// Enqueues a request and wakes the consumer if it was idle.
    /// Rejected once the queue is closed, handing the request back so
    /// the caller can fail its future fast.
    pub(crate) fn push(&self, request: PendingRequest) -> Result<(), PendingRequest> {
        let was_empty = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(request);
            }
            let was_empty = inner.items.is_empty();
            inner.items.push_back(request);
            was_empty
        };
        if was_empty {
            // Ignored if the consumer is gone; close() drains then.
            let _ = self.wakeup.send(());
        }
        Ok(())
    }

    /// Takes everything currently queued. Tolerates being called with an
    /// empty queue.
    pub(crate) fn drain(&self) -> Vec<PendingRequest> {
        self.inner.lock().items.drain(..).collect()
    }

    /// Stops intake and returns the backlog. Idempotent; later calls
    /// return whatever raced in, which is nothing once `push` rejects.
    pub(crate) fn close(&self) -> Vec<PendingRequest> {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.items.drain(..).collect()
    }
}

impl RequestWakeup {
    /// Waits until at least one producer signalled new work. Multiple
    /// signals may coalesce into a single return.
    pub(crate) async fn ready(&mut self) {
        if self.signal.recv().await.is_none() {
            // All producers are gone; park forever and let the event
            // loop exit through its shutdown path.
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use assert_matches::assert_matches;
    use bytes::Bytes;

    use super::*;
    use crate::errors::RequestError;
    use crate::network::connection::RequestKind;
    use crate::session::future::RequestFuture;

    fn request(tag: &str) -> (PendingRequest, RequestFuture) {
        let (future, resolver) = RequestFuture::new();
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

    #[test]
    fn push_wakes_only_on_empty_to_nonempty() {
        let (queue, mut wakeup) = RequestQueue::new();
        let (first, _f1) = request("a");
        let (second, _f2) = request("b");
        queue.push(first).unwrap();
        queue.push(second).unwrap();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        runtime.block_on(wakeup.ready());
        assert_eq!(queue.drain().len(), 2);
        // Both pushes coalesced into a single wakeup.
        let timed_out = runtime.block_on(async {
            tokio::time::timeout(Duration::from_millis(50), wakeup.ready())
                .await
                .is_err()
        });
        assert!(timed_out);
    }

    #[test]
    fn no_item_is_lost_under_concurrent_producers() {
        let (queue, mut wakeup) = RequestQueue::new();
        let queue = Arc::new(queue);
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 250;

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|_| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let (item, _future) = request(&i.to_string());
                        queue.push(item).unwrap();
                    }
                })
            })
            .collect();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let mut drained = 0;
        while drained < PRODUCERS * PER_PRODUCER {
            runtime.block_on(wakeup.ready());
            drained += queue.drain().len();
        }
        for producer in producers {
            producer.join().unwrap();
        }
        assert_eq!(drained, PRODUCERS * PER_PRODUCER);
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn close_rejects_new_pushes_and_returns_backlog() {
        let (queue, _wakeup) = RequestQueue::new();
        let (first, _f1) = request("a");
        queue.push(first).unwrap();

        let backlog = queue.close();
        assert_eq!(backlog.len(), 1);

        let (late, future) = request("late");
        let rejected = queue.push(late).unwrap_err();
        rejected.resolver.fail(RequestError::SessionClosing);
        assert_matches!(
            future.take_result(),
            Some(Err(RequestError::SessionClosing))
        );
    }
}
