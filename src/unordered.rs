//! Unordered mapping: a persistent worker pool streaming results in
//! completion order.
//!
//! [`map_unordered`] feeds the whole input into a shared inbox, follows it
//! with one shutdown marker per worker, and spawns `concurrency` workers that
//! drain the inbox, apply the transform, and deposit tagged envelopes on a
//! shared outbox. The returned stream drains the outbox lazily, yielding
//! successful pairs as they complete. On the first failure it sets a shared
//! cancellation flag, waits for the remaining workers to wind down, and then
//! yields the failure wrapped in [`TaskFailed`].
//!
//! The worker pool and the aggregating stream form one coupled state machine:
//! their correctness depends on the exact interleaving contract around the
//! cancellation flag and the completion counter, so they live together in
//! this module.

use core::pin::Pin;
use core::task::{Context, Poll};
use futures::{Future, Stream};
use pin_project_lite::pin_project;
use std::fmt;
use std::mem;
use std::panic;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Mutex;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::task::JoinSet;
use tracing::{debug, trace};

use crate::error::TaskFailed;
use crate::source::IntoSourceStream;

/// Inbox message: a unit of work, or the per-worker shutdown marker.
///
/// The marker is a dedicated variant, so no caller-provided item can ever
/// collide with it.
enum WorkEnvelope<T> {
    Item(T),
    Shutdown,
}

/// Outbox message: the tagged outcome of one transform invocation, or the
/// terminal marker sent by the last worker to exit.
enum ResultEnvelope<T, U, E> {
    Success { item: T, value: U },
    Failure { item: T, error: E },
    Closed,
}

/// A single worker: drains the shared inbox until it sees the shutdown
/// marker or the cancellation flag, routing every outcome through the outbox.
///
/// The flag is checked only at the top of the loop, before a new dequeue. A
/// worker already parked on the inbox when cancellation is requested still
/// receives and fully processes one more item before the next iteration
/// re-checks the flag, so cancellation is best-effort rather than an atomic
/// stop.
async fn worker_loop<T, F, Fut, U, E>(
    worker_id: usize,
    concurrency: usize,
    transform: Arc<F>,
    inbox: Arc<Mutex<UnboundedReceiver<WorkEnvelope<T>>>>,
    outbox: UnboundedSender<ResultEnvelope<T, U, E>>,
    cancel: Arc<AtomicBool>,
    exited: Arc<AtomicUsize>,
) where
    T: Clone,
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<U, E>>,
{
    trace!(worker_id, "worker started");

    while !cancel.load(Ordering::Acquire) {
        let envelope = { inbox.lock().await.recv().await };

        match envelope {
            Some(WorkEnvelope::Item(item)) => match (*transform)(item.clone()).await {
                Ok(value) => {
                    let _ = outbox.send(ResultEnvelope::Success { item, value });
                }
                Err(error) => {
                    // Failures never escape the worker; they route through
                    // the outbox like every other outcome.
                    let _ = outbox.send(ResultEnvelope::Failure { item, error });
                }
            },
            Some(WorkEnvelope::Shutdown) | None => break,
        }
    }

    trace!(worker_id, "worker stopped");

    // Whichever exit brings the counter to the pool size reports that the
    // pool has fully wound down.
    let exited_count = exited.fetch_add(1, Ordering::AcqRel) + 1;
    if exited_count == concurrency {
        debug!("all workers exited, sending terminal marker");
        let _ = outbox.send(ResultEnvelope::Closed);
    }
}

/// Drive phase of [`MapUnordered`].
enum DriveState<T, U, E> {
    /// Enqueueing the adapted source, markers not yet sent, no workers yet.
    Feeding {
        inbox_tx: UnboundedSender<WorkEnvelope<T>>,
        inbox_rx: UnboundedReceiver<WorkEnvelope<T>>,
        outbox_tx: UnboundedSender<ResultEnvelope<T, U, E>>,
    },
    /// Workers running, draining the outbox.
    Draining,
    /// Terminal marker or first failure seen; waiting for every worker task
    /// to finish before surfacing the outcome.
    Joining { failure: Option<TaskFailed<T, E>> },
    Done,
}

pin_project! {
    /// Stream returned by [`map_unordered`].
    ///
    /// Yields `Ok((item, result))` pairs in completion order and terminates
    /// after yielding the first transform failure wrapped in [`TaskFailed`].
    /// Dropping the stream early drops the worker pool with it, aborting any
    /// outstanding transform invocations.
    #[must_use = "streams do nothing unless polled"]
    pub struct MapUnordered<T, S: Stream<Item = T>, F, U, E> {
        #[pin]
        source: S,
        transform: Arc<F>,
        concurrency: usize,
        outbox_rx: UnboundedReceiver<ResultEnvelope<T, U, E>>,
        cancel: Arc<AtomicBool>,
        exited: Arc<AtomicUsize>,
        workers: JoinSet<()>,
        state: DriveState<T, U, E>,
    }
}

impl<T, S, F, Fut, U, E> Stream for MapUnordered<T, S, F, U, E>
where
    T: Clone + Send + 'static,
    S: Stream<Item = T>,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<U, E>> + Send + 'static,
    U: Send + 'static,
    E: fmt::Display + Send + 'static,
{
    type Item = Result<(T, U), TaskFailed<T, E>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            match mem::replace(this.state, DriveState::Done) {
                DriveState::Feeding {
                    inbox_tx,
                    inbox_rx,
                    outbox_tx,
                } => match this.source.as_mut().poll_next(cx) {
                    Poll::Pending => {
                        *this.state = DriveState::Feeding {
                            inbox_tx,
                            inbox_rx,
                            outbox_tx,
                        };

                        return Poll::Pending;
                    }
                    Poll::Ready(Some(item)) => {
                        let _ = inbox_tx.send(WorkEnvelope::Item(item));
                        *this.state = DriveState::Feeding {
                            inbox_tx,
                            inbox_rx,
                            outbox_tx,
                        };
                    }
                    Poll::Ready(None) => {
                        // The whole input is enqueued before any worker
                        // starts: items first, then exactly one shutdown
                        // marker per worker.
                        for _ in 0..*this.concurrency {
                            let _ = inbox_tx.send(WorkEnvelope::Shutdown);
                        }
                        drop(inbox_tx);

                        let inbox = Arc::new(Mutex::new(inbox_rx));
                        for worker_id in 0..*this.concurrency {
                            this.workers.spawn(worker_loop(
                                worker_id,
                                *this.concurrency,
                                Arc::clone(this.transform),
                                Arc::clone(&inbox),
                                outbox_tx.clone(),
                                Arc::clone(this.cancel),
                                Arc::clone(this.exited),
                            ));
                        }
                        debug!(concurrency = *this.concurrency, "worker pool started");

                        *this.state = DriveState::Draining;
                    }
                },
                DriveState::Draining => match this.outbox_rx.poll_recv(cx) {
                    Poll::Pending => {
                        *this.state = DriveState::Draining;

                        return Poll::Pending;
                    }
                    Poll::Ready(Some(ResultEnvelope::Success { item, value })) => {
                        *this.state = DriveState::Draining;

                        return Poll::Ready(Some(Ok((item, value))));
                    }
                    Poll::Ready(Some(ResultEnvelope::Failure { item, error })) => {
                        // First failure wins: stop handing out new work, then
                        // wind the pool down before surfacing it.
                        this.cancel.store(true, Ordering::Release);
                        debug!("transform failed, cancelling worker pool");

                        *this.state = DriveState::Joining {
                            failure: Some(TaskFailed::new(item, error)),
                        };
                    }
                    Poll::Ready(Some(ResultEnvelope::Closed)) => {
                        *this.state = DriveState::Joining { failure: None };
                    }
                    Poll::Ready(None) => {
                        // Every sender gone without a terminal marker: the
                        // workers died. Joining surfaces the panic.
                        *this.state = DriveState::Joining { failure: None };
                    }
                },
                DriveState::Joining { mut failure } => {
                    // Never surface the outcome while workers are still
                    // running; that would leave orphaned concurrent work and
                    // unobserved failures behind.
                    loop {
                        match this.workers.poll_join_next(cx) {
                            Poll::Pending => {
                                *this.state = DriveState::Joining { failure };

                                return Poll::Pending;
                            }
                            Poll::Ready(Some(Ok(()))) => {}
                            Poll::Ready(Some(Err(join_error))) => {
                                if join_error.is_panic() {
                                    panic::resume_unwind(join_error.into_panic());
                                }
                            }
                            Poll::Ready(None) => break,
                        }
                    }

                    return match failure.take() {
                        Some(failure) => Poll::Ready(Some(Err(failure))),
                        None => Poll::Ready(None),
                    };
                }
                DriveState::Done => return Poll::Ready(None),
            }
        }
    }
}

/// Maps `transform` over `source` with `concurrency` persistent workers,
/// yielding `(item, result)` pairs in completion order.
///
/// At most `concurrency` transform invocations are in flight at any moment.
/// Output order is unspecified relative to input order. The source may be a
/// plain iterable or a stream; either way it is fully enqueued before the
/// workers start.
///
/// On the first transform failure the stream stops handing out new work,
/// waits for the workers to wind down, and yields the failure wrapped in
/// [`TaskFailed`], carrying the failing item and preserving the original
/// failure as its source. Workers already processing an item when the
/// failure is observed finish that one invocation; their results are
/// discarded.
///
/// # Panics
///
/// Panics if `concurrency` is zero, or when polled outside of a tokio
/// runtime.
pub fn map_unordered<M, Src, F, Fut, U, E>(
    transform: F,
    source: Src,
    concurrency: usize,
) -> MapUnordered<Src::Item, Src::Stream, F, U, E>
where
    Src: IntoSourceStream<M>,
    Src::Item: Clone + Send + 'static,
    F: Fn(Src::Item) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<U, E>> + Send + 'static,
    U: Send + 'static,
    E: fmt::Display + Send + 'static,
{
    assert!(concurrency >= 1, "concurrency must be at least 1");

    let (inbox_tx, inbox_rx) = unbounded_channel();
    let (outbox_tx, outbox_rx) = unbounded_channel();

    MapUnordered {
        source: source.into_source_stream(),
        transform: Arc::new(transform),
        concurrency,
        outbox_rx,
        cancel: Arc::new(AtomicBool::new(false)),
        exited: Arc::new(AtomicUsize::new(0)),
        workers: JoinSet::new(),
        state: DriveState::Feeding {
            inbox_tx,
            inbox_rx,
            outbox_tx,
        },
    }
}
