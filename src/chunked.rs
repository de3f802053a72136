//! Chunked mapping: fixed-size batches, input order preserved.
//!
//! [`map_chunked`] partitions its input into chunks of up to `chunk_size`
//! elements, runs the transform on every member of a chunk concurrently, and
//! only moves on once the whole chunk has finished. Pairs are yielded in the
//! chunk's original element order, one chunk at a time, in source order.
//!
//! Failure semantics are deliberately asymmetric to the unordered policy: the
//! first failure in a chunk is yielded unwrapped as soon as it is detected,
//! and the sibling invocations of the same chunk are neither awaited nor
//! aborted. They keep running in the background with their results discarded.

use core::pin::Pin;
use core::task::{Context, Poll};
use futures::{Future, Stream, ready};
use pin_project_lite::pin_project;
use std::collections::VecDeque;
use std::mem;
use std::panic;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::source::IntoSourceStream;

pin_project! {
    /// Groups the items of a stream into vectors of up to a fixed size.
    ///
    /// A chunk is emitted only once it is full or the inner stream has ended,
    /// never because the inner stream is momentarily pending.
    #[must_use = "streams do nothing unless polled"]
    #[derive(Debug)]
    pub(crate) struct ChunkStream<T, S: Stream<Item = T>> {
        #[pin]
        stream: S,
        items: Vec<T>,
        chunk_size: usize,
        inner_stream_ended: bool,
    }
}

impl<T, S: Stream<Item = T>> ChunkStream<T, S> {
    pub(crate) fn wrap(stream: S, chunk_size: usize) -> Self {
        Self {
            stream,
            items: Vec::with_capacity(chunk_size),
            chunk_size,
            inner_stream_ended: false,
        }
    }
}

impl<T, S: Stream<Item = T>> Stream for ChunkStream<T, S> {
    type Item = Vec<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        if *this.inner_stream_ended {
            return Poll::Ready(None);
        }

        loop {
            // Avoid reallocations while the chunk fills up.
            if this.items.is_empty() {
                this.items.reserve_exact(*this.chunk_size);
            }

            match ready!(this.stream.as_mut().poll_next(cx)) {
                Some(item) => {
                    this.items.push(item);
                    if this.items.len() >= *this.chunk_size {
                        return Poll::Ready(Some(mem::take(this.items)));
                    }
                }
                None => {
                    *this.inner_stream_ended = true;
                    let last = if this.items.is_empty() {
                        None
                    } else {
                        Some(mem::take(this.items))
                    };

                    return Poll::Ready(last);
                }
            }
        }
    }
}

/// One chunk's worth of spawned transform tasks.
///
/// Keeps the original items so the yielded pairs come out in the chunk's
/// element order once every task has completed.
struct SpawnedChunk<T, U, E> {
    items: Vec<T>,
    handles: Vec<Option<JoinHandle<Result<U, E>>>>,
    results: Vec<Option<U>>,
    remaining: usize,
}

impl<T, U, E> SpawnedChunk<T, U, E>
where
    T: Clone,
    U: Send + 'static,
    E: Send + 'static,
{
    fn spawn<F, Fut>(transform: &F, items: Vec<T>) -> Self
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = Result<U, E>> + Send + 'static,
    {
        let handles = items
            .iter()
            .map(|item| Some(tokio::spawn(transform(item.clone()))))
            .collect::<Vec<_>>();
        let results = items.iter().map(|_| None).collect();
        let remaining = items.len();

        trace!(chunk_len = items.len(), "spawned transform tasks for chunk");

        Self {
            items,
            handles,
            results,
            remaining,
        }
    }

    /// Polls every outstanding task in the chunk.
    ///
    /// Resolves with the full pair list only once the whole chunk has
    /// completed; the first failure is surfaced immediately, leaving the
    /// remaining handles behind for the caller to drop.
    fn poll_results(&mut self, cx: &mut Context<'_>) -> Poll<Result<Vec<(T, U)>, E>> {
        for (handle_slot, result_slot) in self.handles.iter_mut().zip(self.results.iter_mut()) {
            let Some(handle) = handle_slot else { continue };

            match Pin::new(handle).poll(cx) {
                Poll::Pending => {}
                Poll::Ready(Ok(Ok(value))) => {
                    *result_slot = Some(value);
                    *handle_slot = None;
                    self.remaining -= 1;
                }
                Poll::Ready(Ok(Err(error))) => return Poll::Ready(Err(error)),
                Poll::Ready(Err(join_error)) => {
                    if join_error.is_panic() {
                        panic::resume_unwind(join_error.into_panic());
                    }
                    // The stream never aborts its tasks; a cancelled task
                    // means the runtime itself is shutting down.
                    panic!("transform task cancelled: {join_error}");
                }
            }
        }

        if self.remaining > 0 {
            return Poll::Pending;
        }

        let pairs = self
            .items
            .drain(..)
            .zip(self.results.drain(..).flatten())
            .collect();

        Poll::Ready(Ok(pairs))
    }
}

pin_project! {
    /// Stream returned by [`map_chunked`].
    ///
    /// Yields `Ok((item, result))` pairs in source order and terminates after
    /// yielding the first transform failure unwrapped.
    #[must_use = "streams do nothing unless polled"]
    pub struct MapChunked<T, S: Stream<Item = T>, F, U, E> {
        #[pin]
        chunks: ChunkStream<T, S>,
        transform: F,
        in_flight: Option<SpawnedChunk<T, U, E>>,
        done: VecDeque<(T, U)>,
        finished: bool,
    }
}

impl<T, S, F, Fut, U, E> Stream for MapChunked<T, S, F, U, E>
where
    T: Clone,
    S: Stream<Item = T>,
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<U, E>> + Send + 'static,
    U: Send + 'static,
    E: Send + 'static,
{
    type Item = Result<(T, U), E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            if *this.finished {
                return Poll::Ready(None);
            }

            if let Some(pair) = this.done.pop_front() {
                return Poll::Ready(Some(Ok(pair)));
            }

            if let Some(chunk) = this.in_flight.as_mut() {
                match ready!(chunk.poll_results(cx)) {
                    Ok(pairs) => {
                        *this.in_flight = None;
                        this.done.extend(pairs);
                    }
                    Err(error) => {
                        // Dropping the remaining handles detaches the sibling
                        // tasks: they keep running in the background and their
                        // results are discarded.
                        *this.in_flight = None;
                        *this.finished = true;

                        return Poll::Ready(Some(Err(error)));
                    }
                }

                continue;
            }

            match ready!(this.chunks.as_mut().poll_next(cx)) {
                Some(chunk_items) => {
                    *this.in_flight = Some(SpawnedChunk::spawn(this.transform, chunk_items));
                }
                None => {
                    *this.finished = true;

                    return Poll::Ready(None);
                }
            }
        }
    }
}

/// Maps `transform` over `source` in chunks of up to `chunk_size` elements.
///
/// Every element of a chunk is transformed concurrently and the whole chunk
/// is awaited before the next one starts, so at most `chunk_size` transform
/// invocations are in flight at any moment. Pairs are yielded in source
/// order. The source may be a plain iterable or a stream.
///
/// If any invocation in a chunk fails, the failure is yielded unwrapped as
/// soon as it is detected and the stream terminates. Sibling invocations of
/// the same chunk that already started are not awaited or aborted; they may
/// complete in the background with their results discarded.
///
/// # Panics
///
/// Panics if `chunk_size` is zero, or when polled outside of a tokio runtime.
pub fn map_chunked<M, Src, F, Fut, U, E>(
    transform: F,
    source: Src,
    chunk_size: usize,
) -> MapChunked<Src::Item, Src::Stream, F, U, E>
where
    Src: IntoSourceStream<M>,
    Src::Item: Clone,
    F: Fn(Src::Item) -> Fut,
    Fut: Future<Output = Result<U, E>> + Send + 'static,
    U: Send + 'static,
    E: Send + 'static,
{
    assert!(chunk_size >= 1, "chunk_size must be at least 1");

    MapChunked {
        chunks: ChunkStream::wrap(source.into_source_stream(), chunk_size),
        transform,
        in_flight: None,
        done: VecDeque::new(),
        finished: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::convert::Infallible;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use thiserror::Error;
    use tokio::time::{Duration, sleep};

    #[derive(Debug, Error, PartialEq)]
    #[error("transform rejected {0}")]
    struct Rejected(u32);

    #[tokio::test]
    async fn chunk_stream_groups_items_and_keeps_the_remainder() {
        let chunks: Vec<_> = ChunkStream::wrap(futures::stream::iter(0..7), 3)
            .collect()
            .await;

        assert_eq!(chunks, vec![vec![0, 1, 2], vec![3, 4, 5], vec![6]]);
    }

    #[tokio::test]
    async fn chunk_stream_emits_a_single_chunk_for_short_sources() {
        let chunks: Vec<_> = ChunkStream::wrap(futures::stream::iter(0..3), 10)
            .collect()
            .await;

        assert_eq!(chunks, vec![vec![0, 1, 2]]);
    }

    #[tokio::test]
    async fn yields_pairs_in_source_order() {
        let pairs: Vec<_> = map_chunked(
            |n: u64| async move { Ok::<_, Infallible>(n * 10) },
            0..50u64,
            5,
        )
        .map(|pair| pair.unwrap())
        .collect()
        .await;

        let expected: Vec<_> = (0..50).map(|n| (n, n * 10)).collect();
        assert_eq!(pairs, expected);
    }

    #[tokio::test]
    async fn never_runs_more_transforms_than_the_chunk_size() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let transform = {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            move |n: u32| {
                let in_flight = Arc::clone(&in_flight);
                let peak = Arc::clone(&peak);
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, Infallible>(n * 10)
                }
            }
        };

        let pairs: Vec<_> = map_chunked(transform, 0..50u32, 5).collect().await;

        assert_eq!(pairs.len(), 50);
        assert!(peak.load(Ordering::SeqCst) <= 5, "too many transforms in flight");
    }

    #[tokio::test]
    async fn first_failure_surfaces_unwrapped_and_stops_the_stream() {
        let invoked = Arc::new(AtomicUsize::new(0));

        let transform = {
            let invoked = Arc::clone(&invoked);
            move |n: u32| {
                let invoked = Arc::clone(&invoked);
                async move {
                    invoked.fetch_add(1, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    if n == 5 {
                        return Err(Rejected(n));
                    }
                    Ok(n * 10)
                }
            }
        };

        let mut stream = map_chunked(transform, 0..10u32, 5);
        let mut successes = 0;
        let mut failure = None;
        while let Some(next) = stream.next().await {
            match next {
                Ok(_) => successes += 1,
                Err(error) => failure = Some(error),
            }
        }

        // The first chunk completes in full; the second fails on its first item.
        assert_eq!(successes, 5);
        assert_eq!(failure, Some(Rejected(5)));

        // Siblings of the failing invocation were already spawned and finish in
        // the background with their results discarded.
        sleep(Duration::from_millis(20)).await;
        assert_eq!(invoked.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn chunk_size_larger_than_the_source_emits_everything_in_order() {
        let pairs: Vec<_> = map_chunked(
            |n: u32| async move { Ok::<_, Infallible>(n + 1) },
            0..4u32,
            100,
        )
        .map(|pair| pair.unwrap())
        .collect()
        .await;

        assert_eq!(pairs, vec![(0, 1), (1, 2), (2, 3), (3, 4)]);
    }

    #[tokio::test]
    async fn empty_source_terminates_without_pairs() {
        let pairs: Vec<_> = map_chunked(
            |n: u32| async move { Ok::<_, Infallible>(n) },
            Vec::<u32>::new(),
            5,
        )
        .collect()
        .await;

        assert!(pairs.is_empty());
    }

    #[test]
    #[should_panic(expected = "chunk_size must be at least 1")]
    fn zero_chunk_size_panics() {
        let _ = map_chunked(|n: u32| async move { Ok::<_, Infallible>(n) }, 0..1u32, 0);
    }
}
