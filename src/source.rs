//! Normalization of synchronous and asynchronous sequences into streams.
//!
//! Both mapping combinators accept either a plain [`IntoIterator`] or a
//! [`Stream`] as their input. [`IntoSourceStream`] unifies the two behind a
//! single generic parameter: streams are forwarded unchanged, while plain
//! iterables are wrapped in [`IterStream`], which yields to the scheduler
//! before each element so that a long synchronous source does not monopolize
//! the executor.

use core::pin::Pin;
use core::task::{Context, Poll};
use futures::Stream;

/// Marker selecting the [`IntoSourceStream`] implementation for plain
/// iterables.
#[derive(Debug)]
pub enum IterSource {}

/// Marker selecting the [`IntoSourceStream`] implementation for streams.
#[derive(Debug)]
pub enum StreamSource {}

/// Conversion of a synchronous or asynchronous sequence into a single
/// asynchronous production interface.
///
/// The marker parameter `M` only disambiguates the two blanket
/// implementations; it is inferred at the call site and callers never name
/// it. The produced stream is consumed in a single pass and is finite
/// whenever the source is finite.
pub trait IntoSourceStream<M> {
    /// Element type produced by the source.
    type Item;
    /// The normalized stream type.
    type Stream: Stream<Item = Self::Item>;

    /// Converts the source into a stream of its elements.
    fn into_source_stream(self) -> Self::Stream;
}

impl<I> IntoSourceStream<IterSource> for I
where
    I: IntoIterator,
{
    type Item = I::Item;
    type Stream = IterStream<I::IntoIter>;

    fn into_source_stream(self) -> Self::Stream {
        IterStream {
            iter: self.into_iter(),
            ready: false,
        }
    }
}

impl<S> IntoSourceStream<StreamSource> for S
where
    S: Stream,
{
    type Item = S::Item;
    type Stream = S;

    /// Streams are forwarded unchanged, without an adapter layer.
    fn into_source_stream(self) -> Self::Stream {
        self
    }
}

/// A stream over a plain iterator that suspends before each element.
///
/// Every element boundary is a genuine suspension point: the stream wakes
/// itself and returns [`Poll::Pending`] once before producing the next
/// element, giving other tasks a chance to run in between.
#[must_use = "streams do nothing unless polled"]
#[derive(Debug)]
pub struct IterStream<I> {
    iter: I,
    ready: bool,
}

impl<I> Unpin for IterStream<I> {}

impl<I> Stream for IterStream<I>
where
    I: Iterator,
{
    type Item = I::Item;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if !self.ready {
            self.ready = true;
            cx.waker().wake_by_ref();
            return Poll::Pending;
        }

        self.ready = false;
        Poll::Ready(self.iter.next())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.iter.size_hint()
    }
}
