//! Error types for the mapping combinators.

use std::fmt;
use thiserror::Error;

/// Error yielded by [`map_unordered`](crate::map_unordered) when a transform
/// invocation fails.
///
/// Wraps the first failure observed in completion order, carrying the item
/// whose transform failed. The rendered message equals the original failure's
/// message, and the original failure is preserved as this error's
/// [`source`](std::error::Error::source) so callers and diagnostic tools can
/// recover it.
///
/// [`map_chunked`](crate::map_chunked) does not use this type: the chunked
/// policy propagates transform failures unwrapped.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct TaskFailed<T, E> {
    /// The input item whose transform invocation failed.
    pub item: T,
    message: String,
    #[source]
    source: E,
}

impl<T, E> TaskFailed<T, E>
where
    E: fmt::Display,
{
    pub(crate) fn new(item: T, source: E) -> Self {
        Self {
            item,
            message: source.to_string(),
            source,
        }
    }
}

impl<T, E> TaskFailed<T, E> {
    /// Consumes the error, returning the failing item and the original failure.
    pub fn into_parts(self) -> (T, E) {
        (self.item, self.source)
    }
}
