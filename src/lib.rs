//! Concurrency-bounded asynchronous mapping that yields `(input, output)`
//! pairs.
//!
//! The crate provides two policies for applying an asynchronous transform to
//! every element of a synchronous or asynchronous input sequence, each with a
//! caller-specified concurrency bound:
//!
//! - [`map_chunked`] partitions the input into fixed-size chunks, transforms
//!   every member of a chunk concurrently, and waits for the whole chunk
//!   before yielding. Pairs arrive in source order.
//! - [`map_unordered`] runs a persistent pool of workers over a shared work
//!   queue and streams pairs as soon as they complete, in completion order.
//!   The first transform failure cancels the pool and surfaces as a
//!   [`TaskFailed`] carrying the failing item and the original failure.
//!
//! Both entry points are lazy: nothing runs until the returned stream is
//! polled, and everything they create is torn down when the stream is
//! dropped.
//!
//! # Example
//!
//! ```
//! use futures::StreamExt;
//! use pairmap::map_unordered;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let mut pairs = map_unordered(
//!     |n: u32| async move { Ok::<_, std::convert::Infallible>(n * 10) },
//!     0..10u32,
//!     4,
//! );
//!
//! while let Some(pair) = pairs.next().await {
//!     let (input, output) = pair.unwrap();
//!     assert_eq!(output, input * 10);
//! }
//! # }
//! ```

mod chunked;
mod error;
mod source;
mod unordered;

pub use chunked::{MapChunked, map_chunked};
pub use error::TaskFailed;
pub use source::{IntoSourceStream, IterSource, IterStream, StreamSource};
pub use unordered::{MapUnordered, map_unordered};
