//! End-to-end scenarios for the two mapping policies.

use futures::StreamExt;
use pairmap::{map_chunked, map_unordered};
use std::collections::HashMap;
use std::convert::Infallible;
use std::error::Error as _;
use std::sync::Once;
use thiserror::Error;

fn init_test_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

#[derive(Debug, Error, PartialEq)]
#[error("no answer for {0}")]
struct NoAnswer(u64);

#[tokio::test(flavor = "multi_thread")]
async fn unordered_policy_maps_fifty_items_with_five_workers() {
    init_test_tracing();

    let pairs: Vec<_> = map_unordered(
        |n: u64| async move {
            tokio::task::yield_now().await;
            Ok::<_, Infallible>(n * 10)
        },
        0..50u64,
        5,
    )
    .map(|pair| pair.unwrap())
    .collect()
    .await;

    // Order is unspecified, but every item appears exactly once with its
    // transformed value.
    let by_item: HashMap<_, _> = pairs.into_iter().collect();
    assert_eq!(by_item.len(), 50);
    for (item, value) in &by_item {
        assert_eq!(*value, item * 10);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn chunked_policy_maps_fifty_items_in_ordered_chunks_of_five() {
    init_test_tracing();

    let pairs: Vec<_> = map_chunked(
        |n: u64| async move {
            tokio::task::yield_now().await;
            Ok::<_, Infallible>(n * 10)
        },
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
async fn unordered_policy_surfaces_the_first_failure_wrapped() {
    init_test_tracing();

    let mut stream = map_unordered(
        |n: u64| async move {
            tokio::task::yield_now().await;
            if n == 5 { Err(NoAnswer(n)) } else { Ok(n * 10) }
        },
        0..10u64,
        2,
    );

    let mut failure = None;
    while let Some(next) = stream.next().await {
        match next {
            Ok((item, value)) => assert_eq!(value, item * 10),
            Err(error) => failure = Some(error),
        }
    }

    let failure = failure.expect("the failing item must surface");
    assert_eq!(failure.item, 5);
    assert_eq!(failure.to_string(), NoAnswer(5).to_string());
    let source = failure.source().expect("original failure must be preserved");
    assert_eq!(source.downcast_ref::<NoAnswer>(), Some(&NoAnswer(5)));
}

#[tokio::test]
async fn chunked_policy_emits_one_chunk_when_the_source_is_shorter() {
    init_test_tracing();

    let pairs: Vec<_> = map_chunked(
        |n: u64| async move { Ok::<_, Infallible>(n + 100) },
        0..3u64,
        64,
    )
    .map(|pair| pair.unwrap())
    .collect()
    .await;

    assert_eq!(pairs, vec![(0, 100), (1, 101), (2, 102)]);
}

#[tokio::test]
async fn both_policies_accept_stream_sources() {
    init_test_tracing();

    let chunked: Vec<_> = map_chunked(
        |n: u64| async move { Ok::<_, Infallible>(n * 2) },
        futures::stream::iter(0..8u64),
        3,
    )
    .map(|pair| pair.unwrap())
    .collect()
    .await;
    assert_eq!(chunked.len(), 8);

    let unordered: Vec<_> = map_unordered(
        |n: u64| async move { Ok::<_, Infallible>(n * 2) },
        futures::stream::iter(0..8u64),
        3,
    )
    .map(|pair| pair.unwrap())
    .collect()
    .await;
    assert_eq!(unordered.len(), 8);
}
