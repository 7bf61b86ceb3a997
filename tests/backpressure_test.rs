//! Tests for streaming backpressure.
//!
//! Verifies that the bounded channel wrapper holds fragment producers back
//! when consumers fall behind.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use huginn::providers::{FragmentStream, bounded_stream, bounded_stream_with};

/// A stream that counts how many fragments have been produced.
fn counting_stream(count: u32, produced: Arc<AtomicU32>) -> FragmentStream {
    Box::pin(stream::iter((0..count).map(move |i| {
        produced.fetch_add(1, Ordering::SeqCst);
        Ok(format!("fragment-{i}"))
    })))
}

#[tokio::test]
async fn bounded_stream_delivers_all_fragments() {
    let produced = Arc::new(AtomicU32::new(0));
    let mut stream = bounded_stream(counting_stream(10, produced.clone()), 4);

    let mut received = 0;
    while let Some(item) = stream.next().await {
        assert!(item.is_ok());
        received += 1;
    }
    assert_eq!(received, 10);
    assert_eq!(produced.load(Ordering::SeqCst), 10);
}

#[tokio::test]
async fn bounded_stream_handles_empty_stream() {
    let inner: FragmentStream = Box::pin(stream::empty());
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();

    let mut stream = bounded_stream_with(inner, 4, move |ok| {
        let _ = done_tx.send(ok);
    });
    assert!(stream.next().await.is_none());
    assert!(done_rx.await.unwrap());
}

#[tokio::test]
async fn producer_stops_when_consumer_drops() {
    let produced = Arc::new(AtomicU32::new(0));
    let mut stream = bounded_stream(counting_stream(1000, produced.clone()), 4);

    stream.next().await;
    stream.next().await;
    drop(stream);

    // Give the producer task a moment to notice the dropped receiver.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let total = produced.load(Ordering::SeqCst);
    assert!(
        total < 20,
        "producer should stop early when consumer drops, but produced {total} fragments"
    );
}

#[tokio::test]
async fn backpressure_limits_producer_ahead() {
    let produced = Arc::new(AtomicU32::new(0));
    let buffer_size = 4;
    let mut stream = bounded_stream(counting_stream(100, produced.clone()), buffer_size);

    let _ = stream.next().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // One consumed, the buffer full, and one held by the blocked send.
    let total = produced.load(Ordering::SeqCst);
    assert!(
        total <= (buffer_size as u32 + 2),
        "producer should be bounded by buffer, but produced {total} fragments (buffer={buffer_size})"
    );
}
