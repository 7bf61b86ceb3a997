//! Streaming backpressure via bounded channels.
//!
//! Upstream fragments are forwarded through a bounded
//! `tokio::sync::mpsc::channel`, so a fast provider blocks when the stream
//! optimizer (or the transport behind it) falls behind instead of buffering
//! without limit.

use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use super::traits::FragmentStream;

/// Default number of fragments buffered between producer and consumer.
pub const DEFAULT_FRAGMENT_BUFFER: usize = 32;

/// Wrap a fragment stream in a bounded channel.
///
/// Spawns a producer task that reads from `inner`. The producer stops when
/// the consumer drops the stream, and after forwarding the first error.
///
/// Requires a tokio runtime context.
pub fn bounded_stream(inner: FragmentStream, buffer_size: usize) -> FragmentStream {
    bounded_stream_with(inner, buffer_size, |_| {})
}

/// [`bounded_stream`] that calls `on_finish` once the producer stops.
///
/// `on_finish` receives `false` if the upstream yielded an error. The pool
/// uses it to release the connection that backs a streamed completion.
pub fn bounded_stream_with<F>(
    inner: FragmentStream,
    buffer_size: usize,
    on_finish: F,
) -> FragmentStream
where
    F: FnOnce(bool) + Send + 'static,
{
    let (tx, rx) = tokio::sync::mpsc::channel(buffer_size.max(1));

    tokio::spawn(async move {
        let mut inner = inner;
        let mut ok = true;
        while let Some(item) = inner.next().await {
            let failed = item.is_err();
            ok &= !failed;
            if tx.send(item).await.is_err() || failed {
                break;
            }
        }
        on_finish(ok);
    });

    Box::pin(ReceiverStream::new(rx))
}
