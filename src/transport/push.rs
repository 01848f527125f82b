//! Minimal push-channel abstraction under the SSE channel
//!
//! The SSE logic only needs to enqueue bytes, close the stream, and learn
//! when the client went away. [`StreamPushChannel`] provides that on top of a
//! bounded tokio mpsc channel whose receiving half is an HTTP body stream.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_stream::wrappers::ReceiverStream;

use crate::{Error, Result};

/// Callback fired once when the consumer cancels the stream
pub type CancelCallback = Box<dyn FnOnce() + Send + 'static>;

/// Outbound byte stream with cancellation notification
pub trait PushChannel: Send + Sync {
    /// Queue a chunk for delivery
    fn enqueue(&self, chunk: Bytes) -> Result<()>;

    /// End the stream from the server side
    fn close(&self) -> Result<()>;

    /// Register the callback run when the consumer goes away first.
    /// Replaces any previously registered callback.
    fn on_cancel(&self, callback: CancelCallback);
}

#[derive(Default)]
struct Shared {
    closed_by_server: AtomicBool,
    on_cancel: Mutex<Option<CancelCallback>>,
}

/// [`PushChannel`] feeding a [`PushStream`]
pub struct StreamPushChannel {
    tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    shared: Arc<Shared>,
}

impl StreamPushChannel {
    /// Create a channel buffering at most `capacity` chunks, plus the stream
    /// to hand to the HTTP response.
    #[must_use]
    pub fn new(capacity: usize) -> (Arc<Self>, PushStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let shared = Arc::new(Shared::default());
        let channel = Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            shared: Arc::clone(&shared),
        });
        (
            channel,
            PushStream {
                inner: ReceiverStream::new(rx),
                shared,
            },
        )
    }
}

impl PushChannel for StreamPushChannel {
    fn enqueue(&self, chunk: Bytes) -> Result<()> {
        let guard = self.tx.lock();
        let tx = guard
            .as_ref()
            .ok_or_else(|| Error::Stream("push channel closed".to_string()))?;
        tx.try_send(chunk).map_err(|e| match e {
            TrySendError::Full(_) => Error::Stream("client is not keeping up, event dropped".to_string()),
            TrySendError::Closed(_) => Error::Stream("client disconnected".to_string()),
        })
    }

    fn close(&self) -> Result<()> {
        self.shared.closed_by_server.store(true, Ordering::SeqCst);
        // The callback can no longer fire; drop it so nothing it captures lingers.
        self.shared.on_cancel.lock().take();
        match self.tx.lock().take() {
            Some(_) => Ok(()),
            None => Err(Error::Stream("push channel already closed".to_string())),
        }
    }

    fn on_cancel(&self, callback: CancelCallback) {
        *self.shared.on_cancel.lock() = Some(callback);
    }
}

/// Body stream for an SSE response.
///
/// Dropping it before the server closed the channel counts as cancellation.
pub struct PushStream {
    inner: ReceiverStream<Bytes>,
    shared: Arc<Shared>,
}

impl Stream for PushStream {
    type Item = std::result::Result<Bytes, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().inner.poll_next_unpin(cx).map(|chunk| chunk.map(Ok))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl Drop for PushStream {
    fn drop(&mut self) {
        if self.shared.closed_by_server.load(Ordering::SeqCst) {
            return;
        }
        let callback = self.shared.on_cancel.lock().take();
        if let Some(callback) = callback {
            callback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_enqueue_then_read() {
        let (channel, mut stream) = StreamPushChannel::new(8);
        channel.enqueue(Bytes::from_static(b"a")).unwrap();
        channel.enqueue(Bytes::from_static(b"b")).unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), Bytes::from_static(b"a"));
        assert_eq!(stream.next().await.unwrap().unwrap(), Bytes::from_static(b"b"));
    }

    #[tokio::test]
    async fn test_close_ends_stream_without_cancel() {
        let (channel, mut stream) = StreamPushChannel::new(8);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        channel.on_cancel(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        channel.enqueue(Bytes::from_static(b"last")).unwrap();
        channel.close().unwrap();
        assert!(channel.enqueue(Bytes::from_static(b"late")).is_err());
        assert!(channel.close().is_err());

        assert_eq!(stream.next().await.unwrap().unwrap(), Bytes::from_static(b"last"));
        assert!(stream.next().await.is_none());
        drop(stream);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_drop_before_close_fires_cancel_once() {
        let (channel, stream) = StreamPushChannel::new(8);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        channel.on_cancel(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        drop(stream);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(channel.enqueue(Bytes::from_static(b"x")).is_err());
    }

    #[test]
    fn test_full_buffer_is_an_error() {
        let (channel, _stream) = StreamPushChannel::new(1);
        channel.enqueue(Bytes::from_static(b"1")).unwrap();
        let err = channel.enqueue(Bytes::from_static(b"2")).unwrap_err();
        assert!(err.to_string().contains("not keeping up"));
    }
}
