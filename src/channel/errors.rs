use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_core::Stream;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// Capacity used by [`ErrorChannel::new`].
pub const DEFAULT_ERROR_CAPACITY: usize = 1;

/// Longest time [`ErrorChannel::check`] waits on an empty, open channel.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Result of a single [`ErrorChannel::check`].
#[derive(Debug, Clone)]
pub enum ErrorCheck {
    /// The next queued error
    Error(Error),
    /// Nothing queued yet, but the channel is still open
    Empty,
    /// Nothing queued and the channel is closed; no more errors will arrive
    Done,
}

/// A closable bounded queue of errors between one writer and one reader.
///
/// `put` applies backpressure once `capacity` errors are buffered. Closing
/// never discards errors that were already put.
#[derive(Clone)]
pub struct ErrorChannel {
    shared: Arc<Shared>,
    poll_interval: Duration,
}

struct Shared {
    sender: mpsc::Sender<Error>,
    receiver: Mutex<mpsc::Receiver<Error>>,
    closed: CancellationToken,
    capacity: usize,
}

impl ErrorChannel {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_ERROR_CAPACITY)
    }

    /// Create a channel buffering up to `capacity` errors (at least one).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            shared: Arc::new(Shared {
                sender,
                receiver: Mutex::new(receiver),
                closed: CancellationToken::new(),
                capacity,
            }),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Set how long `check` waits on an empty, open channel
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn check_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Append an error, waiting while the buffer is full.
    pub async fn put(&self, error: Error) {
        if self.shared.closed.is_cancelled() {
            tracing::warn!(%error, "error put on a closed error channel; dropping it");
            return;
        }
        if let Err(mpsc::error::SendError(error)) = self.shared.sender.send(error).await {
            tracing::warn!(%error, "error channel receiver is gone; dropping error");
        }
    }

    /// Take the next queued error without waiting indefinitely.
    ///
    /// On an empty, open channel this waits at most the poll interval for an
    /// error or closure before reporting [`ErrorCheck::Empty`].
    pub async fn check(&self) -> ErrorCheck {
        let closed = &self.shared.closed;
        let mut receiver = self.shared.receiver.lock().await;

        match receiver.try_recv() {
            Ok(error) => return ErrorCheck::Error(error),
            Err(TryRecvError::Disconnected) => return ErrorCheck::Done,
            Err(TryRecvError::Empty) => {}
        }

        // A put always completes before the writer closes, so once closure is
        // observed everything still queued is already in the buffer.
        if closed.is_cancelled() {
            return drain_closed(&mut receiver);
        }

        tokio::select! {
            biased;
            error = receiver.recv() => match error {
                Some(error) => ErrorCheck::Error(error),
                None => ErrorCheck::Done,
            },
            _ = closed.cancelled() => drain_closed(&mut receiver),
            _ = tokio::time::sleep(self.poll_interval) => ErrorCheck::Empty,
        }
    }

    /// Wait for the next error. `None` once the channel is closed and drained.
    pub async fn recv(&self) -> Option<Error> {
        loop {
            match self.check().await {
                ErrorCheck::Error(error) => return Some(error),
                ErrorCheck::Empty => continue,
                ErrorCheck::Done => return None,
            }
        }
    }

    /// Mark that no more errors will be put. Idempotent.
    pub fn close(&self) {
        if !self.shared.closed.is_cancelled() {
            tracing::trace!("error channel closed");
        }
        self.shared.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Whether both handles refer to the same underlying channel
    pub fn same_channel(&self, other: &ErrorChannel) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Turn the reading side into a stream that ends once the channel is
    /// closed and drained
    pub fn into_stream(self) -> impl Stream<Item = Error> + Send {
        futures::stream::unfold(self, |channel| async move {
            let error = channel.recv().await?;
            Some((error, channel))
        })
    }
}

fn drain_closed(receiver: &mut mpsc::Receiver<Error>) -> ErrorCheck {
    match receiver.try_recv() {
        Ok(error) => ErrorCheck::Error(error),
        Err(_) => ErrorCheck::Done,
    }
}

impl Default for ErrorChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ErrorChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorChannel")
            .field("capacity", &self.shared.capacity)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready};

    fn messages(errors: Vec<Error>) -> Vec<String> {
        errors.into_iter().map(|e| e.to_string()).collect()
    }

    #[tokio::test]
    async fn test_put_check_close() {
        let channel = ErrorChannel::with_capacity(3);
        channel.put(Error::custom("a")).await;
        channel.put(Error::custom("b")).await;
        channel.close();

        let mut seen = Vec::new();
        loop {
            match channel.check().await {
                ErrorCheck::Error(e) => seen.push(e),
                ErrorCheck::Empty => panic!("closed channel should never report empty"),
                ErrorCheck::Done => break,
            }
        }
        assert_eq!(messages(seen), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_check_on_open_empty_channel() {
        let channel = ErrorChannel::new().poll_interval(Duration::from_millis(5));
        assert!(matches!(channel.check().await, ErrorCheck::Empty));

        channel.close();
        assert!(matches!(channel.check().await, ErrorCheck::Done));
        assert!(matches!(channel.check().await, ErrorCheck::Done));
    }

    #[tokio::test]
    async fn test_check_wakes_on_close() {
        let channel = ErrorChannel::new().poll_interval(Duration::from_secs(60));
        let closer = channel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            closer.close();
        });

        let result = tokio::time::timeout(Duration::from_secs(1), channel.check())
            .await
            .expect("check should return once the channel closes");
        assert!(matches!(result, ErrorCheck::Done));
    }

    #[tokio::test]
    async fn test_put_blocks_when_full() {
        let channel = ErrorChannel::with_capacity(1);
        channel.put(Error::custom("first")).await;

        let mut put = tokio_test::task::spawn(channel.put(Error::custom("second")));
        assert_pending!(put.poll());

        assert!(matches!(channel.check().await, ErrorCheck::Error(_)));
        assert!(put.is_woken());
        assert_ready!(put.poll());
    }

    #[tokio::test]
    async fn test_put_after_close_is_discarded() {
        let channel = ErrorChannel::new();
        channel.close();
        channel.put(Error::custom("late")).await;
        assert!(channel.recv().await.is_none());
    }

    #[test]
    fn test_poll_interval_is_per_handle() {
        let channel = ErrorChannel::new();
        let slow = channel.clone().poll_interval(Duration::from_secs(1));
        assert_eq!(channel.check_interval(), DEFAULT_POLL_INTERVAL);
        assert_eq!(slow.check_interval(), Duration::from_secs(1));
        assert!(slow.same_channel(&channel));
    }

    #[test]
    fn test_capacity() {
        assert_eq!(ErrorChannel::new().capacity(), DEFAULT_ERROR_CAPACITY);
        assert_eq!(ErrorChannel::with_capacity(5).capacity(), 5);
        assert_eq!(ErrorChannel::with_capacity(0).capacity(), 1);
    }

    #[tokio::test]
    async fn test_into_stream_preserves_order() {
        use tokio_stream::StreamExt;

        let channel = ErrorChannel::with_capacity(4);
        for msg in ["1", "2", "3"] {
            channel.put(Error::custom(msg)).await;
        }
        channel.close();

        let errors: Vec<Error> = channel.into_stream().collect().await;
        assert_eq!(messages(errors), vec!["1", "2", "3"]);
    }
}
