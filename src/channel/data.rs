use std::fmt;
use std::sync::Arc;

use futures_core::Stream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::datapack::Datapack;

/// A closable single-slot hand-off between one writer task and one reader task.
///
/// `write` returns only once the reader has taken the datapack or the channel
/// is closed, so at most one datapack is ever in flight. Closing is the only
/// way either side tells the other to stop.
///
/// Handles from [`DataChannel::new`] and their clones are counted as readers:
/// once the last of them is dropped the channel closes, just as if the reader
/// had called [`close`](DataChannel::close). Stages keep an uncounted writer
/// handle, so abandoning their output by dropping it releases them.
#[derive(Clone)]
pub struct DataChannel {
    shared: Arc<Shared>,
    reader: Option<Arc<ReaderHandle>>,
}

/// Closes the channel when the last counted handle goes away.
struct ReaderHandle {
    closed: CancellationToken,
}

impl Drop for ReaderHandle {
    fn drop(&mut self) {
        if !self.closed.is_cancelled() {
            tracing::trace!("all reader handles dropped; data channel closed");
        }
        self.closed.cancel();
    }
}

struct Shared {
    sender: mpsc::Sender<Handoff>,
    receiver: Mutex<mpsc::Receiver<Handoff>>,
    closed: CancellationToken,
}

struct Handoff {
    datapack: Datapack,
    accepted: oneshot::Sender<()>,
}

impl DataChannel {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::channel(1);
        let closed = CancellationToken::new();
        Self {
            reader: Some(Arc::new(ReaderHandle {
                closed: closed.clone(),
            })),
            shared: Arc::new(Shared {
                sender,
                receiver: Mutex::new(receiver),
                closed,
            }),
        }
    }

    /// A handle to the same channel that does not keep it open.
    pub(crate) fn writer(&self) -> DataChannel {
        DataChannel {
            shared: self.shared.clone(),
            reader: None,
        }
    }

    /// Hand a datapack to the reader.
    ///
    /// Returns `true` if the channel was closed before or while writing; the
    /// datapack may then be lost and the writer must stop producing.
    pub async fn write(&self, datapack: Datapack) -> bool {
        let closed = &self.shared.closed;
        if closed.is_cancelled() {
            return true;
        }

        let (accepted, ack) = oneshot::channel();
        let handoff = Handoff { datapack, accepted };

        tokio::select! {
            biased;
            _ = closed.cancelled() => return true,
            sent = self.shared.sender.send(handoff) => {
                if sent.is_err() {
                    return true;
                }
            }
        }

        tokio::select! {
            biased;
            taken = ack => taken.is_err(),
            _ = closed.cancelled() => true,
        }
    }

    /// Wait for the next datapack. `None` means the channel is closed and no
    /// further datapacks will arrive.
    pub async fn read(&self) -> Option<Datapack> {
        let closed = &self.shared.closed;
        if closed.is_cancelled() {
            return None;
        }

        let mut receiver = self.shared.receiver.lock().await;
        tokio::select! {
            biased;
            _ = closed.cancelled() => None,
            handoff = receiver.recv() => {
                let Handoff { datapack, accepted } = handoff?;
                // The writer may have given up after a concurrent close; the
                // datapack is still ours to deliver.
                let _ = accepted.send(());
                Some(datapack)
            }
        }
    }

    /// Close the channel. Idempotent and safe to call from either side.
    pub fn close(&self) {
        if !self.shared.closed.is_cancelled() {
            tracing::trace!("data channel closed");
        }
        self.shared.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Whether both handles refer to the same underlying channel
    pub fn same_channel(&self, other: &DataChannel) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Turn the reading side into a stream that ends when the channel closes
    pub fn into_stream(self) -> impl Stream<Item = Datapack> + Send {
        futures::stream::unfold(self, |channel| async move {
            let datapack = channel.read().await?;
            Some((datapack, channel))
        })
    }
}

impl Default for DataChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataChannel")
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_test::{assert_pending, assert_ready};

    #[tokio::test]
    async fn test_write_then_read() {
        let channel = DataChannel::new();
        let writer = channel.clone();

        let handle = tokio::spawn(async move {
            for i in 0..3u8 {
                assert!(!writer.write(Datapack::from_bytes(vec![i])).await);
            }
            writer.close();
        });

        let mut seen = Vec::new();
        while let Some(mut pack) = channel.read().await {
            seen.extend(pack.read_to_end().await.unwrap());
        }
        handle.await.unwrap();

        assert_eq!(seen, vec![0, 1, 2]);
        assert!(channel.is_closed());
    }

    #[tokio::test]
    async fn test_write_blocks_until_read() {
        let channel = DataChannel::new();
        let mut write = tokio_test::task::spawn(channel.write(Datapack::from_bytes("x")));
        assert_pending!(write.poll());

        let reader = channel.clone();
        let read = tokio::spawn(async move { reader.read().await });
        let pack = read.await.unwrap();
        assert!(pack.is_some());

        assert!(write.is_woken());
        let closed = assert_ready!(write.poll());
        assert!(!closed);
    }

    #[tokio::test]
    async fn test_close_unblocks_writer() {
        let channel = DataChannel::new();
        let writer = channel.clone();
        let handle = tokio::spawn(async move { writer.write(Datapack::from_bytes("x")).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        channel.close();
        let already_closed = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("writer should be released by close")
            .unwrap();
        assert!(already_closed);
    }

    #[tokio::test]
    async fn test_close_unblocks_reader() {
        let channel = DataChannel::new();
        let reader = channel.clone();
        let handle = tokio::spawn(async move { reader.read().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        channel.close();

        let item = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("reader should be released by close")
            .unwrap();
        assert!(item.is_none());
    }

    #[tokio::test]
    async fn test_operations_after_close() {
        let channel = DataChannel::new();
        channel.close();
        channel.close();

        assert!(channel.write(Datapack::from_bytes("late")).await);
        assert!(channel.read().await.is_none());
        assert!(channel.read().await.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_close_from_both_sides() {
        let channel = DataChannel::new();
        let a = channel.clone();
        let b = channel.clone();
        let (_, _) = tokio::join!(
            tokio::spawn(async move { a.close() }),
            tokio::spawn(async move { b.close() })
        );
        assert!(channel.is_closed());
    }

    #[tokio::test]
    async fn test_into_stream() {
        use tokio_stream::StreamExt;

        let channel = DataChannel::new();
        let writer = channel.clone();
        tokio::spawn(async move {
            writer.write(Datapack::from_bytes("a")).await;
            writer.write(Datapack::from_bytes("b")).await;
            writer.close();
        });

        let packs: Vec<Datapack> = channel.into_stream().collect().await;
        assert_eq!(packs.len(), 2);
    }

    #[tokio::test]
    async fn test_dropping_readers_closes_channel() {
        let channel = DataChannel::new();
        let writer = channel.writer();
        let reader = channel.clone();

        drop(channel);
        assert!(!writer.is_closed());

        let handle = tokio::spawn(async move { writer.write(Datapack::from_bytes("x")).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        drop(reader);
        let already_closed = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("writer should be released once every reader is gone")
            .unwrap();
        assert!(already_closed);
    }

    #[test]
    fn test_writer_handle_does_not_keep_channel_open() {
        let channel = DataChannel::new();
        let writer = channel.writer();
        let writer_clone = writer.clone();
        assert!(writer.same_channel(&channel));

        drop(channel);
        assert!(writer.is_closed());
        assert!(writer_clone.is_closed());
    }

    #[test]
    fn test_same_channel() {
        let a = DataChannel::new();
        let b = a.clone();
        let c = DataChannel::new();
        assert!(a.same_channel(&b));
        assert!(!a.same_channel(&c));
    }
}
