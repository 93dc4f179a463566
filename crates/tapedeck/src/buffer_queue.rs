//! Ordered, closable hand-off of buffer files from capture to transcode.
//!
//! One queue per session: a single producer enqueues each buffer file the
//! moment it is created, a single consumer dequeues in exactly that order.
//! Once closed for adding and drained, the queue is dead.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{PipelineError, Result};

/// One capture attempt's output file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferFile {
    pub index: u64,
    pub path: PathBuf,
}

/// Outcome of a blocking dequeue.
#[derive(Debug, PartialEq, Eq)]
pub enum Dequeue {
    Item(BufferFile),
    /// Timed out with nothing available; the queue is still open.
    Empty,
    /// Closed for adding and nothing left.
    Closed,
    Cancelled,
}

#[derive(Debug, Default)]
struct QueueState {
    entries: VecDeque<BufferFile>,
    closed: bool,
}

#[derive(Debug, Default)]
pub struct BufferQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl BufferQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        // Poisoning leaves the deque consistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a buffer file. Fails once the queue is closed for adding.
    pub fn enqueue(&self, file: BufferFile) -> Result<()> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(PipelineError::QueueClosed);
            }
            tracing::debug!(buffer.index = file.index, buffer.path = %file.path.display(), "Buffer enqueued");
            state.entries.push_back(file);
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Non-blocking dequeue: `Empty` if open with nothing queued.
    pub fn try_dequeue(&self) -> Dequeue {
        let mut state = self.lock();
        match state.entries.pop_front() {
            Some(file) => Dequeue::Item(file),
            None if state.closed => Dequeue::Closed,
            None => Dequeue::Empty,
        }
    }

    /// Wait up to `timeout` for the next entry.
    pub async fn dequeue(&self, timeout: Duration, cancel: &CancellationToken) -> Dequeue {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so an enqueue between check and await still wakes us.
            notified.as_mut().enable();

            match self.try_dequeue() {
                Dequeue::Empty => {}
                other => return other,
            }

            tokio::select! {
                _ = cancel.cancelled() => return Dequeue::Cancelled,
                _ = tokio::time::sleep_until(deadline) => return self.try_dequeue(),
                _ = &mut notified => {}
            }
        }
    }

    /// Signal that no further entries will arrive. Idempotent.
    pub fn close_for_adding(&self) {
        {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        tracing::debug!("Buffer queue closed for adding");
        self.notify.notify_waiters();
    }

    /// Remove everything still queued, in order.
    pub fn drain(&self) -> Vec<BufferFile> {
        self.lock().entries.drain(..).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn file(index: u64) -> BufferFile {
        BufferFile {
            index,
            path: PathBuf::from(format!("/tmp/buffer{}.ts", index)),
        }
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = BufferQueue::new();
        let cancel = CancellationToken::new();
        for i in 0..5 {
            queue.enqueue(file(i)).unwrap();
        }
        queue.close_for_adding();

        for i in 0..5 {
            assert_eq!(
                queue.dequeue(Duration::from_millis(10), &cancel).await,
                Dequeue::Item(file(i))
            );
        }
        assert_eq!(
            queue.dequeue(Duration::from_millis(10), &cancel).await,
            Dequeue::Closed
        );
    }

    #[test]
    fn test_close_is_idempotent() {
        let queue = BufferQueue::new();
        queue.enqueue(file(0)).unwrap();
        queue.close_for_adding();
        queue.close_for_adding();
        queue.close_for_adding();

        assert!(queue.is_closed());
        assert_eq!(queue.len(), 1);
        assert!(matches!(queue.enqueue(file(1)), Err(PipelineError::QueueClosed)));
        assert_eq!(queue.try_dequeue(), Dequeue::Item(file(0)));
        assert_eq!(queue.try_dequeue(), Dequeue::Closed);
    }

    #[tokio::test]
    async fn test_empty_on_timeout() {
        let queue = BufferQueue::new();
        let cancel = CancellationToken::new();
        assert_eq!(
            queue.dequeue(Duration::from_millis(20), &cancel).await,
            Dequeue::Empty
        );
    }

    #[tokio::test]
    async fn test_dequeue_wakes_on_enqueue() {
        let queue = Arc::new(BufferQueue::new());
        let cancel = CancellationToken::new();

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                queue.enqueue(file(7)).unwrap();
            })
        };

        let got = queue.dequeue(Duration::from_secs(5), &cancel).await;
        assert_eq!(got, Dequeue::Item(file(7)));
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn test_dequeue_wakes_on_close() {
        let queue = Arc::new(BufferQueue::new());
        let cancel = CancellationToken::new();

        let closer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                queue.close_for_adding();
            })
        };

        assert_eq!(
            queue.dequeue(Duration::from_secs(5), &cancel).await,
            Dequeue::Closed
        );
        closer.await.unwrap();
    }

    #[tokio::test]
    async fn test_dequeue_cancelled() {
        let queue = BufferQueue::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(
            queue.dequeue(Duration::from_secs(5), &cancel).await,
            Dequeue::Cancelled
        );
    }

    #[test]
    fn test_drain_empties_in_order() {
        let queue = BufferQueue::new();
        queue.enqueue(file(0)).unwrap();
        queue.enqueue(file(1)).unwrap();
        queue.close_for_adding();

        let drained = queue.drain();
        assert_eq!(drained, vec![file(0), file(1)]);
        assert!(queue.is_empty());
        assert_eq!(queue.try_dequeue(), Dequeue::Closed);
    }
}
