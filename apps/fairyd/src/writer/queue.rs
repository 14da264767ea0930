use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;

/// Bounded multi-producer, single-consumer queue that sheds its *oldest*
/// entry on overflow, preserving recency of what survives.
pub struct RecordQueue<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

impl<T> RecordQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity.min(256)),
                closed: false,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue without blocking. Past capacity the oldest entry is dropped
    /// and counted; after close the item itself is dropped and counted.
    pub fn push(&self, item: T) {
        {
            let mut state = self.state.lock().expect("queue lock");
            if state.closed {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            if state.items.len() >= self.capacity {
                state.items.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            state.items.push_back(item);
        }
        self.notify.notify_one();
    }

    /// Dequeue, waiting for work. Returns `None` once the queue is closed
    /// and fully drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().expect("queue lock");
                if let Some(item) = state.items.pop_front() {
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Stop accepting work; the consumer still drains what is queued.
    pub fn close(&self) {
        self.state.lock().expect("queue lock").closed = true;
        self.notify.notify_one();
    }

    /// Drop everything still queued; used when the shutdown grace expires.
    pub fn discard_remaining(&self) -> u64 {
        let mut state = self.state.lock().expect("queue lock");
        let lost = state.items.len() as u64;
        state.items.clear();
        state.closed = true;
        self.dropped.fetch_add(lost, Ordering::Relaxed);
        self.notify.notify_one();
        lost
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("queue lock").items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn fifo_order_preserved() {
        let queue = RecordQueue::new(8);
        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.pop().await, Some(1));
        assert_eq!(queue.pop().await, Some(2));
        assert_eq!(queue.pop().await, Some(3));
    }

    #[tokio::test]
    async fn overflow_drops_oldest() {
        let queue = RecordQueue::new(3);
        for n in 1..=5 {
            queue.push(n);
        }
        assert_eq!(queue.dropped(), 2);
        assert_eq!(queue.pop().await, Some(3));
        assert_eq!(queue.pop().await, Some(4));
        assert_eq!(queue.pop().await, Some(5));
    }

    #[tokio::test]
    async fn close_lets_consumer_drain() {
        let queue = RecordQueue::new(8);
        queue.push("a");
        queue.push("b");
        queue.close();
        assert_eq!(queue.pop().await, Some("a"));
        assert_eq!(queue.pop().await, Some("b"));
        assert_eq!(queue.pop().await, None);
    }

    #[tokio::test]
    async fn push_after_close_is_counted() {
        let queue = RecordQueue::new(8);
        queue.close();
        queue.push(1);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.pop().await, None);
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let queue = Arc::new(RecordQueue::new(4));
        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;
        queue.push(42);
        assert_eq!(consumer.await.unwrap(), Some(42));
    }
}
