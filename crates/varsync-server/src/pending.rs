//! Messages waiting for a polling connection's next response.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use varsync_core::Outgoing;

/// FIFO of outgoing items for one connection.
///
/// Items leave the queue only when a response carrying them is about to be
/// written; a failed write puts them back at the front.
#[derive(Default)]
pub struct PendingQueue {
    items: Mutex<VecDeque<Outgoing>>,
    notify: Notify,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, item: impl Into<Outgoing>) {
        self.items.lock().push_back(item.into());
        self.notify.notify_waiters();
    }

    pub fn push_all(&self, items: impl IntoIterator<Item = Outgoing>) {
        let mut queue = self.items.lock();
        let before = queue.len();
        queue.extend(items);
        let grew = queue.len() > before;
        drop(queue);
        if grew {
            self.notify.notify_waiters();
        }
    }

    pub fn drain(&self) -> Vec<Outgoing> {
        self.items.lock().drain(..).collect()
    }

    /// Put items back ahead of anything queued since they were drained.
    pub fn requeue_front(&self, items: Vec<Outgoing>) {
        if items.is_empty() {
            return;
        }
        let mut queue = self.items.lock();
        for item in items.into_iter().rev() {
            queue.push_front(item);
        }
        drop(queue);
        self.notify.notify_waiters();
    }

    /// Drain, waiting up to `wait` for the first item if the queue is empty.
    pub async fn poll(&self, wait: Duration) -> Vec<Outgoing> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let drained = self.drain();
            if !drained.is_empty() || Instant::now() >= deadline {
                return drained;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.drain();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use varsync_core::{Message, VarId};

    fn watch(id: i64) -> Outgoing {
        Message::watch(VarId(id)).into()
    }

    #[test]
    fn drain_empties_in_order() {
        let queue = PendingQueue::new();
        queue.push(Message::watch(VarId(1)));
        queue.push_all([watch(2), watch(3)]);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.drain(), vec![watch(1), watch(2), watch(3)]);
        assert!(queue.is_empty());
    }

    #[test]
    fn requeue_goes_ahead_of_newer_items() {
        let queue = PendingQueue::new();
        queue.push_all([watch(1), watch(2)]);
        let drained = queue.drain();
        queue.push(Message::watch(VarId(3)));
        queue.requeue_front(drained);
        assert_eq!(queue.drain(), vec![watch(1), watch(2), watch(3)]);
    }

    #[tokio::test]
    async fn zero_wait_returns_immediately() {
        let queue = PendingQueue::new();
        assert!(queue.poll(Duration::ZERO).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn poll_wakes_on_push() {
        let queue = Arc::new(PendingQueue::new());
        let producer = Arc::clone(&queue);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            producer.push(Message::watch(VarId(7)));
        });

        let start = Instant::now();
        let items = queue.poll(Duration::from_secs(5)).await;
        assert_eq!(items, vec![watch(7)]);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_times_out_empty() {
        let queue = PendingQueue::new();
        let start = Instant::now();
        let items = queue.poll(Duration::from_millis(250)).await;
        assert!(items.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(250));
    }
}
