use crossbeam::queue::ArrayQueue;
use tokio::sync::Notify;

/// Bounded single-consumer queue that evicts the oldest item on overflow.
///
/// This is the coupling between the ingest path and its downstream consumers
/// (motion stage, event publisher): `push` never blocks and never fails, so
/// a slow consumer can only cost itself items, never stall the producer.
#[derive(Debug)]
pub struct DropOldestQueue<T> {
    items: ArrayQueue<T>,
    notify: Notify,
}

impl<T> DropOldestQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: ArrayQueue::new(capacity),
            notify: Notify::new(),
        }
    }

    /// Enqueue an item. When the queue is full the oldest pending item is
    /// evicted and returned so the caller can account for the drop.
    pub fn push(&self, item: T) -> Option<T> {
        let displaced = self.items.force_push(item);
        self.notify.notify_one();
        displaced
    }

    /// Dequeue without waiting.
    pub fn try_pop(&self) -> Option<T> {
        self.items.pop()
    }

    /// Dequeue, waiting for an item to arrive. Intended for a single
    /// consumer task; cancellation is handled by the caller's `select!`.
    pub async fn pop(&self) -> T {
        loop {
            if let Some(item) = self.items.pop() {
                return item;
            }
            let notified = self.notify.notified();
            // Re-check after registering the waiter so a push between the
            // first pop and `notified()` cannot be missed.
            if let Some(item) = self.items.pop() {
                return item;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
