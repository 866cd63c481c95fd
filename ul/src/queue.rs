//! Blocking queues used between the provider loop and the layers above.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// An unbounded multi-producer queue with blocking and peeking consumers.
///
/// Within one association the queues are effectively
/// single-producer/single-consumer:
/// the provider loop fills `to_user` and drains `from_user`,
/// and the layer above does the reverse.
#[derive(Debug, Default)]
pub struct SyncQueue<T> {
    items: Mutex<VecDeque<T>>,
    available: Condvar,
}

impl<T> SyncQueue<T> {
    pub fn new() -> Self {
        SyncQueue {
            items: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }

    /// Push an item to the back of the queue.
    pub fn push(&self, item: T) {
        let mut items = self.items.lock().unwrap();
        items.push_back(item);
        self.available.notify_one();
    }

    /// Pop the front item if one is immediately available.
    pub fn try_pop(&self) -> Option<T> {
        self.items.lock().unwrap().pop_front()
    }

    /// Pop the front item,
    /// waiting up to `timeout` for one to arrive
    /// (or indefinitely when `timeout` is `None`).
    pub fn pop_timeout(&self, timeout: Option<Duration>) -> Option<T> {
        let mut items = self.items.lock().unwrap();
        match timeout {
            Some(timeout) => {
                let deadline = std::time::Instant::now() + timeout;
                while items.is_empty() {
                    let remaining = deadline.saturating_duration_since(std::time::Instant::now());
                    if remaining.is_zero() {
                        return None;
                    }
                    let (guard, result) = self.available.wait_timeout(items, remaining).unwrap();
                    items = guard;
                    if result.timed_out() && items.is_empty() {
                        return None;
                    }
                }
                items.pop_front()
            }
            None => {
                while items.is_empty() {
                    items = self.available.wait(items).unwrap();
                }
                items.pop_front()
            }
        }
    }

    /// The number of queued items.
    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    /// Whether the queue is currently empty.
    pub fn is_empty(&self) -> bool {
        self.items.lock().unwrap().is_empty()
    }
}

impl<T: Clone> SyncQueue<T> {
    /// Look at the front item without consuming it.
    pub fn peek(&self) -> Option<T> {
        self.items.lock().unwrap().front().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::SyncQueue;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn push_pop_in_order() {
        let queue = SyncQueue::new();
        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.try_pop(), Some(1));
        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.try_pop(), Some(3));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn peek_does_not_consume() {
        let queue = SyncQueue::new();
        queue.push(7);
        assert_eq!(queue.peek(), Some(7));
        assert_eq!(queue.peek(), Some(7));
        assert_eq!(queue.try_pop(), Some(7));
        assert_eq!(queue.peek(), None);
    }

    #[test]
    fn pop_timeout_expires_when_empty() {
        let queue: SyncQueue<u8> = SyncQueue::new();
        let popped = queue.pop_timeout(Some(Duration::from_millis(5)));
        assert_eq!(popped, None);
    }

    #[test]
    fn pop_timeout_wakes_on_push() {
        let queue = Arc::new(SyncQueue::new());
        let producer = Arc::clone(&queue);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            producer.push(42);
        });
        let popped = queue.pop_timeout(Some(Duration::from_secs(5)));
        assert_eq!(popped, Some(42));
        handle.join().unwrap();
    }
}
