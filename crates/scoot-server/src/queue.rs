//! Broadcast notification log.
//!
//! [`NotificationQueue`] is an append-only singly linked list. Appends are
//! serialized by a lock on the tail; every [`Subscription`] keeps its own
//! cursor into the list and reads nodes without consuming them, so all
//! subscribers see every value pushed after they subscribed, in order.
//!
//! Nodes that no cursor can reach any more are freed as the cursors move on.

use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

struct Node<T> {
    value: Option<Arc<T>>,
    next: OnceLock<Arc<Node<T>>>,
}

impl<T> Node<T> {
    fn new(value: Option<Arc<T>>) -> Self {
        Self {
            value,
            next: OnceLock::new(),
        }
    }
}

impl<T> Drop for Node<T> {
    // Unlink iteratively so freeing a long unread chain cannot overflow the
    // stack through recursive drops.
    fn drop(&mut self) {
        let mut next = self.next.take();
        while let Some(node) = next {
            match Arc::try_unwrap(node) {
                Ok(mut node) => next = node.next.take(),
                Err(_) => break,
            }
        }
    }
}

struct Shared<T> {
    tail: Mutex<Arc<Node<T>>>,
    appended: Notify,
}

pub struct NotificationQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for NotificationQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Default for NotificationQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> NotificationQueue<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                tail: Mutex::new(Arc::new(Node::new(None))),
                appended: Notify::new(),
            }),
        }
    }

    /// Appends `value` and wakes every waiting subscriber.
    pub fn push(&self, value: T) {
        let node = Arc::new(Node::new(Some(Arc::new(value))));
        {
            let mut tail = self.shared.tail.lock();
            // The tail never has a successor while the lock is held.
            let _ = tail.next.set(Arc::clone(&node));
            *tail = node;
        }
        self.shared.appended.notify_waiters();
    }

    /// Starts reading after the current tail.
    pub fn subscribe(&self) -> Subscription<T> {
        let cursor = Arc::clone(&self.shared.tail.lock());
        Subscription {
            shared: Arc::clone(&self.shared),
            cursor,
            closed: CancellationToken::new(),
        }
    }
}

pub struct Subscription<T> {
    shared: Arc<Shared<T>>,
    cursor: Arc<Node<T>>,
    closed: CancellationToken,
}

/// Closes a [`Subscription`] from another task.
#[derive(Clone, Debug)]
pub struct SubscriptionHandle {
    closed: CancellationToken,
}

impl SubscriptionHandle {
    /// Idempotent. Wakes a blocked [`Subscription::next`].
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl<T> Subscription<T> {
    pub fn handle(&self) -> SubscriptionHandle {
        SubscriptionHandle {
            closed: self.closed.clone(),
        }
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Returns the next value without waiting, if one is already appended.
    pub fn try_next(&mut self) -> Option<Arc<T>> {
        if self.closed.is_cancelled() {
            return None;
        }
        let next = Arc::clone(self.cursor.next.get()?);
        self.cursor = next;
        self.cursor.value.clone()
    }

    /// Waits for the next value; `None` once the subscription is closed.
    pub async fn next(&mut self) -> Option<Arc<T>> {
        let shared = Arc::clone(&self.shared);
        loop {
            let appended = shared.appended.notified();
            tokio::pin!(appended);
            // Register before looking so a push in between is not missed.
            appended.as_mut().enable();

            if self.closed.is_cancelled() {
                return None;
            }
            if let Some(value) = self.try_next() {
                return Some(value);
            }
            tokio::select! {
                () = &mut appended => {}
                () = self.closed.cancelled() => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn subscribers_only_see_later_pushes() {
        let queue = NotificationQueue::new();
        queue.push(1);
        queue.push(2);
        let mut sub = queue.subscribe();
        queue.push(3);
        queue.push(4);

        assert_eq!(*sub.next().await.unwrap(), 3);
        assert_eq!(*sub.next().await.unwrap(), 4);
        assert!(sub.try_next().is_none());
    }

    #[tokio::test]
    async fn every_subscriber_reads_every_value() {
        let queue = NotificationQueue::new();
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let mut sub = queue.subscribe();
                tokio::spawn(async move {
                    let mut got = Vec::new();
                    while got.len() < 100 {
                        got.push(*sub.next().await.unwrap());
                    }
                    got
                })
            })
            .collect();

        let writer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                for i in 0..100 {
                    queue.push(i);
                    if i % 10 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        };
        writer.await.unwrap();

        let expected: Vec<i32> = (0..100).collect();
        for reader in readers {
            assert_eq!(timeout(WAIT, reader).await.unwrap().unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn blocked_next_wakes_on_push() {
        let queue = NotificationQueue::new();
        let mut sub = queue.subscribe();
        let reader = tokio::spawn(async move { sub.next().await.map(|v| *v) });
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push("hello");
        assert_eq!(timeout(WAIT, reader).await.unwrap().unwrap(), Some("hello"));
    }

    #[tokio::test]
    async fn close_wakes_and_sticks() {
        let queue: NotificationQueue<u8> = NotificationQueue::new();
        let mut sub = queue.subscribe();
        let handle = sub.handle();
        let reader = tokio::spawn(async move {
            let first = sub.next().await;
            (sub, first)
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.close();
        handle.close();

        let (mut sub, first) = timeout(WAIT, reader).await.unwrap().unwrap();
        assert!(first.is_none());
        assert!(handle.is_closed());

        queue.push(7);
        assert!(sub.next().await.is_none());
        assert!(sub.try_next().is_none());
    }

    #[test]
    fn long_unread_chains_drop_without_recursion() {
        let queue = NotificationQueue::new();
        let sub = queue.subscribe();
        for i in 0..200_000u32 {
            queue.push(i);
        }
        drop(queue);
        drop(sub);
    }

    #[test]
    fn pushes_from_many_threads_are_all_delivered() {
        let queue = NotificationQueue::new();
        let mut sub = queue.subscribe();
        std::thread::scope(|s| {
            for t in 0..4u32 {
                let queue = &queue;
                s.spawn(move || {
                    for i in 0..500 {
                        queue.push(t * 1000 + i);
                    }
                });
            }
        });
        let mut seen = Vec::new();
        while let Some(v) = sub.try_next() {
            seen.push(*v);
        }
        assert_eq!(seen.len(), 2000);
        // Per-producer order is preserved.
        for t in 0..4u32 {
            let mine: Vec<_> = seen.iter().filter(|&&v| v / 1000 == t).collect();
            assert!(mine.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
