use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;

use sentinel_core::config::OverflowPolicy;

/// Bounded per-channel record buffer.
///
/// `push` honors the channel's overflow policy: `Block` parks the producer
/// until space frees (which in turn blocks the upstream subscription), while
/// `DropOldest` discards the oldest buffered record and reports it so the
/// caller can count the drop.
pub struct ChannelBuffer<T> {
    inner: Mutex<VecDeque<T>>,
    capacity: usize,
    policy: OverflowPolicy,
    space: Notify,
    items: Notify,
}

impl<T> ChannelBuffer<T> {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.min(1_024))),
            capacity: capacity.max(1),
            policy,
            space: Notify::new(),
            items: Notify::new(),
        }
    }

    /// Push one item. Returns the number of records dropped to make room
    /// (only ever non-zero under `DropOldest`).
    pub async fn push(&self, item: T) -> usize {
        loop {
            let wait;
            {
                let mut queue = self.inner.lock().expect("buffer lock poisoned");
                if queue.len() < self.capacity {
                    queue.push_back(item);
                    self.items.notify_one();
                    return 0;
                }
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        queue.pop_front();
                        queue.push_back(item);
                        self.items.notify_one();
                        return 1;
                    }
                    OverflowPolicy::Block => {
                        wait = self.space.notified();
                    }
                }
            }
            wait.await;
        }
    }

    /// Non-blocking push for intake-style queues: `Err(item)` when full and
    /// the policy is `Block`, `Ok(dropped)` otherwise.
    pub fn try_push(&self, item: T) -> Result<usize, T> {
        let mut queue = self.inner.lock().expect("buffer lock poisoned");
        if queue.len() < self.capacity {
            queue.push_back(item);
            self.items.notify_one();
            return Ok(0);
        }
        match self.policy {
            OverflowPolicy::DropOldest => {
                queue.pop_front();
                queue.push_back(item);
                self.items.notify_one();
                Ok(1)
            }
            OverflowPolicy::Block => Err(item),
        }
    }

    /// Pop one item, waiting until one is available.
    pub async fn pop(&self) -> T {
        loop {
            let wait;
            {
                let mut queue = self.inner.lock().expect("buffer lock poisoned");
                if let Some(item) = queue.pop_front() {
                    self.space.notify_one();
                    return item;
                }
                wait = self.items.notified();
            }
            wait.await;
        }
    }

    /// Non-blocking pop for drain-on-shutdown.
    pub fn try_pop(&self) -> Option<T> {
        let mut queue = self.inner.lock().expect("buffer lock poisoned");
        let item = queue.pop_front();
        if item.is_some() {
            self.space.notify_one();
        }
        item
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("buffer lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn drop_oldest_discards_front() {
        let buffer = ChannelBuffer::new(2, OverflowPolicy::DropOldest);
        assert_eq!(buffer.push(1).await, 0);
        assert_eq!(buffer.push(2).await, 0);
        assert_eq!(buffer.push(3).await, 1);

        assert_eq!(buffer.pop().await, 2);
        assert_eq!(buffer.pop().await, 3);
    }

    #[tokio::test]
    async fn block_policy_parks_producer_until_space() {
        let buffer = Arc::new(ChannelBuffer::new(1, OverflowPolicy::Block));
        buffer.push(1).await;

        let producer = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move { buffer.push(2).await })
        };

        // Producer should be parked while the buffer is full
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());

        assert_eq!(buffer.pop().await, 1);
        assert_eq!(producer.await.unwrap(), 0);
        assert_eq!(buffer.pop().await, 2);
    }

    #[tokio::test]
    async fn try_pop_drains_without_blocking() {
        let buffer = ChannelBuffer::new(4, OverflowPolicy::Block);
        buffer.push("a").await;
        buffer.push("b").await;
        assert_eq!(buffer.try_pop(), Some("a"));
        assert_eq!(buffer.try_pop(), Some("b"));
        assert_eq!(buffer.try_pop(), None);
    }
}
