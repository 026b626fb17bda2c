//! Rate limiting of item and progress deliveries to the page.

use crate::types::ids::SessionKey;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;

/// Time-windowed item batcher.
///
/// The first item pushed into an empty buffer arms the flush deadline; later items ride along
/// until [`CoalescingBuffer::take`] empties the buffer and disarms it.
#[derive(Debug)]
pub struct CoalescingBuffer {
    items: Vec<Value>,
    deadline: Option<Instant>,
    delay: Duration,
}

impl CoalescingBuffer {
    pub fn new(delay: Duration) -> Self {
        Self {
            items: Vec::new(),
            deadline: None,
            delay,
        }
    }

    pub fn push<I>(&mut self, items: I, now: Instant)
    where
        I: IntoIterator<Item = Value>,
    {
        let before = self.items.len();
        self.items.extend(items);
        if self.items.len() > before && self.deadline.is_none() {
            self.deadline = Some(now + self.delay);
        }
    }

    /// Flush deadline, `None` while nothing is buffered
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| d <= now)
    }

    pub fn take(&mut self) -> Vec<Value> {
        self.deadline = None;
        std::mem::take(&mut self.items)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Per-session progress throttle.
#[derive(Debug)]
pub struct ProgressThrottle {
    min_interval: Duration,
    last_delivery: DashMap<SessionKey, Instant>,
}

impl ProgressThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_delivery: DashMap::new(),
        }
    }

    /// Whether a progress notification may go out now; records the delivery if so.
    ///
    /// A notification that completes the run (`done >= total`, total known) always passes.
    pub fn admit(&self, key: &SessionKey, done: u64, total: u64, now: Instant) -> bool {
        let completes = total > 0 && done >= total;
        match self.last_delivery.entry(key.clone()) {
            Entry::Vacant(vacant) => {
                vacant.insert(now);
                true
            }
            Entry::Occupied(mut last) => {
                if completes || now.duration_since(*last.get()) >= self.min_interval {
                    last.insert(now);
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn forget(&self, key: &SessionKey) {
        self.last_delivery.remove(key);
    }

    pub fn tracked_sessions(&self) -> usize {
        self.last_delivery.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn test_buffer_arms_once() {
        let mut buffer = CoalescingBuffer::new(Duration::from_millis(40));
        assert!(buffer.deadline().is_none());

        let t0 = Instant::now();
        buffer.push(vec![json!({"id": 1})], t0);
        let deadline = buffer.deadline().unwrap();
        assert_eq!(deadline, t0 + Duration::from_millis(40));

        tokio::time::advance(Duration::from_millis(10)).await;
        buffer.push(vec![json!({"id": 2})], Instant::now());
        assert_eq!(buffer.deadline(), Some(deadline));
        assert!(!buffer.is_due(Instant::now()));

        tokio::time::advance(Duration::from_millis(30)).await;
        assert!(buffer.is_due(Instant::now()));

        let batch = buffer.take();
        assert_eq!(batch.len(), 2);
        assert!(buffer.is_empty());
        assert!(buffer.deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_push_does_not_arm() {
        let mut buffer = CoalescingBuffer::new(Duration::from_millis(40));
        buffer.push(Vec::new(), Instant::now());
        assert!(buffer.deadline().is_none());
        assert_eq!(buffer.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_suppresses_within_interval() {
        let throttle = ProgressThrottle::new(Duration::from_millis(50));
        let key = SessionKey::new("/r", "t1");

        assert!(throttle.admit(&key, 1, 10, Instant::now()));
        tokio::time::advance(Duration::from_millis(10)).await;
        assert!(!throttle.admit(&key, 2, 10, Instant::now()));
        tokio::time::advance(Duration::from_millis(45)).await;
        assert!(throttle.admit(&key, 3, 10, Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_completion_bypass() {
        let throttle = ProgressThrottle::new(Duration::from_millis(50));
        let key = SessionKey::new("/r", "t1");

        assert!(throttle.admit(&key, 9, 10, Instant::now()));
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(throttle.admit(&key, 10, 10, Instant::now()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_is_per_session() {
        let throttle = ProgressThrottle::new(Duration::from_millis(50));
        let a = SessionKey::new("/r", "t1");
        let b = SessionKey::new("/r", "t2");

        assert!(throttle.admit(&a, 1, 10, Instant::now()));
        assert!(throttle.admit(&b, 1, 10, Instant::now()));
        assert_eq!(throttle.tracked_sessions(), 2);

        throttle.forget(&a);
        assert_eq!(throttle.tracked_sessions(), 1);
    }
}
