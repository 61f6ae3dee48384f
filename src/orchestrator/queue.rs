//! Bounded outbound message queue
//!
//! Holds messages published while no broker connection is usable. When full,
//! the oldest message is evicted to admit a new one.

use crate::transport::QoS;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

pub const MAX_QUEUE_SIZE: usize = 1000;

/// A message waiting for a broker connection
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retained: bool,
    pub enqueued_at: Instant,
}

impl QueuedMessage {
    pub fn new(topic: impl Into<String>, payload: Bytes, qos: QoS, retained: bool) -> Self {
        Self {
            topic: topic.into(),
            payload,
            qos,
            retained,
            enqueued_at: Instant::now(),
        }
    }
}

/// FIFO with a fixed capacity and drop-oldest overflow
///
/// The lock is only held for the duration of each call.
#[derive(Debug)]
pub struct MessageQueue {
    messages: Mutex<VecDeque<QueuedMessage>>,
    capacity: usize,
}

impl Default for MessageQueue {
    fn default() -> Self {
        Self::new(MAX_QUEUE_SIZE)
    }
}

impl MessageQueue {
    /// A zero capacity is raised to one
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            messages: Mutex::new(VecDeque::with_capacity(capacity.min(MAX_QUEUE_SIZE))),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<QueuedMessage>> {
        self.messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a message, returning the evicted oldest one when full
    pub fn enqueue(&self, message: QueuedMessage) -> Option<QueuedMessage> {
        let mut messages = self.lock();
        let evicted = if messages.len() >= self.capacity {
            messages.pop_front()
        } else {
            None
        };
        messages.push_back(message);
        evicted
    }

    pub fn pop_front(&self) -> Option<QueuedMessage> {
        self.lock().pop_front()
    }

    /// Put a message that failed to send back at the head
    ///
    /// When the queue filled up in the meantime the message is itself the
    /// oldest entry, so it is returned as evicted instead of being stored.
    pub fn requeue_front(&self, message: QueuedMessage) -> Option<QueuedMessage> {
        let mut messages = self.lock();
        if messages.len() >= self.capacity {
            return Some(message);
        }
        messages.push_front(message);
        None
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) -> usize {
        let mut messages = self.lock();
        let dropped = messages.len();
        messages.clear();
        dropped
    }

    /// Copy of the queued messages, oldest first
    pub fn snapshot(&self) -> Vec<QueuedMessage> {
        self.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn message(n: usize) -> QueuedMessage {
        QueuedMessage::new(
            format!("topic/{n}"),
            Bytes::from(n.to_string()),
            QoS::AtLeastOnce,
            false,
        )
    }

    fn topics(queue: &MessageQueue) -> Vec<String> {
        queue.snapshot().into_iter().map(|m| m.topic).collect()
    }

    #[test]
    fn test_fifo_order() {
        let queue = MessageQueue::new(10);
        for n in 0..3 {
            assert!(queue.enqueue(message(n)).is_none());
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop_front().unwrap().topic, "topic/0");
        assert_eq!(queue.pop_front().unwrap().topic, "topic/1");
        assert_eq!(queue.pop_front().unwrap().topic, "topic/2");
        assert!(queue.pop_front().is_none());
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let queue = MessageQueue::default();
        assert_eq!(queue.capacity(), MAX_QUEUE_SIZE);
        for n in 0..MAX_QUEUE_SIZE {
            assert!(queue.enqueue(message(n)).is_none());
        }

        let evicted = queue.enqueue(message(MAX_QUEUE_SIZE)).unwrap();
        assert_eq!(evicted.topic, "topic/0");
        assert_eq!(queue.len(), MAX_QUEUE_SIZE);

        let remaining = topics(&queue);
        assert_eq!(remaining.first().unwrap(), "topic/1");
        assert_eq!(remaining.last().unwrap(), &format!("topic/{MAX_QUEUE_SIZE}"));
    }

    #[test]
    fn test_requeue_front_restores_head() {
        let queue = MessageQueue::new(5);
        queue.enqueue(message(0));
        queue.enqueue(message(1));

        let head = queue.pop_front().unwrap();
        assert!(queue.requeue_front(head).is_none());
        assert_eq!(topics(&queue), vec!["topic/0", "topic/1"]);
    }

    #[test]
    fn test_requeue_into_full_queue_drops_requeued() {
        let queue = MessageQueue::new(2);
        queue.enqueue(message(0));
        let head = queue.pop_front().unwrap();
        queue.enqueue(message(1));
        queue.enqueue(message(2));

        let dropped = queue.requeue_front(head).unwrap();
        assert_eq!(dropped.topic, "topic/0");
        assert_eq!(topics(&queue), vec!["topic/1", "topic/2"]);
    }

    #[test]
    fn test_zero_capacity_raised_to_one() {
        let queue = MessageQueue::new(0);
        assert_eq!(queue.capacity(), 1);
        queue.enqueue(message(0));
        assert_eq!(queue.enqueue(message(1)).unwrap().topic, "topic/0");
    }

    #[test]
    fn test_clear() {
        let queue = MessageQueue::new(4);
        queue.enqueue(message(0));
        queue.enqueue(message(1));
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
    }

    proptest! {
        #[test]
        fn prop_never_exceeds_capacity_and_keeps_newest(capacity in 1usize..20, count in 0usize..60) {
            let queue = MessageQueue::new(capacity);
            for n in 0..count {
                queue.enqueue(message(n));
                prop_assert!(queue.len() <= capacity);
            }

            let expected: Vec<String> = (count.saturating_sub(capacity)..count)
                .map(|n| format!("topic/{n}"))
                .collect();
            prop_assert_eq!(topics(&queue), expected);
        }
    }
}
