//! Bounded FIFO of frames awaiting transmission

use std::collections::VecDeque;

use tokio::time::Instant;

use crate::config::OverflowPolicy;
use crate::error::ChatlinkError;

/// A serialized frame waiting for the channel
#[derive(Debug, Clone)]
pub struct QueuedFrame {
    /// Serialized JSON frame
    pub frame: String,
    /// Correlation id when the frame is a request
    pub request_id: Option<String>,
    /// When the frame was first queued
    pub enqueued_at: Instant,
}

impl QueuedFrame {
    /// Wrap a serialized frame.
    pub fn new(frame: String, request_id: Option<String>) -> Self {
        Self {
            frame,
            request_id,
            enqueued_at: Instant::now(),
        }
    }
}

/// Outbound queue with a size bound and overflow policy.
#[derive(Debug)]
pub struct OutboundQueue {
    frames: VecDeque<QueuedFrame>,
    capacity: usize,
    policy: OverflowPolicy,
}

impl OutboundQueue {
    /// Create an empty queue. A zero capacity is treated as one.
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            frames: VecDeque::new(),
            capacity: capacity.max(1),
            policy,
        }
    }

    /// Append a frame, applying the overflow policy when full.
    ///
    /// Returns the evicted frame under [`OverflowPolicy::DropOldest`].
    ///
    /// # Errors
    ///
    /// [`ChatlinkError::QueueFull`] under [`OverflowPolicy::RejectNew`].
    pub fn push(&mut self, frame: QueuedFrame) -> Result<Option<QueuedFrame>, ChatlinkError> {
        let mut evicted = None;
        if self.frames.len() >= self.capacity {
            match self.policy {
                OverflowPolicy::DropOldest => evicted = self.frames.pop_front(),
                OverflowPolicy::RejectNew => {
                    return Err(ChatlinkError::QueueFull {
                        capacity: self.capacity,
                    })
                }
            }
        }
        self.frames.push_back(frame);
        Ok(evicted)
    }

    /// Put a frame back at the head after a failed send.
    pub fn push_front(&mut self, frame: QueuedFrame) {
        self.frames.push_front(frame);
    }

    /// Oldest frame.
    pub fn pop_front(&mut self) -> Option<QueuedFrame> {
        self.frames.pop_front()
    }

    /// Remove everything, oldest first.
    pub fn drain_all(&mut self) -> Vec<QueuedFrame> {
        self.frames.drain(..).collect()
    }

    /// Number of queued frames.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(n: u32) -> QueuedFrame {
        QueuedFrame::new(format!("{{\"n\":{n}}}"), None)
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let mut queue = OutboundQueue::new(4, OverflowPolicy::DropOldest);
        for n in 0..3 {
            assert!(queue.push(frame(n)).unwrap().is_none());
        }
        let order: Vec<_> = queue.drain_all().into_iter().map(|f| f.frame).collect();
        assert_eq!(order, vec!["{\"n\":0}", "{\"n\":1}", "{\"n\":2}"]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_drop_oldest_evicts_head() {
        let mut queue = OutboundQueue::new(2, OverflowPolicy::DropOldest);
        queue.push(frame(0)).unwrap();
        queue.push(frame(1)).unwrap();
        let evicted = queue.push(frame(2)).unwrap().unwrap();
        assert_eq!(evicted.frame, "{\"n\":0}");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop_front().unwrap().frame, "{\"n\":1}");
    }

    #[tokio::test]
    async fn test_reject_new_keeps_queue() {
        let mut queue = OutboundQueue::new(1, OverflowPolicy::RejectNew);
        queue.push(frame(0)).unwrap();
        let err = queue.push(frame(1)).unwrap_err();
        assert!(matches!(err, ChatlinkError::QueueFull { capacity: 1 }));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_push_front_requeues_at_head() {
        let mut queue = OutboundQueue::new(4, OverflowPolicy::DropOldest);
        queue.push(frame(1)).unwrap();
        queue.push_front(frame(0));
        assert_eq!(queue.pop_front().unwrap().frame, "{\"n\":0}");
    }
}
