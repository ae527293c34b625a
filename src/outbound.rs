//! Frames waiting for the socket while the link is down.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use crate::protocol::AudioFrame;

/// What to do when the queue is full and another frame arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Evict the oldest queued frame to make room.
    DropOldest,
    /// Refuse the incoming frame.
    DropNewest,
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drop_oldest" => Ok(OverflowPolicy::DropOldest),
            "drop_newest" => Ok(OverflowPolicy::DropNewest),
            other => Err(format!("unknown overflow policy: {}", other)),
        }
    }
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverflowPolicy::DropOldest => f.write_str("drop_oldest"),
            OverflowPolicy::DropNewest => f.write_str("drop_newest"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuePolicy {
    pub capacity: usize,
    pub overflow: OverflowPolicy,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        // 256 x 50ms ≈ 12.8s of speech
        Self {
            capacity: 256,
            overflow: OverflowPolicy::DropOldest,
        }
    }
}

/// Bounded FIFO; insertion order is send order.
#[derive(Debug)]
pub struct OutboundQueue {
    frames: VecDeque<AudioFrame>,
    policy: QueuePolicy,
    dropped: u64,
}

impl OutboundQueue {
    pub fn new(policy: QueuePolicy) -> Self {
        Self {
            frames: VecDeque::with_capacity(policy.capacity.min(1024)),
            policy,
            dropped: 0,
        }
    }

    /// Append a frame. Returns the frame that was dropped to honor the cap.
    pub fn push(&mut self, frame: AudioFrame) -> Option<AudioFrame> {
        if self.policy.capacity == 0 {
            self.dropped += 1;
            return Some(frame);
        }
        if self.frames.len() < self.policy.capacity {
            self.frames.push_back(frame);
            return None;
        }
        self.dropped += 1;
        match self.policy.overflow {
            OverflowPolicy::DropOldest => {
                let evicted = self.frames.pop_front();
                self.frames.push_back(frame);
                evicted
            }
            OverflowPolicy::DropNewest => Some(frame),
        }
    }

    /// Put back a frame that failed to send so it goes out first next time.
    pub fn requeue_front(&mut self, frame: AudioFrame) {
        self.frames.push_front(frame);
        if self.frames.len() > self.policy.capacity {
            self.frames.pop_back();
            self.dropped += 1;
        }
    }

    pub fn pop(&mut self) -> Option<AudioFrame> {
        self.frames.pop_front()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frames lost to the capacity limit over this queue's lifetime.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: &str) -> AudioFrame {
        AudioFrame::new(tag.to_string())
    }

    fn drain(queue: &mut OutboundQueue) -> Vec<String> {
        std::iter::from_fn(|| queue.pop())
            .map(|f| f.data().to_string())
            .collect()
    }

    #[test]
    fn fifo_order() {
        let mut queue = OutboundQueue::new(QueuePolicy::default());
        for tag in ["a", "b", "c"] {
            assert!(queue.push(frame(tag)).is_none());
        }
        assert_eq!(drain(&mut queue), ["a", "b", "c"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn drop_oldest_evicts_head() {
        let mut queue = OutboundQueue::new(QueuePolicy {
            capacity: 2,
            overflow: OverflowPolicy::DropOldest,
        });
        queue.push(frame("a"));
        queue.push(frame("b"));
        let evicted = queue.push(frame("c")).unwrap();
        assert_eq!(evicted.data(), "a");
        assert_eq!(queue.dropped(), 1);
        assert_eq!(drain(&mut queue), ["b", "c"]);
    }

    #[test]
    fn drop_newest_refuses_incoming() {
        let mut queue = OutboundQueue::new(QueuePolicy {
            capacity: 2,
            overflow: OverflowPolicy::DropNewest,
        });
        queue.push(frame("a"));
        queue.push(frame("b"));
        let refused = queue.push(frame("c")).unwrap();
        assert_eq!(refused.data(), "c");
        assert_eq!(drain(&mut queue), ["a", "b"]);
    }

    #[test]
    fn requeue_goes_first() {
        let mut queue = OutboundQueue::new(QueuePolicy {
            capacity: 2,
            overflow: OverflowPolicy::DropOldest,
        });
        queue.push(frame("b"));
        queue.push(frame("c"));
        queue.requeue_front(frame("a"));
        assert_eq!(drain(&mut queue), ["a", "b"]);
    }

    #[test]
    fn parses_policy_names() {
        assert_eq!("drop_oldest".parse(), Ok(OverflowPolicy::DropOldest));
        assert_eq!("drop_newest".parse(), Ok(OverflowPolicy::DropNewest));
        assert!("evict".parse::<OverflowPolicy>().is_err());
        assert_eq!(OverflowPolicy::DropNewest.to_string(), "drop_newest");
    }
}
