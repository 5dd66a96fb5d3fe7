// packages/engine/src/events/queue.rs
//! Bounded lock-free event queue
//!
//! Publishers never block: when the queue is full the event is dropped and
//! counted.

use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};

/// Bounded MPMC queue with push/pop/drop counters
pub struct EventQueue<T> {
    queue: ArrayQueue<T>,

    push_count: AtomicU64,

    pop_count: AtomicU64,

    /// Events rejected because the queue was full
    drop_count: AtomicU64,
}

impl<T> EventQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            push_count: AtomicU64::new(0),
            pop_count: AtomicU64::new(0),
            drop_count: AtomicU64::new(0),
        }
    }

    /// Push without blocking; hands the event back when full
    pub fn push(&self, event: T) -> Result<(), T> {
        match self.queue.push(event) {
            Ok(()) => {
                self.push_count.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(event) => {
                self.drop_count.fetch_add(1, Ordering::Relaxed);
                Err(event)
            }
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        let event = self.queue.pop()?;
        self.pop_count.fetch_add(1, Ordering::Relaxed);
        Some(event)
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            push_count: self.push_count.load(Ordering::Relaxed),
            pop_count: self.pop_count.load(Ordering::Relaxed),
            drop_count: self.drop_count.load(Ordering::Relaxed),
            current_size: self.queue.len(),
            capacity: self.queue.capacity(),
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Events accepted
    pub push_count: u64,

    /// Events handed to the dispatcher
    pub pop_count: u64,

    /// Events dropped (queue full)
    pub drop_count: u64,

    pub current_size: usize,

    pub capacity: usize,
}

impl QueueStats {
    pub fn drop_rate(&self) -> f64 {
        let offered = self.push_count + self.drop_count;
        if offered == 0 {
            0.0
        } else {
            (self.drop_count as f64 / offered as f64) * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_push_pop_counts() {
        let queue = EventQueue::new(4);
        queue.push(1u32).unwrap();
        queue.push(2).unwrap();
        assert_eq!(queue.try_pop(), Some(1));

        let stats = queue.stats();
        assert_eq!(stats.push_count, 2);
        assert_eq!(stats.pop_count, 1);
        assert_eq!(stats.current_size, 1);
    }

    #[test]
    fn test_full_queue_drops() {
        let queue = EventQueue::new(2);
        queue.push("a").unwrap();
        queue.push("b").unwrap();
        assert_eq!(queue.push("c"), Err("c"));

        let stats = queue.stats();
        assert_eq!(stats.drop_count, 1);
        assert!(stats.drop_rate() > 33.0 && stats.drop_rate() < 34.0);
    }

    #[test]
    fn test_concurrent_producers() {
        let queue = Arc::new(EventQueue::new(1000));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let q = Arc::clone(&queue);
                std::thread::spawn(move || {
                    for j in 0..200 {
                        let _ = q.push(i * 1000 + j);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let stats = queue.stats();
        assert_eq!(stats.push_count + stats.drop_count, 1600);
        assert_eq!(stats.push_count, 1000);
    }
}
