// packages/engine/src/events/mod.rs
//! Publish/subscribe bus for pool notifications
//!
//! Each component holds a clone of the [`EventBus`] it was built with; there
//! is no process-wide bus.
//!
//! ```text
//! publish() ──> EventQueue (bounded, lock-free) ──> dispatcher task ──> listeners
//! ```
//!
//! - `publish` never blocks; a full queue drops the event
//! - Listener call order is unspecified
//! - Without a tokio runtime, events are delivered inline

pub mod queue;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tracing::{trace, warn};
use ulid::Ulid;

pub use queue::{EventQueue, QueueStats};

/// Default queue capacity
pub const DEFAULT_CAPACITY: usize = 4096;

/// Notifications emitted by workers, the watcher, the pool and the supervisor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PoolEvent {
    WorkerConstruct { pid: u32 },
    WorkerDestruct { pid: u32 },
    WorkerError { pid: u32, error: String },
    /// Chunk of worker stderr
    WorkerLog { pid: u32, message: String },
    WorkerWaitExit { pid: u32, error: Option<String> },
    PoolError { error: String },
    NoFreeWorkers,
    ExecTtl { pid: u32 },
    Ttl { pid: u32 },
    IdleTtl { pid: u32 },
    MaxMemory { pid: u32, rss_bytes: u64 },
    SupervisorError { error: String },
}

impl PoolEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PoolEvent::WorkerConstruct { .. } => "worker_construct",
            PoolEvent::WorkerDestruct { .. } => "worker_destruct",
            PoolEvent::WorkerError { .. } => "worker_error",
            PoolEvent::WorkerLog { .. } => "worker_log",
            PoolEvent::WorkerWaitExit { .. } => "worker_wait_exit",
            PoolEvent::PoolError { .. } => "pool_error",
            PoolEvent::NoFreeWorkers => "no_free_workers",
            PoolEvent::ExecTtl { .. } => "exec_ttl",
            PoolEvent::Ttl { .. } => "ttl",
            PoolEvent::IdleTtl { .. } => "idle_ttl",
            PoolEvent::MaxMemory { .. } => "max_memory",
            PoolEvent::SupervisorError { .. } => "supervisor_error",
        }
    }

    pub fn pid(&self) -> Option<u32> {
        match self {
            PoolEvent::WorkerConstruct { pid }
            | PoolEvent::WorkerDestruct { pid }
            | PoolEvent::WorkerError { pid, .. }
            | PoolEvent::WorkerLog { pid, .. }
            | PoolEvent::WorkerWaitExit { pid, .. }
            | PoolEvent::ExecTtl { pid }
            | PoolEvent::Ttl { pid }
            | PoolEvent::IdleTtl { pid }
            | PoolEvent::MaxMemory { pid, .. } => Some(*pid),
            _ => None,
        }
    }
}

/// Event plus delivery metadata
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub id: Ulid,

    pub timestamp: DateTime<Utc>,

    #[serde(flatten)]
    pub event: PoolEvent,
}

/// Listener callback. Must not block.
pub type Listener = Arc<dyn Fn(&EventRecord) + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Ulid);

struct BusInner {
    queue: EventQueue<EventRecord>,
    listeners: RwLock<Vec<(SubscriptionId, Listener)>>,
    notify: Arc<Notify>,
    dispatcher_started: AtomicBool,
}

impl BusInner {
    fn drain(&self) {
        while let Some(record) = self.queue.try_pop() {
            let listeners: Vec<Listener> = self
                .listeners
                .read()
                .iter()
                .map(|(_, l)| Arc::clone(l))
                .collect();

            for listener in listeners {
                listener(&record);
            }
        }
    }
}

impl Drop for BusInner {
    fn drop(&mut self) {
        // wake the dispatcher so it sees the bus is gone
        self.notify.notify_one();
    }
}

/// Cloneable handle to one bus
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                queue: EventQueue::new(capacity),
                listeners: RwLock::new(Vec::new()),
                notify: Arc::new(Notify::new()),
                dispatcher_started: AtomicBool::new(false),
            }),
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&EventRecord) + Send + Sync + 'static,
    {
        let id = SubscriptionId(Ulid::new());
        self.inner.listeners.write().push((id, Arc::new(listener)));
        id
    }

    /// Returns false if the id was unknown
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.inner.listeners.write();
        let before = listeners.len();
        listeners.retain(|(sid, _)| *sid != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.read().len()
    }

    /// Queue an event for delivery
    pub fn publish(&self, event: PoolEvent) {
        trace!("Publishing {} event", event.name());

        let record = EventRecord {
            id: Ulid::new(),
            timestamp: Utc::now(),
            event,
        };

        if let Err(record) = self.inner.queue.push(record) {
            warn!("Event queue full, dropping {} event", record.event.name());
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                self.ensure_dispatcher(&handle);
                self.inner.notify.notify_one();
            }
            Err(_) => self.inner.drain(),
        }
    }

    pub fn stats(&self) -> QueueStats {
        self.inner.queue.stats()
    }

    fn ensure_dispatcher(&self, handle: &tokio::runtime::Handle) {
        if self.inner.dispatcher_started.swap(true, Ordering::AcqRel) {
            return;
        }

        let notify = Arc::clone(&self.inner.notify);
        let weak: Weak<BusInner> = Arc::downgrade(&self.inner);

        handle.spawn(async move {
            loop {
                notify.notified().await;
                match weak.upgrade() {
                    Some(inner) => inner.drain(),
                    None => break,
                }
            }
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listener_count())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[test]
    fn test_inline_delivery_without_runtime() {
        let bus = EventBus::new();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        bus.subscribe(move |record| sink.lock().push(record.event.clone()));

        bus.publish(PoolEvent::WorkerConstruct { pid: 1 });
        bus.publish(PoolEvent::NoFreeWorkers);

        assert_eq!(
            *seen.lock(),
            vec![PoolEvent::WorkerConstruct { pid: 1 }, PoolEvent::NoFreeWorkers]
        );
    }

    #[tokio::test]
    async fn test_dispatcher_delivers() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(move |record| {
            let _ = tx.send(record.event.clone());
        });

        bus.publish(PoolEvent::Ttl { pid: 7 });

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, PoolEvent::Ttl { pid: 7 });
        assert_eq!(event.pid(), Some(7));
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let id = bus.subscribe(|_| {});
        assert_eq!(bus.listener_count(), 1);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn test_full_queue_is_counted() {
        let bus = EventBus::with_capacity(1);
        // No runtime and no listener: the first publish drains inline, so the
        // queue never fills. Fill it directly instead.
        bus.inner
            .queue
            .push(EventRecord {
                id: Ulid::new(),
                timestamp: Utc::now(),
                event: PoolEvent::NoFreeWorkers,
            })
            .unwrap();

        bus.publish(PoolEvent::NoFreeWorkers);
        assert_eq!(bus.stats().drop_count, 1);
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let json = serde_json::to_value(PoolEvent::MaxMemory {
            pid: 3,
            rss_bytes: 1024,
        })
        .unwrap();
        assert_eq!(json["event"], "max_memory");
        assert_eq!(json["pid"], 3);
    }
}
