// packages/engine/src/runtime/container.rs
//! Idle worker container
//!
//! FIFO: `pop` returns the worker that has been idle the longest, which
//! spreads load (and `num_execs`) evenly across the pool. A pid is held at
//! most once.

use crate::runtime::state::State;
use crate::runtime::worker::Worker;
use crate::utils::errors::{EngineError, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Instant;

pub struct Container {
    workers: Mutex<VecDeque<Arc<Worker>>>,

    available: Notify,

    destroyed: AtomicBool,
}

impl Container {
    pub fn new(capacity: usize) -> Self {
        Self {
            workers: Mutex::new(VecDeque::with_capacity(capacity)),
            available: Notify::new(),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Add an idle worker; returns false for a duplicate pid
    pub fn push(&self, worker: Arc<Worker>) -> bool {
        {
            let mut workers = self.workers.lock();
            if workers.iter().any(|w| w.pid() == worker.pid()) {
                return false;
            }
            workers.push_back(worker);
        }

        self.available.notify_one();
        true
    }

    /// Take the longest-idle worker, waiting until `deadline`
    pub async fn pop(&self, deadline: Instant) -> Result<Arc<Worker>> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_destroyed() {
                return Err(EngineError::WatcherStopped);
            }

            if let Some(worker) = self.workers.lock().pop_front() {
                return Ok(worker);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(EngineError::NoFreeWorkers);
            }
        }
    }

    /// Drop a worker by pid
    pub fn remove(&self, pid: u32) -> Option<Arc<Worker>> {
        let mut workers = self.workers.lock();
        let idx = workers.iter().position(|w| w.pid() == pid)?;
        workers.remove(idx)
    }

    /// Take out every worker that is no longer Ready
    pub fn drain_stale(&self) -> Vec<Arc<Worker>> {
        let mut workers = self.workers.lock();
        let mut stale = Vec::new();
        workers.retain(|w| {
            if w.state().value() == State::Ready {
                true
            } else {
                stale.push(Arc::clone(w));
                false
            }
        });
        stale
    }

    /// Stop handing out workers and wake every waiter
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
        self.available.notify_waiters();
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Pids of the idle workers, longest-idle first
    pub fn pids(&self) -> Vec<u32> {
        self.workers.lock().iter().map(|w| w.pid()).collect()
    }

    pub fn len(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.lock().is_empty()
    }
}
