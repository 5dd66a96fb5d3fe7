// packages/engine/src/runtime/watcher.rs
//! Worker watcher
//!
//! Owns the idle [`Container`] and the authoritative worker list, and keeps
//! the pool at its provisioned size:
//!
//! ```text
//!            get()                      release()
//! container ───────> caller ──exec──> Ready? ──yes──> container
//!     ^                                  │no
//!     │                                  └──> kill ──> reaper: wait()
//!     │                                                    │
//!     └──────────────── allocate() <── not Destroyed ──────┘
//! ```
//!
//! Every worker gets one reaper task that owns its `wait()`.

use crate::events::{EventBus, PoolEvent};
use crate::runtime::container::Container;
use crate::runtime::state::State;
use crate::runtime::worker::Worker;
use crate::utils::errors::{EngineError, Result};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Interval between allocation retries
const ALLOCATE_RETRY: Duration = Duration::from_millis(500);

/// Interval between drain checks in `destroy`
const DESTROY_POLL: Duration = Duration::from_millis(10);

/// How long `destroy` waits for killed workers to be reaped
const REAP_GRACE: Duration = Duration::from_secs(2);

/// Mints a new Ready worker
pub type Allocator = Arc<dyn Fn() -> BoxFuture<'static, Result<Arc<Worker>>> + Send + Sync>;

pub struct Watcher {
    container: Container,

    /// Every live worker, idle or busy
    workers: RwLock<Vec<Arc<Worker>>>,

    /// Target pool size; shrinks when a replacement cannot be allocated
    provisioned: AtomicU64,

    allocator: Allocator,

    allocate_timeout: Duration,

    destroy_timeout: Duration,

    events: EventBus,
}

impl Watcher {
    pub fn new(
        allocator: Allocator,
        num_workers: u64,
        allocate_timeout: Duration,
        destroy_timeout: Duration,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            container: Container::new(num_workers as usize),
            workers: RwLock::new(Vec::with_capacity(num_workers as usize)),
            provisioned: AtomicU64::new(num_workers),
            allocator,
            allocate_timeout,
            destroy_timeout,
            events,
        })
    }

    /// Start managing an initial set of Ready workers
    pub fn watch(self: &Arc<Self>, workers: Vec<Arc<Worker>>) {
        for worker in workers {
            self.workers.write().push(Arc::clone(&worker));
            self.container.push(Arc::clone(&worker));
            self.spawn_reaper(worker);
        }
    }

    /// Next Ready worker. Stale entries are killed and skipped.
    pub async fn get(&self, deadline: Instant) -> Result<Arc<Worker>> {
        loop {
            let worker = self.container.pop(deadline).await?;

            match worker.state().value() {
                State::Ready => return Ok(worker),
                State::Working => {
                    // still owned by an exec; leave it be
                    self.container.push(worker);
                    tokio::task::yield_now().await;
                }
                other => {
                    debug!("Discarding worker {} in state {}", worker.pid(), other);
                    if let Err(e) = worker.kill() {
                        warn!("Failed to kill stale worker {}: {}", worker.pid(), e);
                    }
                }
            }
        }
    }

    /// Return a worker after use; anything not Ready is killed
    pub fn release(&self, worker: Arc<Worker>) {
        match worker.state().value() {
            State::Ready => {
                self.container.push(worker);
            }
            other => {
                debug!("Worker {} released in state {}, killing", worker.pid(), other);
                if let Err(e) = worker.kill() {
                    warn!("Failed to kill worker {}: {}", worker.pid(), e);
                }
            }
        }
    }

    /// Mint one worker and put it to work.
    ///
    /// Boxed because reapers call back into it.
    pub fn allocate(self: &Arc<Self>) -> BoxFuture<'static, Result<()>> {
        let watcher = Arc::clone(self);

        Box::pin(async move {
            let worker = match watcher.allocate_with_retry().await {
                Ok(worker) => worker,
                Err(e) => {
                    watcher.shrink();
                    return Err(e);
                }
            };

            {
                let mut workers = watcher.workers.write();
                if watcher.container.is_destroyed() {
                    drop(workers);
                    watcher.shrink();
                    worker.state().set(State::Destroyed);
                    if let Err(e) = worker.kill() {
                        warn!("Failed to kill late worker {}: {}", worker.pid(), e);
                    }
                    watcher.spawn_reaper(worker);
                    return Err(EngineError::WatcherStopped);
                }
                workers.push(Arc::clone(&worker));
            }

            watcher.spawn_reaper(Arc::clone(&worker));
            watcher.release(worker);
            Ok(())
        })
    }

    async fn allocate_with_retry(&self) -> Result<Arc<Worker>> {
        if self.container.is_destroyed() {
            return Err(EngineError::WatcherStopped);
        }

        let mut last_err = match (self.allocator)().await {
            Ok(worker) => return Ok(worker),
            Err(e) => e,
        };

        self.events.publish(PoolEvent::PoolError {
            error: format!("can't allocate the worker: {}", last_err),
        });

        if self.allocate_timeout.is_zero() {
            return Err(EngineError::WorkerAllocate(last_err.to_string()));
        }

        let deadline = Instant::now() + self.allocate_timeout;
        let mut retry = tokio::time::interval_at(Instant::now() + ALLOCATE_RETRY, ALLOCATE_RETRY);

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(EngineError::WorkerAllocate(last_err.to_string()));
                }
                _ = retry.tick() => {
                    if self.container.is_destroyed() {
                        return Err(EngineError::WatcherStopped);
                    }

                    match (self.allocator)().await {
                        Ok(worker) => return Ok(worker),
                        Err(e) => {
                            self.events.publish(PoolEvent::PoolError {
                                error: format!("can't allocate the worker, retry attempt failed: {}", e),
                            });
                            last_err = e;
                        }
                    }
                }
            }
        }
    }

    fn shrink(&self) {
        let _ = self
            .provisioned
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Kill idle workers that were invalidated while sitting in the container
    pub fn sweep(&self) -> usize {
        let stale = self.container.drain_stale();
        for worker in &stale {
            debug!("Sweeping idle worker {} ({})", worker.pid(), worker.state().value());
            if let Err(e) = worker.kill() {
                warn!("Failed to kill worker {}: {}", worker.pid(), e);
            }
        }
        stale.len()
    }

    /// Drop a worker from bookkeeping and kill it
    pub fn remove(&self, pid: u32) -> Option<Arc<Worker>> {
        let removed = {
            let mut workers = self.workers.write();
            workers
                .iter()
                .position(|w| w.pid() == pid)
                .map(|idx| workers.remove(idx))
        };

        self.container.remove(pid);

        if let Some(worker) = &removed {
            if let Err(e) = worker.kill() {
                warn!("Failed to kill removed worker {}: {}", pid, e);
            }
        }

        removed
    }

    /// Stop intake, wait for in-flight work to come back, then kill everything.
    ///
    /// Bounded by the destroy timeout; on expiry busy workers are killed too.
    pub async fn destroy(&self) {
        info!("Destroying worker watcher");
        self.container.destroy();

        let deadline = Instant::now() + self.destroy_timeout;
        let mut poll = tokio::time::interval(DESTROY_POLL);
        loop {
            poll.tick().await;
            if self.is_drained() {
                break;
            }
            if Instant::now() >= deadline {
                warn!("Destroy timeout reached with busy workers, killing");
                break;
            }
        }

        let workers = self.workers.read().clone();
        for worker in &workers {
            worker.state().set(State::Destroyed);
            if let Err(e) = worker.kill() {
                warn!("Failed to kill worker {}: {}", worker.pid(), e);
            }
        }

        let reap_deadline = Instant::now() + REAP_GRACE;
        while !self.is_empty() && Instant::now() < reap_deadline {
            poll.tick().await;
        }

        info!("Worker watcher destroyed ({} workers)", workers.len());
    }

    /// Every provisioned worker exists and sits idle in the container
    fn is_drained(&self) -> bool {
        let workers = self.workers.read();
        workers.len() as u64 == self.provisioned.load(Ordering::Acquire)
            && self.container.len() == workers.len()
    }

    fn is_empty(&self) -> bool {
        self.workers.read().is_empty()
    }

    /// Snapshot of all live workers
    pub fn list(&self) -> Vec<Arc<Worker>> {
        self.workers.read().clone()
    }

    pub fn provisioned(&self) -> u64 {
        self.provisioned.load(Ordering::Acquire)
    }

    pub fn idle(&self) -> usize {
        self.container.len()
    }

    /// Idle workers plus busy workers that have not exited yet.
    ///
    /// Never exceeds the provisioned size.
    pub fn occupied(&self) -> usize {
        let workers = self.workers.read();
        let idle = self.container.pids();
        let busy = workers
            .iter()
            .filter(|w| !idle.contains(&w.pid()) && !w.state().value().is_terminal())
            .count();

        idle.len() + busy
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn spawn_reaper(self: &Arc<Self>, worker: Arc<Worker>) {
        let watcher = Arc::clone(self);
        tokio::spawn(async move { watcher.reap(worker).await });
    }

    async fn reap(self: Arc<Self>, worker: Arc<Worker>) {
        let pid = worker.pid();
        let result = worker.wait().await;

        if let Err(e) = &result {
            warn!("Worker {} stopped with error: {}", pid, e);
        }
        self.events.publish(PoolEvent::WorkerWaitExit {
            pid,
            error: result.err().map(|e| e.to_string()),
        });

        self.remove(pid);

        if worker.state().value() == State::Destroyed {
            debug!("Worker {} destroyed", pid);
            self.events.publish(PoolEvent::WorkerDestruct { pid });
            return;
        }

        worker.state().set(State::Stopped);

        match self.allocate().await {
            Ok(()) => {
                metrics::counter!("relaypool_worker_replaced_total").increment(1);
                debug!("Replaced worker {}", pid);
            }
            Err(EngineError::WatcherStopped) => {
                debug!("Worker {} not replaced, watcher stopped", pid);
            }
            Err(e) => {
                error!("Failed to replace worker {}: {}", pid, e);
                self.events.publish(PoolEvent::PoolError {
                    error: format!("failed to allocate worker: {}", e),
                });
            }
        }
    }
}
