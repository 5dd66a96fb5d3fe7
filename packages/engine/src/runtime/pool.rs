// packages/engine/src/runtime/pool.rs
//! Worker pool
//!
//! Dispatches payloads to pooled workers and applies the error policy:
//!
//! ```text
//! exec(payload)
//!   └─ watcher.get(allocate deadline) ──> worker.exec
//!        ├─ ok, stop sentinel   -> stop worker, retry once on a fresh one
//!        ├─ ok, max_jobs hit    -> retire (Invalid), release (killed, replaced)
//!        ├─ ok                  -> release
//!        ├─ soft error          -> release, or retire + stop at max_jobs
//!        └─ any other error     -> retire + kill, error returned as is
//! ```
//!
//! A worker drawn from the watcher is held in a [`Checkout`]. If the exec
//! future is dropped while it holds one, the worker is killed and the reaper
//! replaces it.
//!
//! # Debug mode
//!
//! No watcher-managed workers: every call spawns a worker, runs one payload
//! and stops it.

use crate::events::{EventBus, PoolEvent};
use crate::protocol::Payload;
use crate::runtime::command::LaunchCommand;
use crate::runtime::state::State;
use crate::runtime::supervisor::Supervisor;
use crate::runtime::watcher::{Allocator, Watcher};
use crate::runtime::worker::{Worker, WorkerInfo};
use crate::transport::WorkerFactory;
use crate::utils::config::PoolConfig;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Public scheduling surface
#[async_trait]
pub trait WorkerPool: Send + Sync {
    /// Run one payload on a free worker
    async fn exec(&self, payload: &Payload) -> Result<Payload>;

    /// As [`exec`](Self::exec), bounded by `deadline`
    async fn exec_with_deadline(&self, deadline: Instant, payload: &Payload) -> Result<Payload>;

    /// Snapshot of live workers
    fn workers(&self) -> Vec<Arc<Worker>>;

    /// Kill a worker by pid; it is replaced. False if unknown.
    fn remove_worker(&self, pid: u32) -> bool;

    /// Drain in-flight work and kill every worker
    async fn destroy(&self);

    fn config(&self) -> &PoolConfig;

    fn events(&self) -> &EventBus;

    fn worker_info(&self) -> Vec<WorkerInfo> {
        self.workers().iter().map(|w| w.info()).collect()
    }
}

/// Start a pool of `cfg.num_workers` workers.
///
/// Fails, leaving no processes behind, if any initial worker cannot be
/// spawned. With a supervisor section the supervised pool is returned.
pub async fn initialize(
    cmd: LaunchCommand,
    factory: Arc<dyn WorkerFactory>,
    mut cfg: PoolConfig,
    events: EventBus,
) -> Result<Arc<dyn WorkerPool>> {
    cfg.init_defaults();

    let pool = StaticPool::start(cmd, factory, cfg, events).await?;

    match pool.cfg.supervisor.clone() {
        Some(sv) => Ok(Supervisor::start(pool, sv)),
        None => Ok(pool),
    }
}

/// Worker taken out of the pool for one exec
struct Checkout {
    worker: Arc<Worker>,
    armed: bool,
}

impl Checkout {
    fn new(worker: Arc<Worker>) -> Self {
        Self { worker, armed: true }
    }

    /// Hand the worker back to normal accounting
    fn disarm(mut self) -> Arc<Worker> {
        self.armed = false;
        Arc::clone(&self.worker)
    }
}

impl std::ops::Deref for Checkout {
    type Target = Worker;

    fn deref(&self) -> &Worker {
        &self.worker
    }
}

impl Drop for Checkout {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        warn!("Exec on worker {} was cancelled, killing it", self.worker.pid());
        self.worker.state().set(State::Invalid);
        if let Err(e) = self.worker.kill() {
            warn!("Failed to kill worker {}: {}", self.worker.pid(), e);
        }
    }
}

/// Fixed-size pool
pub struct StaticPool {
    cfg: PoolConfig,

    watcher: Arc<Watcher>,

    allocator: Allocator,

    events: EventBus,
}

impl StaticPool {
    /// Spawn the initial workers and hand them to a watcher
    pub async fn start(
        cmd: LaunchCommand,
        factory: Arc<dyn WorkerFactory>,
        cfg: PoolConfig,
        events: EventBus,
    ) -> Result<Arc<Self>> {
        info!(
            "Initializing pool: {} workers, max_jobs {}, command '{}'",
            cfg.num_workers,
            cfg.max_jobs,
            cmd.display()
        );

        let allocator = pool_allocator(factory, cmd, cfg.allocate_timeout);
        let watcher = Watcher::new(
            Arc::clone(&allocator),
            cfg.num_workers,
            cfg.allocate_timeout,
            cfg.destroy_timeout,
            events.clone(),
        );

        let workers = allocate_workers(&allocator, cfg.num_workers).await?;
        watcher.watch(workers);

        Ok(Arc::new(Self {
            cfg,
            watcher,
            allocator,
            events,
        }))
    }

    pub fn watcher(&self) -> &Arc<Watcher> {
        &self.watcher
    }

    async fn run(&self, payload: &Payload, deadline: Option<Instant>) -> Result<Payload> {
        if payload.is_empty() {
            return Err(EngineError::EmptyPayload);
        }

        if self.cfg.debug {
            return self.exec_debug(payload, deadline).await;
        }

        let mut stop_retried = false;

        loop {
            let checkout = Checkout::new(self.get_worker(deadline).await?);

            let result = match deadline {
                Some(deadline) => checkout.exec_with_deadline(deadline, payload).await,
                None => checkout.exec(payload).await,
            };

            let response = match result {
                Ok(response) => response,
                // invalidated between get and exec; draw again
                Err(EngineError::WorkerNotReady { .. }) => {
                    self.watcher.release(checkout.disarm());
                    continue;
                }
                Err(e) => return Err(self.handle_error(checkout, e).await),
            };

            if response.is_stop_sentinel() {
                debug!("Worker {} requested stop", checkout.pid());
                self.retire_and_stop(checkout).await;

                if stop_retried {
                    return Err(EngineError::StopLoop);
                }
                stop_retried = true;
                continue;
            }

            self.finish(checkout.disarm());
            return Ok(response);
        }
    }

    async fn get_worker(&self, deadline: Option<Instant>) -> Result<Arc<Worker>> {
        let allocate_deadline = Instant::now() + self.cfg.allocate_timeout;
        let deadline = match deadline {
            Some(deadline) => deadline.min(allocate_deadline),
            None => allocate_deadline,
        };

        match self.watcher.get(deadline).await {
            Ok(worker) => Ok(worker),
            Err(EngineError::NoFreeWorkers) => {
                self.events.publish(PoolEvent::NoFreeWorkers);
                metrics::counter!("relaypool_exec_errors_total", "kind" => "no_free_workers").increment(1);
                Err(EngineError::NoFreeWorkers)
            }
            Err(e) => Err(e),
        }
    }

    fn max_jobs_reached(&self, worker: &Worker) -> bool {
        self.cfg.max_jobs > 0 && worker.state().num_execs() >= self.cfg.max_jobs
    }

    /// Return a worker after a successful exec
    fn finish(&self, worker: Arc<Worker>) {
        if self.max_jobs_reached(&worker) {
            debug!(
                "Worker {} reached max_jobs ({}), retiring",
                worker.pid(),
                self.cfg.max_jobs
            );
            worker.state().transition(State::Ready, State::Invalid);
        }

        self.watcher.release(worker);
    }

    async fn retire_and_stop(&self, checkout: Checkout) {
        checkout.state().set(State::Invalid);
        if let Err(e) = checkout.stop().await {
            self.events.publish(PoolEvent::WorkerError {
                pid: checkout.pid(),
                error: e.to_string(),
            });
        }
        checkout.disarm();
    }

    async fn handle_error(&self, checkout: Checkout, err: EngineError) -> EngineError {
        if err.is_soft() {
            if self.max_jobs_reached(&checkout) {
                self.retire_and_stop(checkout).await;
            } else {
                self.watcher.release(checkout.disarm());
            }
            return err;
        }

        let worker = checkout.disarm();
        warn!("Worker {} failed: {}", worker.pid(), err);
        worker.state().set(State::Invalid);
        self.events.publish(PoolEvent::WorkerDestruct { pid: worker.pid() });
        if let Err(e) = worker.kill() {
            warn!("Failed to kill worker {}: {}", worker.pid(), e);
        }

        err
    }

    async fn exec_debug(&self, payload: &Payload, deadline: Option<Instant>) -> Result<Payload> {
        let checkout = Checkout::new((self.allocator)().await?);

        let result = match deadline {
            Some(deadline) => checkout.exec_with_deadline(deadline, payload).await,
            None => checkout.exec(payload).await,
        };

        if let Err(e) = checkout.stop().await {
            self.events.publish(PoolEvent::WorkerError {
                pid: checkout.pid(),
                error: e.to_string(),
            });
        }

        let worker = checkout.disarm();
        tokio::spawn(async move {
            if let Err(e) = worker.wait().await {
                debug!("Debug worker {} exited: {}", worker.pid(), e);
            }
        });

        result
    }
}

#[async_trait]
impl WorkerPool for StaticPool {
    async fn exec(&self, payload: &Payload) -> Result<Payload> {
        self.run(payload, None).await
    }

    async fn exec_with_deadline(&self, deadline: Instant, payload: &Payload) -> Result<Payload> {
        self.run(payload, Some(deadline)).await
    }

    fn workers(&self) -> Vec<Arc<Worker>> {
        self.watcher.list()
    }

    fn remove_worker(&self, pid: u32) -> bool {
        match self.watcher.remove(pid) {
            Some(worker) => {
                self.events.publish(PoolEvent::WorkerDestruct { pid: worker.pid() });
                true
            }
            None => false,
        }
    }

    async fn destroy(&self) {
        self.watcher.destroy().await;
    }

    fn config(&self) -> &PoolConfig {
        &self.cfg
    }

    fn events(&self) -> &EventBus {
        &self.events
    }
}

fn pool_allocator(factory: Arc<dyn WorkerFactory>, cmd: LaunchCommand, timeout: Duration) -> Allocator {
    Arc::new(move || {
        let factory = Arc::clone(&factory);
        let cmd = cmd.clone();
        async move {
            factory
                .spawn_worker_with_timeout(Instant::now() + timeout, &cmd)
                .await
        }
        .boxed()
    })
}

async fn allocate_workers(allocator: &Allocator, num_workers: u64) -> Result<Vec<Arc<Worker>>> {
    let mut workers: Vec<Arc<Worker>> = Vec::with_capacity(num_workers as usize);

    for _ in 0..num_workers {
        match allocator().await {
            Ok(worker) => workers.push(worker),
            Err(e) => {
                warn!("Initial worker allocation failed: {}", e);
                let mut cleanup = Vec::with_capacity(workers.len() * 2);
                for worker in &workers {
                    cleanup.push(worker.kill());
                    cleanup.push(worker.wait().await);
                }

                let cause = match e {
                    EngineError::WorkerAllocate(_) => e,
                    other => EngineError::WorkerAllocate(other.to_string()),
                };
                return Err(EngineError::combine(cause, cleanup));
            }
        }
    }

    Ok(workers)
}
