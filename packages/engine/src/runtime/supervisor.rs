// packages/engine/src/runtime/supervisor.rs
//! Supervised pool
//!
//! Wraps a [`StaticPool`] with a policy loop that runs every `watch_tick`
//! and, per active worker, in order:
//!
//! 1. `ttl`: worker age
//! 2. `max_worker_memory`: resident memory (MiB)
//! 3. `idle_ttl`: time since last use, Ready workers only
//!
//! A violating worker is only marked Invalid. The watcher discards it on its
//! next draw or release; idle ones are swept from the container right away.
//! Executions are bounded by `exec_ttl` when set.

use crate::events::{EventBus, PoolEvent};
use crate::protocol::Payload;
use crate::runtime::memory;
use crate::runtime::pool::{StaticPool, WorkerPool};
use crate::runtime::state::{unix_nanos, State};
use crate::runtime::worker::Worker;
use crate::utils::config::{PoolConfig, SupervisorConfig};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

const MIB: u64 = 1024 * 1024;

pub struct Supervisor {
    pool: Arc<StaticPool>,

    cfg: SupervisorConfig,

    stop: Arc<Notify>,

    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    /// Wrap `pool` and start the policy loop
    pub fn start(pool: Arc<StaticPool>, mut cfg: SupervisorConfig) -> Arc<Self> {
        cfg.init_defaults();
        info!(
            "Starting supervisor: tick {:?}, ttl {:?}, idle_ttl {:?}, exec_ttl {:?}, max memory {} MiB",
            cfg.watch_tick, cfg.ttl, cfg.idle_ttl, cfg.exec_ttl, cfg.max_worker_memory
        );

        let stop = Arc::new(Notify::new());
        let task = tokio::spawn(control_loop(
            Arc::clone(&pool),
            cfg.clone(),
            Arc::clone(&stop),
        ));

        Arc::new(Self {
            pool,
            cfg,
            stop,
            task: parking_lot::Mutex::new(Some(task)),
        })
    }

    pub fn inner(&self) -> &Arc<StaticPool> {
        &self.pool
    }

    /// Stop the policy loop, leaving the pool running
    pub async fn stop(&self) {
        self.stop.notify_one();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Run one policy pass immediately
    pub fn control(&self) {
        control(&self.pool, &self.cfg);
    }
}

async fn control_loop(pool: Arc<StaticPool>, cfg: SupervisorConfig, stop: Arc<Notify>) {
    let mut tick = tokio::time::interval(cfg.watch_tick);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tick.tick() => control(&pool, &cfg),
            _ = stop.notified() => {
                debug!("Supervisor loop stopped");
                break;
            }
        }
    }
}

fn control(pool: &StaticPool, cfg: &SupervisorConfig) {
    let events = pool.events();
    let now = unix_nanos();
    let mut retired = 0;

    for worker in pool.workers() {
        let state = worker.state().value();
        if !state.is_active() {
            continue;
        }

        if !cfg.ttl.is_zero() && worker.age() >= cfg.ttl {
            if invalidate(&worker, state, "ttl") {
                events.publish(PoolEvent::Ttl { pid: worker.pid() });
                retired += 1;
            }
            continue;
        }

        if cfg.max_worker_memory > 0 {
            match memory::resident_bytes(worker.pid()) {
                Some(rss) if rss >= cfg.max_worker_memory.saturating_mul(MIB) => {
                    debug!(
                        "Worker {} uses {} MiB, limit {} MiB",
                        worker.pid(),
                        memory::bytes_to_mib(rss),
                        cfg.max_worker_memory
                    );
                    if invalidate(&worker, state, "max_memory") {
                        events.publish(PoolEvent::MaxMemory {
                            pid: worker.pid(),
                            rss_bytes: rss,
                        });
                        retired += 1;
                    }
                    continue;
                }
                Some(_) => {}
                None if cfg!(target_os = "linux") => {
                    events.publish(PoolEvent::SupervisorError {
                        error: format!("can't read memory usage of worker {}", worker.pid()),
                    });
                }
                None => {}
            }
        }

        if !cfg.idle_ttl.is_zero() && state == State::Ready {
            let idle = now.saturating_sub(worker.state().last_used());
            if idle > cfg.idle_ttl.as_nanos() as u64 && invalidate(&worker, state, "idle_ttl") {
                events.publish(PoolEvent::IdleTtl { pid: worker.pid() });
                retired += 1;
            }
        }
    }

    if retired > 0 {
        pool.watcher().sweep();
    }
}

/// Mark Invalid unless the worker changed state since it was observed
fn invalidate(worker: &Worker, observed: State, reason: &'static str) -> bool {
    if !worker.state().transition(observed, State::Invalid) {
        return false;
    }

    info!("Supervisor retiring worker {} ({})", worker.pid(), reason);
    metrics::counter!("relaypool_supervisor_invalidations_total", "reason" => reason).increment(1);
    true
}

#[async_trait]
impl WorkerPool for Supervisor {
    async fn exec(&self, payload: &Payload) -> Result<Payload> {
        if self.cfg.exec_ttl.is_zero() {
            return self.pool.exec(payload).await;
        }

        let deadline = Instant::now() + self.cfg.exec_ttl;
        match self.pool.exec_with_deadline(deadline, payload).await {
            Err(EngineError::ExecTTL) => Err(EngineError::Timeout(self.cfg.exec_ttl)),
            other => other,
        }
    }

    async fn exec_with_deadline(&self, deadline: Instant, payload: &Payload) -> Result<Payload> {
        if self.cfg.exec_ttl.is_zero() {
            return self.pool.exec_with_deadline(deadline, payload).await;
        }

        let ttl_deadline = Instant::now() + self.cfg.exec_ttl;
        if deadline < ttl_deadline {
            return self.pool.exec_with_deadline(deadline, payload).await;
        }

        match self.pool.exec_with_deadline(ttl_deadline, payload).await {
            Err(EngineError::ExecTTL) => Err(EngineError::Timeout(self.cfg.exec_ttl)),
            other => other,
        }
    }

    fn workers(&self) -> Vec<Arc<Worker>> {
        self.pool.workers()
    }

    fn remove_worker(&self, pid: u32) -> bool {
        self.pool.remove_worker(pid)
    }

    async fn destroy(&self) {
        self.stop().await;
        self.pool.destroy().await;
    }

    fn config(&self) -> &PoolConfig {
        self.pool.config()
    }

    fn events(&self) -> &EventBus {
        self.pool.events()
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::command::LaunchCommand;
    use crate::transport::WorkerFactory;
    use std::process::Stdio;
    use std::time::Duration;

    /// Spawns relay-less sleepers; enough for policy checks
    struct SleepFactory {
        events: EventBus,
    }

    #[async_trait]
    impl WorkerFactory for SleepFactory {
        async fn spawn_worker(&self, cmd: &LaunchCommand) -> Result<Arc<Worker>> {
            let child = tokio::process::Command::new("sleep")
                .arg("30")
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()?;
            let worker = Worker::new(child, cmd, self.events.clone())?;
            worker.mark_ready();
            Ok(Arc::new(worker))
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    async fn pool(n: u64) -> Arc<StaticPool> {
        let events = EventBus::new();
        let cfg = PoolConfig {
            num_workers: n,
            allocate_timeout: Duration::from_secs(2),
            destroy_timeout: Duration::from_secs(2),
            ..Default::default()
        };
        let factory = Arc::new(SleepFactory {
            events: events.clone(),
        });
        StaticPool::start(LaunchCommand::new("sleep"), factory, cfg, events)
            .await
            .unwrap()
    }

    fn pids(pool: &StaticPool) -> Vec<u32> {
        let mut pids: Vec<u32> = pool.workers().iter().map(|w| w.pid()).collect();
        pids.sort_unstable();
        pids
    }

    async fn eventually<F: Fn() -> bool>(check: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_ttl_retires_and_replaces_idle_workers() {
        let pool = pool(2).await;
        let before = pids(&pool);

        let sv = Supervisor::start(
            Arc::clone(&pool),
            SupervisorConfig {
                watch_tick: Duration::from_secs(3600),
                ttl: Duration::from_millis(1),
                ..Default::default()
            },
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        sv.control();

        assert!(
            eventually(|| {
                let now = pids(&pool);
                now.len() == 2 && now.iter().all(|pid| !before.contains(pid))
            })
            .await
        );

        sv.destroy().await;
    }

    #[tokio::test]
    async fn test_idle_ttl_skips_busy_workers() {
        let pool = pool(1).await;
        let worker = pool.workers()[0].clone();
        assert!(worker.state().transition(State::Ready, State::Working));
        worker.state().set_last_used(0);

        let sv = Supervisor::start(
            Arc::clone(&pool),
            SupervisorConfig {
                watch_tick: Duration::from_secs(3600),
                idle_ttl: Duration::from_millis(1),
                ..Default::default()
            },
        );
        sv.control();

        assert_eq!(worker.state().value(), State::Working);

        worker.state().set(State::Ready);
        sv.control();
        assert_ne!(worker.state().value(), State::Ready);

        sv.destroy().await;
    }

    #[tokio::test]
    async fn test_invalid_workers_are_left_alone() {
        let pool = pool(1).await;
        let worker = pool.workers()[0].clone();
        worker.state().set(State::Invalid);

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        pool.events().subscribe(move |record| sink.lock().push(record.event.name()));

        let sv = Supervisor::start(
            Arc::clone(&pool),
            SupervisorConfig {
                watch_tick: Duration::from_secs(3600),
                ttl: Duration::from_millis(1),
                ..Default::default()
            },
        );
        sv.control();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!seen.lock().contains(&"ttl"));
        sv.destroy().await;
    }

    #[tokio::test]
    async fn test_huge_memory_limit_keeps_worker() {
        let pool = pool(1).await;
        let worker = pool.workers()[0].clone();

        let sv = Supervisor::start(
            Arc::clone(&pool),
            SupervisorConfig {
                watch_tick: Duration::from_secs(3600),
                max_worker_memory: u64::MAX,
                ..Default::default()
            },
        );
        sv.control();

        assert_eq!(worker.state().value(), State::Ready);
        assert_eq!(pids(&pool), vec![worker.pid()]);
        sv.destroy().await;
    }

    #[tokio::test]
    async fn test_memory_limit_retires_worker() {
        let pool = pool(1).await;
        let pid = pool.workers()[0].pid();

        let rss = match memory::resident_bytes(pid) {
            Some(rss) if rss >= MIB => rss,
            _ => {
                pool.destroy().await;
                return;
            }
        };

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        pool.events().subscribe(move |record| {
            if let PoolEvent::MaxMemory { rss_bytes, .. } = record.event {
                sink.lock().push(rss_bytes);
            }
        });

        let sv = Supervisor::start(
            Arc::clone(&pool),
            SupervisorConfig {
                watch_tick: Duration::from_secs(3600),
                max_worker_memory: rss / MIB,
                ..Default::default()
            },
        );
        sv.control();

        assert!(eventually(|| !pids(&pool).contains(&pid)).await);
        assert!(eventually(|| !seen.lock().is_empty()).await);
        sv.destroy().await;
    }

    #[tokio::test]
    async fn test_destroy_stops_loop_and_pool() {
        let pool = pool(1).await;
        let sv = Supervisor::start(
            Arc::clone(&pool),
            SupervisorConfig {
                watch_tick: Duration::from_millis(10),
                ..Default::default()
            },
        );

        sv.destroy().await;
        assert!(sv.task.lock().is_none());
        assert!(eventually(|| pool.workers().is_empty()).await);
    }
}
