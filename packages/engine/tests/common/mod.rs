// packages/engine/tests/common/mod.rs
//! Shared helpers for integration tests

#![allow(dead_code)]

use relaypool_engine::runtime::{initialize, LaunchCommand, WorkerPool};
use relaypool_engine::utils::config::{PoolConfig, SupervisorConfig};
use relaypool_engine::{EventBus, PipeFactory, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Launch command for the reference worker
pub fn echo_worker(args: &[&str]) -> LaunchCommand {
    LaunchCommand::new(env!("CARGO_BIN_EXE_echo_worker")).args(args.iter().copied())
}

pub fn pool_config(num_workers: u64, max_jobs: u64) -> PoolConfig {
    PoolConfig {
        num_workers,
        max_jobs,
        allocate_timeout: Duration::from_secs(10),
        destroy_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

pub fn supervised(num_workers: u64, supervisor: SupervisorConfig) -> PoolConfig {
    PoolConfig {
        supervisor: Some(supervisor),
        ..pool_config(num_workers, 0)
    }
}

/// Pipe-backed pool of reference workers
pub async fn start_pool(cmd: LaunchCommand, cfg: PoolConfig) -> Result<Arc<dyn WorkerPool>> {
    let events = EventBus::new();
    let factory = Arc::new(PipeFactory::new(events.clone()));
    initialize(cmd, factory, cfg, events).await
}

pub fn pids(pool: &dyn WorkerPool) -> Vec<u32> {
    let mut pids: Vec<u32> = pool.workers().iter().map(|w| w.pid()).collect();
    pids.sort_unstable();
    pids
}

/// Poll `check` every 20ms for up to `within`
pub async fn eventually<F: Fn() -> bool>(within: Duration, check: F) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// Whether a process with `pid` still exists
pub fn alive(pid: u32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None::<nix::sys::signal::Signal>).is_ok()
}
