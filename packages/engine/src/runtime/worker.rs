// packages/engine/src/runtime/worker.rs
//! One external worker process
//!
//! A worker bundles:
//! - the OS process (tokio `Child`, reaped once by `wait`)
//! - its [`Relay`], attached after spawn
//! - lock-free [`WorkerState`]
//! - a background task draining stderr into a bounded buffer and the event bus
//!
//! `kill` only signals. The process is reaped by whoever owns `wait`, which
//! for pooled workers is the watcher's reaper task.

use crate::events::{EventBus, PoolEvent};
use crate::protocol::control::StopCommand;
use crate::runtime::command::LaunchCommand;
use crate::runtime::memory;
use crate::runtime::state::{State, WorkerState};
use crate::transport::relay::Relay;
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, TimeZone, Utc};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Bytes of stderr kept for the exit error
pub const STDERR_LIMIT: usize = 64 * 1024;

/// How long `wait` lets the stderr task finish after exit
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// A spawned worker process
pub struct Worker {
    pid: u32,

    created: Instant,

    created_at: DateTime<Utc>,

    /// Process handle, locked only by `wait`
    child: Mutex<Child>,

    relay: OnceCell<Relay>,

    state: WorkerState,

    /// Set once `wait` has collected the exit status
    reaped: AtomicBool,

    stderr: Arc<parking_lot::Mutex<String>>,

    stderr_task: parking_lot::Mutex<Option<JoinHandle<()>>>,

    events: EventBus,

    command: String,
}

impl Worker {
    /// Wrap a freshly spawned child. The worker starts Inactive.
    pub fn new(mut child: Child, command: &LaunchCommand, events: EventBus) -> Result<Self> {
        let pid = child.id().ok_or_else(|| {
            EngineError::ProcessSpawnFailed("process exited before its pid was read".into())
        })?;

        let stderr = Arc::new(parking_lot::Mutex::new(String::new()));
        let stderr_task = child.stderr.take().map(|pipe| {
            tokio::spawn(drain_stderr(
                pid,
                pipe,
                Arc::clone(&stderr),
                events.clone(),
            ))
        });

        debug!("Worker process {} started: {}", pid, command.display());

        Ok(Self {
            pid,
            created: Instant::now(),
            created_at: Utc::now(),
            child: Mutex::new(child),
            relay: OnceCell::new(),
            state: WorkerState::new(State::Inactive),
            reaped: AtomicBool::new(false),
            stderr,
            stderr_task: parking_lot::Mutex::new(stderr_task),
            events,
            command: command.display(),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> &WorkerState {
        &self.state
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn attach_relay(&self, relay: Relay) -> Result<()> {
        self.relay
            .set(relay)
            .map_err(|_| EngineError::RuntimeError(format!("worker {} already has a relay", self.pid)))
    }

    pub fn relay(&self) -> Result<&Relay> {
        self.relay.get().ok_or(EngineError::RelayNotAttached)
    }

    /// Handshake done: the worker may take payloads
    pub fn mark_ready(&self) {
        self.state.touch();
        self.state.set(State::Ready);
        metrics::counter!("relaypool_worker_spawned_total").increment(1);
        self.events.publish(PoolEvent::WorkerConstruct { pid: self.pid });
        info!("Worker {} ready", self.pid);
    }

    /// Buffered stderr (tail)
    pub fn stderr_output(&self) -> String {
        self.stderr.lock().clone()
    }

    /// Block until the process exits, then close the relay.
    ///
    /// Resulting state:
    /// - Destroyed stays Destroyed and the exit is not an error
    /// - Killing / Stopping become Stopped
    /// - otherwise Stopped on a clean exit, Errored on a failed exit or a
    ///   relay that did not close cleanly
    pub async fn wait(&self) -> Result<()> {
        let status = {
            let mut child = self.child.lock().await;
            child.wait().await
        };
        self.reaped.store(true, Ordering::Release);

        let drain = self.stderr_task.lock().take();
        if let Some(task) = drain {
            if tokio::time::timeout(STDERR_DRAIN_TIMEOUT, task).await.is_err() {
                debug!("Worker {} stderr still open after exit", self.pid);
            }
        }

        let relay_closed = match self.relay.get() {
            Some(relay) => relay.close().await,
            None => Ok(()),
        };

        let prior = self.state.value();
        match prior {
            State::Destroyed => return Ok(()),
            State::Killing | State::Stopping => {
                self.state.set(State::Stopped);
                return Ok(());
            }
            _ => {}
        }

        let status = match status {
            Ok(status) => status,
            Err(e) => {
                self.state.set(State::Errored);
                return Err(e.into());
            }
        };

        if status.success() {
            return match relay_closed {
                Ok(()) => {
                    debug!("Worker {} exited cleanly", self.pid);
                    self.state.set(State::Stopped);
                    Ok(())
                }
                Err(e) => {
                    self.state.set(State::Errored);
                    Err(e)
                }
            };
        }

        self.state.set(State::Errored);
        warn!("Worker {} exited with {} while {}", self.pid, status, prior);

        Err(EngineError::combine(
            EngineError::ProcessExited {
                pid: self.pid,
                status: status.to_string(),
                stderr: self.stderr_output(),
            },
            [relay_closed],
        ))
    }

    /// Ask the worker to exit; escalates to `kill` if the request cannot be sent
    pub async fn stop(&self) -> Result<()> {
        if self.reaped.load(Ordering::Acquire) {
            return Ok(());
        }

        self.state.set(State::Stopping);
        debug!("Stopping worker {}", self.pid);

        let sent = match self.relay() {
            Ok(relay) => relay.send_control(&StopCommand::new()).await,
            Err(e) => Err(e),
        };

        match sent {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("Graceful stop of worker {} failed: {}, killing", self.pid, e);
                self.state.set(State::Killing);
                let killed = self.kill();
                Err(EngineError::combine(e, [killed]))
            }
        }
    }

    /// Non-blocking exit check; a finished process counts as reaped
    pub async fn has_exited(&self) -> bool {
        let mut child = self.child.lock().await;
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!("Worker {} already exited with {}", self.pid, status);
                self.reaped.store(true, Ordering::Release);
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!("Checking worker {} failed: {}", self.pid, e);
                true
            }
        }
    }

    /// Send SIGKILL. Does not reap; safe to repeat.
    pub fn kill(&self) -> Result<()> {
        if self.reaped.load(Ordering::Acquire) {
            return Ok(());
        }

        if self.state.value() != State::Destroyed {
            self.state.set(State::Killing);
        }

        match kill(Pid::from_raw(self.pid as i32), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(EngineError::RuntimeError(format!(
                "failed to kill worker {}: {}",
                self.pid, e
            ))),
        }
    }

    /// Introspection snapshot
    pub fn info(&self) -> WorkerInfo {
        WorkerInfo {
            pid: self.pid,
            state: self.state.value(),
            num_execs: self.state.num_execs(),
            created_at: self.created_at,
            last_used: Utc.timestamp_nanos(self.state.last_used() as i64),
            rss_bytes: memory::resident_bytes(self.pid),
            relay: self.relay.get().map(Relay::kind).unwrap_or("none"),
            command: self.command.clone(),
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("pid", &self.pid)
            .field("state", &self.state.value())
            .field("num_execs", &self.state.num_execs())
            .finish()
    }
}

/// Point-in-time view of a worker
#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub pid: u32,
    pub state: State,
    pub num_execs: u64,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub rss_bytes: Option<u64>,
    pub relay: &'static str,
    pub command: String,
}

async fn drain_stderr(
    pid: u32,
    mut pipe: ChildStderr,
    buffer: Arc<parking_lot::Mutex<String>>,
    events: EventBus,
) {
    let mut chunk = vec![0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let text = String::from_utf8_lossy(&chunk[..n]).into_owned();
                debug!("worker {} stderr: {}", pid, text.trim_end());
                append_bounded(&mut buffer.lock(), &text, STDERR_LIMIT);
                events.publish(PoolEvent::WorkerLog { pid, message: text });
            }
            Err(e) => {
                warn!("Reading stderr of worker {} failed: {}", pid, e);
                break;
            }
        }
    }
}

/// Append keeping at most `limit` bytes, dropping from the front
fn append_bounded(buffer: &mut String, text: &str, limit: usize) {
    buffer.push_str(text);
    if buffer.len() <= limit {
        return;
    }

    let mut cut = buffer.len() - limit;
    while !buffer.is_char_boundary(cut) {
        cut += 1;
    }
    buffer.drain(..cut);
}
