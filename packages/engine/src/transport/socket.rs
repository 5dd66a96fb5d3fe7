// packages/engine/src/transport/socket.rs
//! TCP / unix-socket relay
//!
//! The factory owns a listener. Spawned workers dial back to it; an accept
//! loop performs the pid handshake on each connection and parks the relay in
//! a pid-keyed map until the matching `spawn_worker` call claims it:
//!
//! ```text
//! spawn_worker(cmd)                     accept loop
//!   spawn child (pid P)                   accept() -> stream
//!   poll map[P] every 10ms  <───────────  fetch_pid() == P, map.insert(P, relay)
//!   attach relay, Ready
//! ```
//!
//! Accept order and spawn order may interleave freely. A parked relay that
//! nobody claims within the relay timeout is evicted and closed.

use crate::events::EventBus;
use crate::runtime::command::LaunchCommand;
use crate::runtime::worker::Worker;
use crate::transport::relay::Relay;
use crate::transport::{abort_spawn, WorkerFactory};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UnixListener};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Interval between checks of the pending relay map
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Handshaken relay waiting to be claimed
struct Parked {
    relay: Relay,
    since: Instant,
}

/// Bound listener
pub enum SocketListener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl SocketListener {
    async fn accept(&self) -> std::io::Result<Relay> {
        match self {
            SocketListener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                debug!("Accepted tcp relay from {}", peer);
                stream.set_nodelay(true)?;
                let (r, w) = stream.into_split();
                Ok(Relay::new(r, w, "tcp"))
            }
            SocketListener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                debug!("Accepted unix relay");
                let (r, w) = stream.into_split();
                Ok(Relay::new(r, w, "unix"))
            }
        }
    }
}

/// Spawns workers that connect back over a socket
pub struct SocketFactory {
    /// Address handed to workers (`tcp://...` / `unix://...`)
    address: String,

    /// Handshaken relays waiting for their `spawn_worker` call
    relays: Arc<DashMap<u32, Parked>>,

    relay_timeout: Duration,

    accept_loop: parking_lot::Mutex<Option<JoinHandle<()>>>,

    unix_path: Option<PathBuf>,

    events: EventBus,
}

impl SocketFactory {
    /// Listen on a TCP address; port 0 picks a free port
    pub async fn bind_tcp(addr: &str, relay_timeout: Duration, events: EventBus) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let address = format!("tcp://{}", listener.local_addr()?);
        info!("Socket relay listening on {}", address);

        Ok(Self::start(SocketListener::Tcp(listener), address, None, relay_timeout, events))
    }

    /// Listen on a unix socket, replacing a stale socket file
    pub async fn bind_unix(path: &Path, relay_timeout: Duration, events: EventBus) -> Result<Self> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;
        let address = format!("unix://{}", path.display());
        info!("Socket relay listening on {}", address);

        Ok(Self::start(
            SocketListener::Unix(listener),
            address,
            Some(path.to_path_buf()),
            relay_timeout,
            events,
        ))
    }

    fn start(
        listener: SocketListener,
        address: String,
        unix_path: Option<PathBuf>,
        relay_timeout: Duration,
        events: EventBus,
    ) -> Self {
        let relays = Arc::new(DashMap::new());
        let accept_loop = tokio::spawn(accept_loop(listener, Arc::clone(&relays), relay_timeout));

        Self {
            address,
            relays,
            relay_timeout,
            accept_loop: parking_lot::Mutex::new(Some(accept_loop)),
            unix_path,
            events,
        }
    }

    /// Address workers dial
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Relays handshaken but not yet claimed
    pub fn pending(&self) -> usize {
        self.relays.len()
    }

    async fn claim_relay(&self, worker: &Worker) -> Result<Relay> {
        let deadline = Instant::now() + self.relay_timeout;

        loop {
            if let Some((_, parked)) = self.relays.remove(&worker.pid()) {
                return Ok(parked.relay);
            }

            if worker.has_exited().await {
                return Err(EngineError::WorkerAllocate(format!(
                    "worker {} exited before connecting",
                    worker.pid()
                )));
            }

            if Instant::now() >= deadline {
                return Err(EngineError::WorkerAllocate(format!(
                    "worker {} did not connect within {:?}",
                    worker.pid(),
                    self.relay_timeout
                )));
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

async fn accept_loop(listener: SocketListener, relays: Arc<DashMap<u32, Parked>>, relay_timeout: Duration) {
    let mut sweep = tokio::time::interval(relay_timeout.max(POLL_INTERVAL));
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = sweep.tick() => {
                evict_stale(&relays, relay_timeout);
                continue;
            }
        };

        let relay = match accepted {
            Ok(relay) => relay,
            Err(e) => {
                warn!("Relay accept failed: {}", e);
                tokio::time::sleep(POLL_INTERVAL).await;
                continue;
            }
        };

        let relays = Arc::clone(&relays);
        tokio::spawn(async move {
            match tokio::time::timeout(relay_timeout, relay.fetch_pid()).await {
                Ok(Ok(pid)) => {
                    let parked = Parked { relay, since: Instant::now() };
                    if let Some(replaced) = relays.insert(pid, parked) {
                        warn!("Relay for pid {} replaced an unclaimed one", pid);
                        close_parked(pid, replaced);
                    }
                }
                Ok(Err(e)) => warn!("Relay handshake failed: {}", e),
                Err(_) => warn!("Relay handshake timed out"),
            }
        });
    }
}

/// Drop parked relays older than `max_age`, returns how many went
fn evict_stale(relays: &DashMap<u32, Parked>, max_age: Duration) -> usize {
    let now = Instant::now();
    let stale: Vec<u32> = relays
        .iter()
        .filter(|entry| now.duration_since(entry.value().since) >= max_age)
        .map(|entry| *entry.key())
        .collect();

    let mut evicted = 0;
    for pid in stale {
        // a claim may have raced us
        if let Some((_, parked)) = relays.remove_if(&pid, |_, parked| now.duration_since(parked.since) >= max_age) {
            warn!("Evicting relay for pid {}: unclaimed after {:?}", pid, max_age);
            close_parked(pid, parked);
            evicted += 1;
        }
    }
    evicted
}

fn close_parked(pid: u32, parked: Parked) {
    tokio::spawn(async move {
        if let Err(e) = parked.relay.close().await {
            debug!("Closing relay for pid {} failed: {}", pid, e);
        }
    });
}

#[async_trait]
impl WorkerFactory for SocketFactory {
    async fn spawn_worker(&self, cmd: &LaunchCommand) -> Result<Arc<Worker>> {
        debug!("Spawning socket worker: {} ({})", cmd.display(), self.address);

        let mut command = cmd.to_command(&self.address);
        command.stdin(Stdio::null()).stdout(Stdio::null());

        let child = command
            .spawn()
            .map_err(|e| EngineError::ProcessSpawnFailed(format!("{}: {}", cmd.display(), e)))?;

        let worker = Worker::new(child, cmd, self.events.clone())?;

        let relay = match self.claim_relay(&worker).await {
            Ok(relay) => relay,
            Err(e) => {
                self.relays.remove(&worker.pid());
                return Err(abort_spawn(&worker, e).await);
            }
        };

        if let Err(e) = worker.attach_relay(relay) {
            return Err(abort_spawn(&worker, e).await);
        }

        worker.mark_ready();
        Ok(Arc::new(worker))
    }

    async fn close(&self) -> Result<()> {
        if let Some(handle) = self.accept_loop.lock().take() {
            handle.abort();
        }
        self.relays.clear();

        if let Some(path) = &self.unix_path {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        info!("Socket relay {} closed", self.address);
        Ok(())
    }
}

impl Drop for SocketFactory {
    fn drop(&mut self) {
        if let Some(handle) = self.accept_loop.lock().take() {
            handle.abort();
        }
    }
}
