// packages/engine/src/transport/mod.rs
//! Worker factories
//!
//! A factory spawns a process from a [`LaunchCommand`], attaches a [`Relay`]
//! and confirms the relay belongs to that process before handing back a
//! Ready [`Worker`]. A spawn that fails half way kills the process and
//! returns every error it hit.
//!
//! - [`pipe::PipeFactory`]: relay over the child's stdin/stdout
//! - [`socket::SocketFactory`]: the child dials back over TCP or a unix socket

pub mod pipe;
pub mod relay;
pub mod socket;

use crate::events::EventBus;
use crate::runtime::command::LaunchCommand;
use crate::runtime::worker::Worker;
use crate::utils::config::{RelayKind, ServerConfig};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

pub use pipe::PipeFactory;
pub use relay::Relay;
pub use socket::SocketFactory;

/// Spawns workers bound to a relay
#[async_trait]
pub trait WorkerFactory: Send + Sync {
    /// Spawn and handshake one worker
    async fn spawn_worker(&self, cmd: &LaunchCommand) -> Result<Arc<Worker>>;

    /// As [`spawn_worker`](Self::spawn_worker), abandoned at `deadline`.
    ///
    /// An abandoned child is killed when its handle drops.
    async fn spawn_worker_with_timeout(
        &self,
        deadline: Instant,
        cmd: &LaunchCommand,
    ) -> Result<Arc<Worker>> {
        match tokio::time::timeout_at(deadline, self.spawn_worker(cmd)).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::WorkerAllocate(format!(
                "spawning '{}' exceeded the allocation timeout",
                cmd.display()
            ))),
        }
    }

    /// Release listener resources
    async fn close(&self) -> Result<()>;
}

/// Build the factory selected by `server.relay`
pub async fn from_config(server: &ServerConfig, events: EventBus) -> Result<Arc<dyn WorkerFactory>> {
    let factory: Arc<dyn WorkerFactory> = match server.relay_kind()? {
        RelayKind::Pipes => Arc::new(PipeFactory::new(events)),
        RelayKind::Tcp(addr) => {
            Arc::new(SocketFactory::bind_tcp(&addr, server.relay_timeout, events).await?)
        }
        RelayKind::Unix(path) => {
            Arc::new(SocketFactory::bind_unix(&path, server.relay_timeout, events).await?)
        }
    };

    Ok(factory)
}

/// Kill and reap a worker whose spawn failed, folding cleanup errors into `cause`
pub(crate) async fn abort_spawn(worker: &Worker, cause: EngineError) -> EngineError {
    warn!("Spawn of worker {} failed: {}", worker.pid(), cause);
    let killed = worker.kill();
    let waited = worker.wait().await;
    EngineError::combine(cause, [killed, waited])
}

/// Pid handshake over an attached relay
pub(crate) async fn confirm_pid(worker: &Worker) -> Result<()> {
    let reported = worker.relay()?.fetch_pid().await?;
    if reported != worker.pid() {
        return Err(EngineError::PidMismatch {
            expected: worker.pid(),
            actual: reported,
        });
    }

    debug!("Worker {} confirmed its pid", reported);
    Ok(())
}
