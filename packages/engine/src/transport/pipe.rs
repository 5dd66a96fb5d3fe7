// packages/engine/src/transport/pipe.rs
//! Stdin/stdout relay

use crate::events::EventBus;
use crate::runtime::command::LaunchCommand;
use crate::runtime::worker::Worker;
use crate::transport::relay::Relay;
use crate::transport::{abort_spawn, confirm_pid, WorkerFactory};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use tracing::debug;

/// Spawns workers that speak the protocol on stdin/stdout
#[derive(Debug, Clone)]
pub struct PipeFactory {
    events: EventBus,
}

impl PipeFactory {
    pub fn new(events: EventBus) -> Self {
        Self { events }
    }
}

#[async_trait]
impl WorkerFactory for PipeFactory {
    async fn spawn_worker(&self, cmd: &LaunchCommand) -> Result<Arc<Worker>> {
        debug!("Spawning pipe worker: {}", cmd.display());

        let mut command = cmd.to_command("pipes");
        command.stdin(Stdio::piped()).stdout(Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|e| EngineError::ProcessSpawnFailed(format!("{}: {}", cmd.display(), e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::ProcessSpawnFailed("failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::ProcessSpawnFailed("failed to capture stdout".into()))?;

        let worker = Worker::new(child, cmd, self.events.clone())?;
        worker.attach_relay(Relay::new(stdout, stdin, "pipes"))?;

        if let Err(e) = confirm_pid(&worker).await {
            return Err(abort_spawn(&worker, e).await);
        }

        worker.mark_ready();
        Ok(Arc::new(worker))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
