// packages/engine/src/main.rs
//! Relaypool Engine runner
//!
//! Starts a (supervised) pool from configuration, sends every stdin line to
//! it as a payload body and prints the response bodies to stdout.

use anyhow::{Context, Result};
use relaypool_engine::observability::init_tracing;
use relaypool_engine::runtime::{initialize, LaunchCommand};
use relaypool_engine::transport;
use relaypool_engine::utils::config::EngineConfig;
use relaypool_engine::{EventBus, Payload};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = EngineConfig::load().context("failed to load configuration")?;

    init_tracing(&config.logging)?;
    info!("Starting Relaypool Engine v{}", env!("CARGO_PKG_VERSION"));

    let events = EventBus::new();
    events.subscribe(|record| {
        tracing::debug!(target: "relaypool::events", id = %record.id, "{}", record.event.name());
    });

    let factory = transport::from_config(&config.server, events.clone()).await?;
    let cmd = LaunchCommand::from_server_config(&config.server)?;

    let pool = match initialize(cmd, factory.clone(), config.pool.clone(), events).await {
        Ok(pool) => pool,
        Err(e) => {
            factory.close().await?;
            return Err(e).context("failed to start the worker pool");
        }
    };
    info!("Pool ready with {} workers", pool.workers().len());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, cleaning up...");
                break;
            }
        };

        let Some(line) = line else {
            break;
        };
        if line.is_empty() {
            continue;
        }

        match pool.exec(&Payload::body(line)).await {
            Ok(reply) => {
                stdout.write_all(&reply.body).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
            }
            Err(e) if e.is_soft() => warn!("Job failed: {}", e),
            Err(e) => error!("Execution failed: {}", e),
        }
    }

    pool.destroy().await;
    factory.close().await?;
    info!("Engine stopped");

    Ok(())
}
