// packages/engine/src/lib.rs
//! Relaypool Engine Library
//!
//! Keeps a pool of long-lived external worker processes and exchanges
//! framed, CRC-checked messages with them over pipes or sockets.
//!
//! # Architecture
//!
//! - **protocol**: frame layout, codec and control messages
//! - **transport**: relays and the factories that spawn workers onto them
//! - **runtime**: workers, watcher, pool and supervisor
//! - **events**: publish/subscribe bus for pool notifications
//! - **observability**: tracing setup
//! - **utils**: configuration and errors
//!
//! # Example
//!
//! ```no_run
//! use relaypool_engine::{initialize, EventBus, LaunchCommand, Payload, PipeFactory, PoolConfig};
//! use std::sync::Arc;
//!
//! # async fn run() -> relaypool_engine::Result<()> {
//! let events = EventBus::new();
//! let factory = Arc::new(PipeFactory::new(events.clone()));
//! let cmd = LaunchCommand::new("php").arg("worker.php");
//!
//! let pool = initialize(cmd, factory, PoolConfig::default(), events).await?;
//! let reply = pool.exec(&Payload::body("hello")).await?;
//! println!("{}", reply.body_text());
//! pool.destroy().await;
//! # Ok(())
//! # }
//! ```

pub mod events;
pub mod observability;
pub mod protocol;
pub mod runtime;
pub mod transport;
pub mod utils;

// Re-export commonly used types
pub use events::{EventBus, EventRecord, PoolEvent, SubscriptionId};
pub use protocol::{Frame, FrameCodec, Payload};
pub use runtime::{initialize, LaunchCommand, State, StaticPool, Supervisor, Worker, WorkerPool};
pub use transport::{PipeFactory, SocketFactory, WorkerFactory};
pub use utils::config::{EngineConfig, PoolConfig, ServerConfig, SupervisorConfig};
pub use utils::errors::{EngineError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
