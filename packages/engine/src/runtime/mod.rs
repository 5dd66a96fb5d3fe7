// packages/engine/src/runtime/mod.rs
//! Worker runtime
//!
//! - **Worker**: one external process bound to a relay, with an atomic state
//! - **Container**: FIFO of idle workers
//! - **Watcher**: keeps the pool at its provisioned size, replaces dead workers
//! - **Pool**: dispatches payloads and applies the error policy
//! - **Supervisor**: TTL, idle TTL, memory and exec deadline policies
//!
//! # Architecture
//!
//! ```text
//!        exec(payload)
//!             │
//!   ┌─────────▼──────────┐   policy tick   ┌────────────┐
//!   │     Supervisor     │◄────────────────│ /proc statm│
//!   └─────────┬──────────┘                 └────────────┘
//!   ┌─────────▼──────────┐
//!   │     StaticPool     │
//!   └─────────┬──────────┘
//!   ┌─────────▼──────────┐  reaper: wait() -> allocate()
//!   │      Watcher       │◄──────────────────────────┐
//!   │  ┌──────────────┐  │                           │
//!   │  │  Container   │──┼──> Worker ──relay──> process
//!   │  └──────────────┘  │
//!   └────────────────────┘
//! ```

pub mod command;
pub mod container;
pub mod exec;
pub mod memory;
pub mod pool;
pub mod state;
pub mod supervisor;
pub mod watcher;
pub mod worker;

pub use command::LaunchCommand;
pub use container::Container;
pub use pool::{initialize, StaticPool, WorkerPool};
pub use state::{State, WorkerState};
pub use supervisor::Supervisor;
pub use watcher::{Allocator, Watcher};
pub use worker::{Worker, WorkerInfo};
