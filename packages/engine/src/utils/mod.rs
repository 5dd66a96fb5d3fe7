// packages/engine/src/utils/mod.rs
//! Shared error and configuration types

pub mod config;
pub mod errors;

pub use config::{EngineConfig, LoggingConfig, PoolConfig, ServerConfig, SupervisorConfig};
pub use errors::{EngineError, Result};
