// packages/engine/src/utils/config.rs
//! Engine configuration
//!
//! Loaded with the `config` crate from an optional file and environment
//! overrides:
//!
//! ```text
//! relaypool.yaml            (or the path in RELAYPOOL_CONFIG)
//! RELAYPOOL__POOL__NUM_WORKERS=4
//! RELAYPOOL__POOL__SUPERVISOR__IDLE_TTL=30s
//! ```
//!
//! Durations accept integers (seconds) or strings with a `ms`, `s`, `m` or
//! `h` suffix.

use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Environment variable pointing at the config file
pub const CONFIG_PATH_ENV: &str = "RELAYPOOL_CONFIG";

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "RELAYPOOL";

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker launch + relay settings
    pub server: ServerConfig,

    /// Pool behaviour
    pub pool: PoolConfig,

    /// Logging
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from file (if present) and environment
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| "relaypool".to_string());
        Self::load_from(&path)
    }

    /// Load configuration from a specific file stem/path plus environment
    pub fn load_from(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(" ")
                    .with_list_parse_key("server.command"),
            )
            .build()?;

        let mut cfg: EngineConfig = settings.try_deserialize()?;
        cfg.pool.init_defaults();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<()> {
        self.server.relay_kind()?;

        if let Some(sv) = &self.pool.supervisor {
            if sv.watch_tick.is_zero() {
                return Err(EngineError::InvalidConfig(
                    "supervisor.watch_tick must be positive".into(),
                ));
            }
        }

        Ok(())
    }
}

/// How the engine launches workers and talks to them
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Program followed by its arguments
    pub command: Vec<String>,

    /// Extra environment for the worker process
    pub env: HashMap<String, String>,

    /// `pipes`, `tcp://host:port` or `unix:///path/to.sock`
    pub relay: String,

    /// How long a socket worker may take to dial back
    #[serde(with = "duration_serde")]
    pub relay_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            command: vec![],
            env: HashMap::new(),
            relay: "pipes".to_string(),
            relay_timeout: Duration::from_secs(60),
        }
    }
}

/// Parsed relay address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayKind {
    Pipes,
    Tcp(String),
    Unix(std::path::PathBuf),
}

impl ServerConfig {
    /// Parse the `relay` field
    pub fn relay_kind(&self) -> Result<RelayKind> {
        let relay = self.relay.trim();
        if relay.is_empty() || relay == "pipes" || relay == "pipe" {
            return Ok(RelayKind::Pipes);
        }
        if let Some(addr) = relay.strip_prefix("tcp://") {
            return Ok(RelayKind::Tcp(addr.to_string()));
        }
        if let Some(path) = relay.strip_prefix("unix://") {
            return Ok(RelayKind::Unix(path.into()));
        }

        Err(EngineError::InvalidConfig(format!(
            "unknown relay '{}', expected pipes, tcp://host:port or unix:///path",
            relay
        )))
    }
}

/// Pool behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Spawn a fresh worker for every payload
    pub debug: bool,

    /// Number of workers kept alive (0 = number of CPUs)
    pub num_workers: u64,

    /// Executions allowed per worker before rotation (0 = unlimited)
    pub max_jobs: u64,

    /// How long to wait for a free worker (and for a spawn to complete)
    #[serde(with = "duration_serde")]
    pub allocate_timeout: Duration,

    /// How long destroy waits for in-flight executions before killing
    #[serde(with = "duration_serde")]
    pub destroy_timeout: Duration,

    /// Policy loop; disabled when absent
    pub supervisor: Option<SupervisorConfig>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            debug: false,
            num_workers: 0,
            max_jobs: 0,
            allocate_timeout: Duration::from_secs(60),
            destroy_timeout: Duration::from_secs(60),
            supervisor: None,
        }
    }
}

impl PoolConfig {
    /// Fill zero values with defaults
    pub fn init_defaults(&mut self) {
        if self.num_workers == 0 && !self.debug {
            self.num_workers = std::thread::available_parallelism()
                .map(|n| n.get() as u64)
                .unwrap_or(1);
        }

        if self.allocate_timeout.is_zero() {
            self.allocate_timeout = Duration::from_secs(60);
        }

        if self.destroy_timeout.is_zero() {
            self.destroy_timeout = Duration::from_secs(60);
        }

        if self.debug {
            self.num_workers = 0;
            self.max_jobs = 1;
        }

        if let Some(sv) = self.supervisor.as_mut() {
            sv.init_defaults();
        }
    }
}

/// Supervisor limits. A zero duration or size disables that check.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Interval between policy scans
    #[serde(with = "duration_serde")]
    pub watch_tick: Duration,

    /// Maximum worker lifetime
    #[serde(with = "duration_serde")]
    pub ttl: Duration,

    /// Maximum time a Ready worker may sit unused
    #[serde(with = "duration_serde")]
    pub idle_ttl: Duration,

    /// Maximum duration of a single execution
    #[serde(with = "duration_serde")]
    pub exec_ttl: Duration,

    /// Resident memory ceiling in MiB
    pub max_worker_memory: u64,
}

impl SupervisorConfig {
    pub fn init_defaults(&mut self) {
        if self.watch_tick.is_zero() {
            self.watch_tick = Duration::from_secs(1);
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level when no filter env var is set
    pub level: String,

    /// `pretty` or `json`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Parse `250ms`, `5s`, `2m`, `1h` or a bare number of seconds
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    let invalid = || EngineError::InvalidConfig(format!("invalid duration '{}'", raw));

    let (number, unit) = match raw.find(|c: char| !c.is_ascii_digit() && c != '.') {
        Some(idx) => raw.split_at(idx),
        None => (raw, "s"),
    };

    let value: f64 = number.parse().map_err(|_| invalid())?;
    let secs = match unit.trim() {
        "ms" => value / 1000.0,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        _ => return Err(invalid()),
    };

    if !secs.is_finite() || secs < 0.0 {
        return Err(invalid());
    }

    Ok(Duration::from_secs_f64(secs))
}

mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Float(f64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{}ms", value.as_millis()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Float(secs) if secs >= 0.0 && secs.is_finite() => Ok(Duration::from_secs_f64(secs)),
            Raw::Float(secs) => Err(serde::de::Error::custom(format!("invalid duration {}", secs))),
            Raw::Text(text) => super::parse_duration(&text).map_err(serde::de::Error::custom),
        }
    }
}
