// packages/engine/src/runtime/command.rs
//! Launch command for worker processes
//!
//! The command itself is opaque to the pool: a program, its arguments, extra
//! environment and an optional working directory. Transport factories decide
//! how stdio is wired.

use crate::utils::config::ServerConfig;
use crate::utils::errors::{EngineError, Result};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Environment variable telling the worker which relay to use
pub const RELAY_ENV: &str = "RELAYPOOL_RELAY";

/// How to launch one worker process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    /// Executable name or path
    pub program: String,

    /// Arguments
    pub args: Vec<String>,

    /// Extra environment variables
    pub env: Vec<(String, String)>,

    /// Working directory
    pub current_dir: Option<PathBuf>,
}

impl LaunchCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: vec![],
            env: vec![],
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Build from `program arg1 arg2 ...`
    pub fn from_argv(argv: &[String]) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| EngineError::InvalidConfig("worker command is empty".into()))?;

        Ok(Self::new(program.clone()).args(args.iter().cloned()))
    }

    /// Build from the `server` config section
    pub fn from_server_config(server: &ServerConfig) -> Result<Self> {
        let mut cmd = Self::from_argv(&server.command)?;

        let mut env: Vec<_> = server.env.iter().collect();
        env.sort();
        for (key, value) in env {
            cmd = cmd.env(key.clone(), value.clone());
        }

        Ok(cmd)
    }

    /// Human readable form for logs
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Prepare a tokio command; stdin/stdout are left to the caller.
    ///
    /// The child is killed if its handle is dropped before being attached to
    /// a worker, so a cancelled spawn never leaks a process.
    pub(crate) fn to_command(&self, relay: &str) -> Command {
        debug!("Preparing worker command: {}", self.display());

        let mut command = Command::new(&self.program);
        command.args(&self.args);

        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }

        for (key, value) in &self.env {
            command.env(key, value);
        }

        command
            .env(RELAY_ENV, relay)
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        command
    }
}
