// packages/engine/src/runtime/state.rs
//! Worker lifecycle state
//!
//! ```text
//! Inactive ──handshake──> Ready <──> Working
//!                           │          │
//!                           ├─> Stopping ─> Stopped
//!                           ├─> Killing ──> Stopped
//!                           ├─> Invalid  (retired; discarded on next draw)
//!                           └─> Destroyed (watcher teardown, no replacement)
//! unexpected exit ─> Errored
//! ```
//!
//! All fields are atomics; policy reads never contend with execution.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Spawned, handshake not finished
    Inactive = 0,
    Ready = 1,
    Working = 2,
    /// Retired by policy; released workers in this state are killed
    Invalid = 3,
    Stopping = 4,
    Killing = 5,
    /// Torn down by the watcher; exit is expected and not replaced
    Destroyed = 6,
    Stopped = 7,
    Errored = 8,
}

impl State {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => State::Inactive,
            1 => State::Ready,
            2 => State::Working,
            3 => State::Invalid,
            4 => State::Stopping,
            5 => State::Killing,
            6 => State::Destroyed,
            7 => State::Stopped,
            _ => State::Errored,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            State::Inactive => "inactive",
            State::Ready => "ready",
            State::Working => "working",
            State::Invalid => "invalid",
            State::Stopping => "stopping",
            State::Killing => "killing",
            State::Destroyed => "destroyed",
            State::Stopped => "stopped",
            State::Errored => "errored",
        }
    }

    /// Ready or Working
    pub fn is_active(&self) -> bool {
        matches!(self, State::Ready | State::Working)
    }

    /// Process is gone (or about to be) and will not serve again
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Destroyed | State::Stopped | State::Errored)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current nanoseconds since the unix epoch
pub fn unix_nanos() -> u64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .map(|n| n.max(0) as u64)
        .unwrap_or(0)
}

/// Lock-free worker state
#[derive(Debug)]
pub struct WorkerState {
    value: AtomicU8,

    /// Completed executions
    num_execs: AtomicU64,

    /// Unix nanos of the last execution start or finish
    last_used: AtomicU64,
}

impl WorkerState {
    pub fn new(initial: State) -> Self {
        Self {
            value: AtomicU8::new(initial as u8),
            num_execs: AtomicU64::new(0),
            last_used: AtomicU64::new(unix_nanos()),
        }
    }

    pub fn value(&self) -> State {
        State::from_u8(self.value.load(Ordering::Acquire))
    }

    pub fn set(&self, state: State) {
        self.value.store(state as u8, Ordering::Release);
    }

    /// Compare-and-swap; false if the current state was not `from`
    pub fn transition(&self, from: State, to: State) -> bool {
        self.value
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_active(&self) -> bool {
        self.value().is_active()
    }

    pub fn num_execs(&self) -> u64 {
        self.num_execs.load(Ordering::Acquire)
    }

    /// Count one execution, returning the new total
    pub fn register_exec(&self) -> u64 {
        self.num_execs.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn last_used(&self) -> u64 {
        self.last_used.load(Ordering::Acquire)
    }

    pub fn set_last_used(&self, nanos: u64) {
        self.last_used.store(nanos, Ordering::Release);
    }

    pub fn touch(&self) {
        self.set_last_used(unix_nanos());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_every_state() {
        let state = WorkerState::new(State::Inactive);
        for s in [
            State::Inactive,
            State::Ready,
            State::Working,
            State::Invalid,
            State::Stopping,
            State::Killing,
            State::Destroyed,
            State::Stopped,
            State::Errored,
        ] {
            state.set(s);
            assert_eq!(state.value(), s);
        }
    }

    #[test]
    fn test_transition_requires_expected_state() {
        let state = WorkerState::new(State::Ready);
        assert!(state.transition(State::Ready, State::Working));
        assert!(!state.transition(State::Ready, State::Working));
        assert_eq!(state.value(), State::Working);

        state.set(State::Invalid);
        assert!(!state.transition(State::Working, State::Ready));
        assert_eq!(state.value(), State::Invalid);
    }

    #[test]
    fn test_exec_counter() {
        let state = WorkerState::new(State::Ready);
        assert_eq!(state.register_exec(), 1);
        assert_eq!(state.register_exec(), 2);
        assert_eq!(state.num_execs(), 2);
    }

    #[test]
    fn test_last_used_starts_at_creation() {
        let before = unix_nanos();
        let state = WorkerState::new(State::Inactive);
        assert!(state.last_used() >= before);
    }

    #[test]
    fn test_classification() {
        assert!(State::Working.is_active());
        assert!(!State::Invalid.is_active());
        assert!(State::Destroyed.is_terminal());
        assert!(!State::Killing.is_terminal());
        assert_eq!(State::Errored.to_string(), "errored");
    }
}
