// packages/engine/src/protocol/control.rs
//! JSON control commands carried in CONTROL frames

use crate::protocol::frame::Frame;
use crate::utils::errors::{EngineError, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Context of a response that asks the engine to recycle the worker
pub const STOP_SENTINEL: &[u8] = br#"{"stop":true}"#;

/// Pid confirmation, sent by the engine with its own pid and echoed back by
/// the worker with the worker's pid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidCommand {
    pub pid: u32,
}

/// Graceful stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopCommand {
    pub stop: bool,
}

impl StopCommand {
    pub fn new() -> Self {
        Self { stop: true }
    }
}

impl Default for StopCommand {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode a command as a CONTROL frame
pub fn encode_control<T: Serialize>(command: &T) -> Result<Frame> {
    Ok(Frame::control(serde_json::to_vec(command)?))
}

/// Decode a command from a CONTROL frame
pub fn decode_control<T: DeserializeOwned>(frame: &Frame) -> Result<T> {
    if !frame.is_control() {
        return Err(EngineError::MalformedFrame(format!(
            "expected control frame, got flags {:#04x}",
            frame.flags()
        )));
    }

    Ok(serde_json::from_slice(frame.payload())?)
}
