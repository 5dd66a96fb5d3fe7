// packages/engine/src/protocol/mod.rs
//! Wire protocol between the engine and its workers
//!
//! Every exchange is a single [`Frame`]:
//!
//! ```text
//! +---------+-------+-----------+----------------+-------------+---------+--------+
//! | version | flags | opt count | options (u32)* | payload len | payload | crc32  |
//! |   u8    |  u8   |    u8     |    LE each     |   u32 LE    |  bytes  | u32 LE |
//! +---------+-------+-----------+----------------+-------------+---------+--------+
//! ```
//!
//! - Data frames carry one option: the length of the context prefix inside
//!   the payload. The remainder is the body.
//! - CONTROL frames carry a JSON command (pid handshake, stop).
//! - ERROR frames carry the worker's job-level error message.
//! - The CRC covers every byte before it and is checked before the payload
//!   is handed out.

pub mod codec;
pub mod control;
pub mod frame;

pub use codec::FrameCodec;
pub use control::{PidCommand, StopCommand, STOP_SENTINEL};
pub use frame::{Frame, Payload, FLAG_CONTROL, FLAG_ERROR, FRAME_VERSION};
