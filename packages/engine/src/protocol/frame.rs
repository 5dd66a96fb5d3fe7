// packages/engine/src/protocol/frame.rs
//! Frame and payload types

use crate::protocol::control::STOP_SENTINEL;
use crate::utils::errors::{EngineError, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// Current wire version
pub const FRAME_VERSION: u8 = 1;

/// Frame carries a control command rather than a payload
pub const FLAG_CONTROL: u8 = 0x01;

/// Frame carries a job-level error message
pub const FLAG_ERROR: u8 = 0x02;

/// Upper bound on the options array
pub const MAX_OPTIONS: usize = 10;

/// version + flags + option count
pub const PREFIX_LEN: usize = 3;

/// Payload length field
pub const LENGTH_LEN: usize = 4;

/// Trailing checksum
pub const CRC_LEN: usize = 4;

/// Unit of work and of result
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    pub context: Bytes,
    pub body: Bytes,
}

impl Payload {
    pub fn new(context: impl Into<Bytes>, body: impl Into<Bytes>) -> Self {
        Self {
            context: context.into(),
            body: body.into(),
        }
    }

    /// Payload with only a body
    pub fn body(body: impl Into<Bytes>) -> Self {
        Self::new(Bytes::new(), body)
    }

    pub fn is_empty(&self) -> bool {
        self.context.is_empty() && self.body.is_empty()
    }

    /// Worker asked to be recycled before the next call
    pub fn is_stop_sentinel(&self) -> bool {
        self.body.is_empty() && self.context.as_ref() == STOP_SENTINEL
    }

    /// Body as lossy UTF-8, for logs and soft errors
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// One framed message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    flags: u8,
    options: Vec<u32>,
    payload: Bytes,
}

impl Frame {
    /// Build a frame from raw parts, validating the option count
    pub fn from_parts(flags: u8, options: Vec<u32>, payload: Bytes) -> Result<Self> {
        if options.len() > MAX_OPTIONS {
            return Err(EngineError::MalformedFrame(format!(
                "{} options exceeds the limit of {}",
                options.len(),
                MAX_OPTIONS
            )));
        }

        if payload.len() > u32::MAX as usize {
            return Err(EngineError::MalformedFrame("payload too large".into()));
        }

        Ok(Self {
            flags,
            options,
            payload,
        })
    }

    /// Data frame: context and body concatenated, split offset in the options
    pub fn data(payload: &Payload) -> Result<Self> {
        let mut buf = BytesMut::with_capacity(payload.context.len() + payload.body.len());
        buf.extend_from_slice(&payload.context);
        buf.extend_from_slice(&payload.body);

        let split = u32::try_from(payload.context.len())
            .map_err(|_| EngineError::MalformedFrame("context too large".into()))?;

        Self::from_parts(0, vec![split], buf.freeze())
    }

    /// Control frame carrying an encoded command
    pub fn control(body: impl Into<Bytes>) -> Self {
        Self {
            flags: FLAG_CONTROL,
            options: Vec::new(),
            payload: body.into(),
        }
    }

    /// Error frame carrying a job-level message
    pub fn error(message: impl Into<Bytes>) -> Self {
        Self {
            flags: FLAG_ERROR,
            options: Vec::new(),
            payload: message.into(),
        }
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn options(&self) -> &[u32] {
        &self.options
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn is_control(&self) -> bool {
        self.flags & FLAG_CONTROL != 0
    }

    pub fn is_error(&self) -> bool {
        self.flags & FLAG_ERROR != 0
    }

    /// Split a data frame back into context and body.
    ///
    /// Frames without options are treated as body-only.
    pub fn into_payload(self) -> Result<Payload> {
        let split = match self.options.first() {
            Some(&offset) => offset as usize,
            None => 0,
        };

        if split > self.payload.len() {
            return Err(EngineError::MalformedFrame(format!(
                "context offset {} beyond payload of {} bytes",
                split,
                self.payload.len()
            )));
        }

        let mut payload = self.payload;
        let context = payload.split_to(split);
        Ok(Payload {
            context,
            body: payload,
        })
    }

    /// Total bytes on the wire
    pub fn encoded_len(&self) -> usize {
        PREFIX_LEN + self.options.len() * 4 + LENGTH_LEN + self.payload.len() + CRC_LEN
    }

    /// Serialize into `dst`, checksum included
    pub fn encode_into(&self, dst: &mut BytesMut) {
        let start = dst.len();
        dst.reserve(self.encoded_len());

        dst.put_u8(FRAME_VERSION);
        dst.put_u8(self.flags);
        dst.put_u8(self.options.len() as u8);
        for opt in &self.options {
            dst.put_u32_le(*opt);
        }
        dst.put_u32_le(self.payload.len() as u32);
        dst.extend_from_slice(&self.payload);

        let crc = crc32fast::hash(&dst[start..]);
        dst.put_u32_le(crc);
    }
}
