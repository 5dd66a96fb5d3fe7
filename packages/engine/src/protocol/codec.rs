// packages/engine/src/protocol/codec.rs
//! `tokio_util` codec for [`Frame`]

use crate::protocol::frame::{Frame, CRC_LEN, FRAME_VERSION, LENGTH_LEN, MAX_OPTIONS, PREFIX_LEN};
use crate::utils::errors::EngineError;
use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Default cap on a single payload (64 MiB)
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024 * 1024;

/// Length-prefixed, CRC-checked frame codec
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_payload: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD)
    }

    pub fn with_max_payload(max_payload: usize) -> Self {
        Self { max_payload }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = EngineError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, EngineError> {
        if src.len() < PREFIX_LEN {
            return Ok(None);
        }

        let version = src[0];
        if version != FRAME_VERSION {
            return Err(EngineError::MalformedFrame(format!(
                "unsupported version {}",
                version
            )));
        }

        let flags = src[1];
        let opt_count = src[2] as usize;
        if opt_count > MAX_OPTIONS {
            return Err(EngineError::MalformedFrame(format!(
                "{} options exceeds the limit of {}",
                opt_count, MAX_OPTIONS
            )));
        }

        let header_len = PREFIX_LEN + opt_count * 4 + LENGTH_LEN;
        if src.len() < header_len {
            src.reserve(header_len - src.len());
            return Ok(None);
        }

        let len_at = header_len - LENGTH_LEN;
        let payload_len = u32::from_le_bytes([
            src[len_at],
            src[len_at + 1],
            src[len_at + 2],
            src[len_at + 3],
        ]) as usize;

        if payload_len > self.max_payload {
            return Err(EngineError::MalformedFrame(format!(
                "payload of {} bytes exceeds the limit of {}",
                payload_len, self.max_payload
            )));
        }

        let total = header_len + payload_len + CRC_LEN;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut raw = src.split_to(total);
        let body_end = total - CRC_LEN;
        let actual = crc32fast::hash(&raw[..body_end]);
        let expected = (&raw[body_end..]).get_u32_le();
        if actual != expected {
            return Err(EngineError::CrcMismatch { expected, actual });
        }

        raw.advance(PREFIX_LEN);
        let options = (0..opt_count).map(|_| raw.get_u32_le()).collect();
        raw.advance(LENGTH_LEN);
        let payload = raw.split_to(payload_len).freeze();

        Frame::from_parts(flags, options, payload).map(Some)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = EngineError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), EngineError> {
        if frame.payload().len() > self.max_payload {
            return Err(EngineError::MalformedFrame(format!(
                "payload of {} bytes exceeds the limit of {}",
                frame.payload().len(),
                self.max_payload
            )));
        }

        frame.encode_into(dst);
        Ok(())
    }
}
