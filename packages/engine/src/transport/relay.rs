// packages/engine/src/transport/relay.rs
//! Duplex framed channel to one worker
//!
//! A relay is a reader half and a writer half, each behind its own lock, so
//! a control send never waits on a pending receive.

use crate::protocol::control::{decode_control, encode_control, PidCommand};
use crate::protocol::{Frame, FrameCodec};
use crate::utils::errors::{EngineError, Result};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::debug;

type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Framed relay over any byte stream
pub struct Relay {
    reader: Mutex<FramedRead<BoxedReader, FrameCodec>>,
    writer: Mutex<FramedWrite<BoxedWriter, FrameCodec>>,
    kind: &'static str,
}

impl Relay {
    pub fn new<R, W>(reader: R, writer: W, kind: &'static str) -> Self
    where
        R: AsyncRead + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        Self {
            reader: Mutex::new(FramedRead::new(Box::pin(reader), FrameCodec::new())),
            writer: Mutex::new(FramedWrite::new(Box::pin(writer), FrameCodec::new())),
            kind,
        }
    }

    /// `pipes`, `tcp` or `unix`
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub async fn send(&self, frame: Frame) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.send(frame).await
    }

    /// Next frame; a clean EOF is reported as [`EngineError::RelayClosed`]
    pub async fn receive(&self) -> Result<Frame> {
        let mut reader = self.reader.lock().await;
        match reader.next().await {
            Some(frame) => frame,
            None => Err(EngineError::RelayClosed),
        }
    }

    pub async fn send_control<T: Serialize>(&self, command: &T) -> Result<()> {
        self.send(encode_control(command)?).await
    }

    /// Pid handshake: announce our pid, return the pid the peer reports
    pub async fn fetch_pid(&self) -> Result<u32> {
        self.send_control(&PidCommand {
            pid: std::process::id(),
        })
        .await?;

        let frame = self.receive().await?;
        let reply: PidCommand = decode_control(&frame)?;
        debug!("Relay ({}) reported pid {}", self.kind, reply.pid);

        Ok(reply.pid)
    }

    /// Flush and shut down the write half
    pub async fn close(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        match writer.close().await {
            Ok(()) => Ok(()),
            // peer already gone
            Err(EngineError::Io(e))
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::BrokenPipe
                        | std::io::ErrorKind::NotConnected
                        | std::io::ErrorKind::ConnectionReset
                ) =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay").field("kind", &self.kind).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::control::StopCommand;
    use crate::protocol::Payload;

    fn relay_pair() -> (Relay, Relay) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        (Relay::new(ar, aw, "test"), Relay::new(br, bw, "test"))
    }

    #[tokio::test]
    async fn test_send_receive() {
        let (engine, worker) = relay_pair();

        engine
            .send(Frame::data(&Payload::new(&b"c"[..], &b"b"[..])).unwrap())
            .await
            .unwrap();

        let frame = worker.receive().await.unwrap();
        let payload = frame.into_payload().unwrap();
        assert_eq!(payload.context.as_ref(), b"c");
        assert_eq!(payload.body.as_ref(), b"b");
    }

    #[tokio::test]
    async fn test_fetch_pid() {
        let (engine, worker) = relay_pair();

        let peer = tokio::spawn(async move {
            let frame = worker.receive().await.unwrap();
            let hello: PidCommand = decode_control(&frame).unwrap();
            assert_eq!(hello.pid, std::process::id());
            worker.send_control(&PidCommand { pid: 777 }).await.unwrap();
        });

        assert_eq!(engine.fetch_pid().await.unwrap(), 777);
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_fetch_pid_rejects_data_reply() {
        let (engine, worker) = relay_pair();

        tokio::spawn(async move {
            let _ = worker.receive().await;
            let _ = worker.send(Frame::data(&Payload::body(&b"hi"[..])).unwrap()).await;
        });

        assert!(matches!(
            engine.fetch_pid().await,
            Err(EngineError::MalformedFrame(_))
        ));
    }

    #[tokio::test]
    async fn test_receive_after_peer_close() {
        let (engine, worker) = relay_pair();
        worker.send_control(&StopCommand::new()).await.unwrap();
        worker.close().await.unwrap();
        drop(worker);

        assert!(engine.receive().await.unwrap().is_control());
        assert!(matches!(engine.receive().await, Err(EngineError::RelayClosed)));
    }
}
