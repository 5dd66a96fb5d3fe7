// packages/engine/src/runtime/exec.rs
//! Request/response execution over a worker's relay

use crate::events::PoolEvent;
use crate::protocol::{Frame, Payload};
use crate::runtime::state::State;
use crate::runtime::worker::Worker;
use crate::transport::relay::Relay;
use crate::utils::errors::{EngineError, Result};
use tokio::time::Instant;
use tracing::{debug, warn};

impl Worker {
    /// Execute one payload.
    ///
    /// The worker must be Ready; it is Working for the duration of the call.
    /// A soft error (ERROR flag) leaves the worker Ready. Any other failure
    /// leaves it Errored so it is discarded on release.
    pub async fn exec(&self, payload: &Payload) -> Result<Payload> {
        if payload.is_empty() {
            return Err(EngineError::EmptyPayload);
        }

        if !self.state().transition(State::Ready, State::Working) {
            return Err(EngineError::WorkerNotReady {
                pid: self.pid(),
                state: self.state().value().to_string(),
            });
        }

        self.state().touch();
        metrics::counter!("relaypool_exec_total").increment(1);

        let result = match self.relay() {
            Ok(relay) => round_trip(relay, payload).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(response) => {
                self.state().touch();
                self.state().transition(State::Working, State::Ready);
                self.state().register_exec();
                Ok(response)
            }
            Err(EngineError::SoftJob(message)) => {
                self.state().touch();
                self.state().transition(State::Working, State::Ready);
                self.state().register_exec();
                metrics::counter!("relaypool_exec_errors_total", "kind" => "soft_job").increment(1);
                debug!("Worker {} reported job error: {}", self.pid(), message);
                Err(EngineError::SoftJob(message))
            }
            Err(e) => {
                self.state().transition(State::Working, State::Errored);
                metrics::counter!("relaypool_exec_errors_total", "kind" => e.kind()).increment(1);
                self.events().publish(PoolEvent::WorkerError {
                    pid: self.pid(),
                    error: e.to_string(),
                });
                warn!("Worker {} failed during exec: {}", self.pid(), e);
                Err(e)
            }
        }
    }

    /// [`exec`](Self::exec) bounded by `deadline`.
    ///
    /// On expiry the worker is killed, since the relay may hold a half-read
    /// response.
    pub async fn exec_with_deadline(&self, deadline: Instant, payload: &Payload) -> Result<Payload> {
        match tokio::time::timeout_at(deadline, self.exec(payload)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Worker {} exceeded exec deadline, killing", self.pid());
                metrics::counter!("relaypool_exec_errors_total", "kind" => "exec_ttl").increment(1);
                self.events().publish(PoolEvent::ExecTtl { pid: self.pid() });
                let killed = self.kill();
                Err(EngineError::combine(EngineError::ExecTTL, [killed]))
            }
        }
    }
}

async fn round_trip(relay: &Relay, payload: &Payload) -> Result<Payload> {
    relay.send(Frame::data(payload)?).await?;

    let frame = relay.receive().await?;
    if frame.is_error() {
        return Err(EngineError::SoftJob(
            String::from_utf8_lossy(frame.payload()).into_owned(),
        ));
    }

    if frame.is_control() {
        return Err(EngineError::MalformedFrame(
            "control frame received in place of a response".into(),
        ));
    }

    frame.into_payload()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::protocol::control::{decode_control, StopCommand};
    use crate::runtime::command::LaunchCommand;
    use std::process::Stdio;
    use std::sync::Arc;
    use std::time::Duration;

    /// Worker backed by a `sleep` process whose relay is an in-memory duplex;
    /// the returned relay plays the worker side.
    fn fake_worker() -> (Arc<Worker>, Relay) {
        let child = tokio::process::Command::new("sleep")
            .arg("30")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let worker = Worker::new(child, &LaunchCommand::new("sleep"), EventBus::new()).unwrap();

        let (a, b) = tokio::io::duplex(64 * 1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        worker.attach_relay(Relay::new(ar, aw, "test")).unwrap();
        worker.mark_ready();

        (Arc::new(worker), Relay::new(br, bw, "test"))
    }

    #[tokio::test]
    async fn test_exec_echo() {
        let (worker, peer) = fake_worker();

        tokio::spawn(async move {
            let frame = peer.receive().await.unwrap();
            let req = frame.into_payload().unwrap();
            let mut body = req.body.to_vec();
            body.reverse();
            peer.send(Frame::data(&Payload::new(req.context, body)).unwrap())
                .await
                .unwrap();
        });

        let resp = worker
            .exec(&Payload::new(&b"{}"[..], &b"abc"[..]))
            .await
            .unwrap();
        assert_eq!(resp.context.as_ref(), b"{}");
        assert_eq!(resp.body.as_ref(), b"cba");
        assert_eq!(worker.state().value(), State::Ready);
        assert_eq!(worker.state().num_execs(), 1);

        worker.kill().unwrap();
        worker.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_payload_does_not_touch_relay() {
        let (worker, peer) = fake_worker();

        let err = worker.exec(&Payload::default()).await.unwrap_err();
        assert!(matches!(err, EngineError::EmptyPayload));
        assert_eq!(worker.state().value(), State::Ready);

        // nothing was written: the next frame the peer sees is our stop
        worker.stop().await.unwrap();
        let frame = peer.receive().await.unwrap();
        let cmd: StopCommand = decode_control(&frame).unwrap();
        assert!(cmd.stop);

        worker.kill().unwrap();
        worker.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_not_ready_rejected() {
        let (worker, _peer) = fake_worker();
        worker.state().set(State::Invalid);

        let err = worker.exec(&Payload::body(&b"x"[..])).await.unwrap_err();
        assert!(matches!(err, EngineError::WorkerNotReady { .. }));

        worker.kill().unwrap();
        worker.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_soft_error_keeps_worker_ready() {
        let (worker, peer) = fake_worker();

        tokio::spawn(async move {
            let _ = peer.receive().await.unwrap();
            peer.send(Frame::error(&b"validation failed"[..])).await.unwrap();
        });

        let err = worker.exec(&Payload::body(&b"x"[..])).await.unwrap_err();
        match err {
            EngineError::SoftJob(msg) => assert_eq!(msg, "validation failed"),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(worker.state().value(), State::Ready);

        worker.kill().unwrap();
        worker.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_relay_failure_marks_errored() {
        let (worker, peer) = fake_worker();
        drop(peer);

        let err = worker.exec(&Payload::body(&b"x"[..])).await.unwrap_err();
        assert!(err.is_protocol() || matches!(err, EngineError::Io(_)));
        assert_eq!(worker.state().value(), State::Errored);

        worker.kill().unwrap();
        worker.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_deadline_kills_worker() {
        let (worker, _peer) = fake_worker();

        let deadline = Instant::now() + Duration::from_millis(100);
        let err = worker
            .exec_with_deadline(deadline, &Payload::body(&b"x"[..]))
            .await
            .unwrap_err();

        assert!(matches!(err, EngineError::ExecTTL));
        assert_eq!(worker.state().value(), State::Killing);

        worker.wait().await.unwrap();
        assert_eq!(worker.state().value(), State::Stopped);
    }
}
