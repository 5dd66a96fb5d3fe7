// packages/engine/src/bin/echo_worker.rs
//! Reference worker speaking the relaypool wire protocol
//!
//! Connects to the relay named in `RELAYPOOL_RELAY` (stdin/stdout when unset
//! or `pipes`), answers the pid handshake and serves data frames until it
//! receives a stop command or the relay closes.
//!
//! ```text
//! echo_worker [MODE] [ARG]
//!
//!   echo              reply with the request (default)
//!   pid               reply with this process' pid as the body
//!   stop-once FILE    first worker to see FILE missing creates it and
//!                     replies with the stop sentinel; later ones echo
//!   stop              always reply with the stop sentinel
//!   error             reply with an ERROR frame carrying the body
//!   slow-start MS     sleep MS milliseconds before serving
//!   sleep             never reply to data frames
//!   crash             write to stderr and exit 1 on the first request
//!   wrong-pid         answer the pid handshake with someone else's pid
//! ```

use anyhow::{bail, Context, Result};
use futures::{SinkExt, StreamExt};
use relaypool_engine::protocol::control::encode_control;
use relaypool_engine::protocol::{Frame, FrameCodec, Payload, PidCommand, STOP_SENTINEL};
use relaypool_engine::runtime::command::RELAY_ENV;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::debug;

#[derive(Debug, Clone)]
enum Mode {
    Echo,
    Pid,
    StopOnce(PathBuf),
    Stop,
    Error,
    SlowStart(Duration),
    Sleep,
    Crash,
    WrongPid,
}

impl Mode {
    fn from_args() -> Result<Self> {
        let mut args = std::env::args().skip(1);
        let mode = args.next().unwrap_or_else(|| "echo".to_string());
        let arg = args.next();

        Ok(match mode.as_str() {
            "echo" => Mode::Echo,
            "pid" => Mode::Pid,
            "stop-once" => Mode::StopOnce(PathBuf::from(arg.context("stop-once needs a marker path")?)),
            "stop" => Mode::Stop,
            "error" => Mode::Error,
            "slow-start" => {
                let ms: u64 = arg.context("slow-start needs milliseconds")?.parse()?;
                Mode::SlowStart(Duration::from_millis(ms))
            }
            "sleep" => Mode::Sleep,
            "crash" => Mode::Crash,
            "wrong-pid" => Mode::WrongPid,
            other => bail!("unknown mode '{}'", other),
        })
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("ECHO_WORKER_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let mode = Mode::from_args()?;
    if let Mode::SlowStart(delay) = mode {
        tokio::time::sleep(delay).await;
    }

    let relay = std::env::var(RELAY_ENV).unwrap_or_else(|_| "pipes".to_string());
    debug!("echo_worker {} on relay {}", std::process::id(), relay);

    if relay == "pipes" {
        serve(tokio::io::stdin(), tokio::io::stdout(), &mode).await
    } else if let Some(addr) = relay.strip_prefix("tcp://") {
        let stream = tokio::net::TcpStream::connect(addr).await?;
        let (r, w) = stream.into_split();
        serve(r, w, &mode).await
    } else if let Some(path) = relay.strip_prefix("unix://") {
        let stream = tokio::net::UnixStream::connect(path).await?;
        let (r, w) = stream.into_split();
        serve(r, w, &mode).await
    } else {
        bail!("unsupported relay '{}'", relay)
    }
}

async fn serve<R, W>(reader: R, writer: W, mode: &Mode) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = FramedRead::new(reader, FrameCodec::new());
    let mut writer = FramedWrite::new(writer, FrameCodec::new());

    while let Some(frame) = reader.next().await {
        let frame = frame?;

        if frame.is_control() {
            let command: serde_json::Value = serde_json::from_slice(frame.payload())?;
            if command.get("stop").is_some() {
                debug!("Stop requested");
                return Ok(());
            }
            if command.get("pid").is_some() {
                let pid = match mode {
                    Mode::WrongPid => std::process::id().wrapping_add(1),
                    _ => std::process::id(),
                };
                let reply = PidCommand { pid };
                writer.send(encode_control(&reply)?).await?;
            }
            continue;
        }

        let request = frame.into_payload()?;
        let reply = match respond(mode, request)? {
            Some(reply) => reply,
            None => futures::future::pending().await,
        };
        writer.send(reply).await?;
    }

    Ok(())
}

fn respond(mode: &Mode, request: Payload) -> Result<Option<Frame>> {
    let frame = match mode {
        Mode::Echo | Mode::SlowStart(_) | Mode::WrongPid => Frame::data(&request)?,
        Mode::Pid => Frame::data(&Payload::body(std::process::id().to_string()))?,
        Mode::Stop => Frame::data(&Payload::new(STOP_SENTINEL, ""))?,
        Mode::StopOnce(marker) => {
            if marker.exists() {
                Frame::data(&request)?
            } else {
                std::fs::write(marker, std::process::id().to_string())?;
                Frame::data(&Payload::new(STOP_SENTINEL, ""))?
            }
        }
        Mode::Error => Frame::error(request.body),
        Mode::Sleep => return Ok(None),
        Mode::Crash => {
            eprintln!("fatal: echo_worker crashed on request");
            std::process::exit(1);
        }
    };

    Ok(Some(frame))
}
