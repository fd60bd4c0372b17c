//! Line-delimited JSON transport over TCP.
//!
//! Every accepted connection is one hub observer: event envelopes are written
//! to it as they are published, and each request line is answered with one
//! response line. A server bound to a loopback address refuses non-loopback
//! peers unless `allow_remote` is set.

mod protocol;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};

pub use protocol::{Request, Response, DEFAULT_LOG_LIMIT};

use crate::controller::AccessController;
use crate::hub::ObserverId;
use crate::now_epoch_ms;
use crate::settings::validate_lock_duration;

/// Longest accepted request line, excluding the newline.
pub const MAX_REQUEST_BYTES: usize = 8192;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub allow_remote: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8765".to_string(),
            allow_remote: false,
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ApiHandle {
    /// Close the listener and every connection (observers are detached).
    pub async fn stop(self) -> Result<()> {
        self.shutdown.send_replace(true);
        self.join
            .await
            .map_err(|err| anyhow!("api server task failed: {}", err))
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    controller: Arc<AccessController>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, controller: Arc<AccessController>) -> Self {
        Self { cfg, controller }
    }

    pub async fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .with_context(|| format!("invalid api address '{}'", self.cfg.addr))?;
        let listener = TcpListener::bind(configured_addr)
            .await
            .with_context(|| format!("bind api listener on {}", configured_addr))?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        log::info!("Api: listening on {}", addr);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(run_api(listener, self.cfg, self.controller, shutdown_rx));
        Ok(ApiHandle {
            addr,
            shutdown,
            join,
        })
    }
}

async fn run_api(
    listener: TcpListener,
    cfg: ApiConfig,
    controller: Arc<AccessController>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let controller = Arc::clone(&controller);
                    let shutdown = shutdown.clone();
                    let allow_remote = cfg.allow_remote;
                    connections.spawn(async move {
                        if let Err(err) =
                            handle_connection(stream, peer, allow_remote, controller, shutdown).await
                        {
                            log::warn!("Api: connection {} ended: {}", peer, err);
                        }
                    });
                }
                Err(err) => {
                    log::warn!("Api: accept failed: {}", err);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            // reap finished connections
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = stopped(&mut shutdown) => break,
        }
    }
    while connections.join_next().await.is_some() {}
    log::info!("Api: stopped");
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    allow_remote: bool,
    controller: Arc<AccessController>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let local = stream.local_addr()?;
    let (reader, mut writer) = stream.into_split();
    if local.ip().is_loopback() && !peer.ip().is_loopback() && !allow_remote {
        write_response(&mut writer, &Response::error("forbidden")).await?;
        return Ok(());
    }

    let observer = controller.attach_observer(peer.to_string()).await;
    let observer_id = observer.id;
    let mut events = observer.rx;
    let mut lines = RequestLines::new(reader);
    log::info!("Api: observer {} connected from {}", observer_id, peer);

    let result = serve_observer(
        &controller,
        observer_id,
        &mut events,
        &mut lines,
        &mut writer,
        &mut shutdown,
    )
    .await;

    controller.detach_observer(observer_id).await;
    log::info!("Api: observer {} disconnected", observer_id);
    result
}

async fn serve_observer(
    controller: &AccessController,
    observer_id: ObserverId,
    events: &mut mpsc::Receiver<Arc<str>>,
    lines: &mut RequestLines,
    writer: &mut OwnedWriteHalf,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<()> {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(json) => write_line(writer, &json).await?,
                // detached by the hub after a failed delivery
                None => return Err(anyhow!("observer {} detached", observer_id)),
            },
            line = lines.next_line() => {
                let line = match line? {
                    RequestLine::Line(line) => line,
                    RequestLine::TooLarge => {
                        write_response(writer, &Response::error("request too large")).await?;
                        return Err(anyhow!("request too large"));
                    }
                    RequestLine::Closed => return Ok(()),
                };
                if line.trim().is_empty() {
                    continue;
                }
                let response = match serde_json::from_str::<Request>(&line) {
                    Ok(request) => dispatch(controller, request).await,
                    Err(err) => Response::error(format!("invalid request: {}", err)),
                };
                write_response(writer, &response).await?;
            }
            _ = stopped(shutdown) => return Ok(()),
        }
    }
}

/// Resolves once shutdown is requested or its sender is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

enum RequestLine {
    Line(String),
    /// More than `MAX_REQUEST_BYTES` without a newline.
    TooLarge,
    Closed,
}

/// Newline-delimited request reader with a bounded line buffer.
///
/// `next_line` is cancel-safe: bytes are only consumed from the socket buffer
/// after they were moved into `pending`, which survives a dropped call.
struct RequestLines {
    reader: BufReader<OwnedReadHalf>,
    pending: Vec<u8>,
}

impl RequestLines {
    fn new(reader: OwnedReadHalf) -> Self {
        Self {
            reader: BufReader::new(reader),
            pending: Vec::new(),
        }
    }

    async fn next_line(&mut self) -> Result<RequestLine> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                if self.pending.is_empty() {
                    return Ok(RequestLine::Closed);
                }
                return self.take_line();
            }
            let newline = available.iter().position(|&b| b == b'\n');
            let chunk = &available[..newline.unwrap_or(available.len())];
            if self.pending.len() + chunk.len() > MAX_REQUEST_BYTES {
                self.pending.clear();
                return Ok(RequestLine::TooLarge);
            }
            self.pending.extend_from_slice(chunk);
            let used = newline.map_or(chunk.len(), |pos| pos + 1);
            self.reader.consume(used);
            if newline.is_some() {
                return self.take_line();
            }
        }
    }

    fn take_line(&mut self) -> Result<RequestLine> {
        let mut line = std::mem::take(&mut self.pending);
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        let line = String::from_utf8(line).context("request is not utf-8")?;
        Ok(RequestLine::Line(line))
    }
}

async fn write_response(writer: &mut OwnedWriteHalf, response: &Response) -> Result<()> {
    write_line(writer, &serde_json::to_string(response)?).await
}

async fn write_line(writer: &mut OwnedWriteHalf, line: &str) -> Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    Ok(())
}

/// Run one request against the controller.
pub async fn dispatch(controller: &AccessController, request: Request) -> Response {
    match request {
        Request::UnlockDoor { duration } => {
            if let Some(secs) = duration {
                if let Err(err) = validate_lock_duration(secs) {
                    return Response::error(err);
                }
            }
            match controller
                .unlock_door(duration.map(Duration::from_secs))
                .await
            {
                Ok(status) => Response::DoorStatus(status),
                Err(err) => Response::error(err),
            }
        }
        Request::LockDoor => match controller.lock_door().await {
            Ok(status) => Response::DoorStatus(status),
            Err(err) => Response::error(err),
        },
        Request::GetDoorStatus => Response::DoorStatus(controller.door_status()),
        Request::UpdatePerformanceSettings { settings } => {
            match controller.update_performance_settings(&settings).await {
                Ok(profile) => Response::PerformanceSettings(profile),
                Err(err) => Response::error(err),
            }
        }
        Request::UpdateDoorConfig { config } => match controller.update_door_config(&config).await {
            Ok(snapshot) => Response::Config(snapshot),
            Err(err) => Response::error(err),
        },
        Request::GetUsers => Response::Users {
            users: controller.list_users(),
        },
        Request::GetRecognitionLog { limit } => Response::RecognitionLog {
            entries: controller.recent_recognitions(limit.unwrap_or(DEFAULT_LOG_LIMIT)),
        },
        Request::CaptureSnapshot => match controller.capture_snapshot().await {
            Ok(encoded) => Response::Snapshot {
                image: STANDARD.encode(&encoded.bytes),
                width: encoded.width,
                height: encoded.height,
                quality: encoded.quality,
            },
            Err(err) => Response::error(err),
        },
        Request::Ping => Response::Pong {
            timestamp_ms: now_epoch_ms(),
        },
    }
}
