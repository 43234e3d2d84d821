//! Daemon-backed engine over a Unix socket
//!
//! The actual inference runtime lives in a separate daemon process; this
//! backend speaks a small framed-JSON protocol to it. Each request opens
//! its own connection so a wedged stream never blocks the next call.
//!
//! Frame format: u32 big-endian payload length, then a JSON payload.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::chat::Message;
use crate::config::SamplingParams;
use crate::engine::backend::{
    Acceleration, BackendCapabilities, BackendConfig, BackendFactory, EngineBackend, LoadReport,
    StreamEvent,
};
use crate::error::{Error, Result};

/// Frames larger than this are rejected as protocol corruption.
const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

/// How long the capabilities probe waits before assuming CPU-only.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Serialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum DaemonRequest<'a> {
    Capabilities,
    Load {
        model_id: &'a str,
        acceleration: Acceleration,
        num_threads: usize,
    },
    Generate {
        messages: Vec<WireMessage>,
        max_tokens: u32,
        temperature: f32,
        top_p: f32,
    },
    Release,
}

/// Chat message as it crosses the wire. Timestamps stay on our side.
#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum DaemonEvent {
    Capabilities { gpu_available: bool },
    Progress { percent: u8, text: Option<String> },
    LoadComplete,
    Fragment { text: String },
    Done,
    Released,
    Error { message: String },
}

async fn write_frame(stream: &mut UnixStream, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::Engine("request frame too large".to_string()))?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_frame(stream: &mut UnixStream) -> Result<Vec<u8>> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let len = u32::from_be_bytes(header);
    if len > MAX_FRAME_BYTES {
        return Err(Error::Engine(format!("daemon frame too large: {len} bytes")));
    }
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await?;
    Ok(payload)
}

async fn read_event(stream: &mut UnixStream) -> Result<DaemonEvent> {
    let payload = read_frame(stream).await?;
    Ok(serde_json::from_slice(&payload)?)
}

async fn send_request(socket_path: &Path, request: &DaemonRequest<'_>) -> Result<UnixStream> {
    let mut stream = UnixStream::connect(socket_path).await.map_err(|e| {
        Error::Engine(format!(
            "cannot connect to engine daemon at {}: {e}",
            socket_path.display()
        ))
    })?;
    let payload = serde_json::to_vec(request)?;
    write_frame(&mut stream, &payload).await?;
    Ok(stream)
}

/// Constructs daemon-backed engine instances.
pub struct DaemonFactory {
    socket_path: PathBuf,
}

impl DaemonFactory {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }
}

impl BackendFactory for DaemonFactory {
    /// Synchronous probe, called once per load from outside the runtime's
    /// hot path. An unreachable or slow daemon reads as CPU-only; the
    /// subsequent load will surface the real connection error.
    fn capabilities(&self) -> BackendCapabilities {
        match probe_capabilities(&self.socket_path) {
            Ok(caps) => caps,
            Err(e) => {
                warn!("Capabilities probe failed, assuming CPU-only: {e}");
                BackendCapabilities {
                    gpu_available: false,
                }
            }
        }
    }

    fn construct(&self, config: &BackendConfig) -> Result<Box<dyn EngineBackend>> {
        Ok(Box::new(DaemonBackend {
            socket_path: self.socket_path.clone(),
            config: config.clone(),
        }))
    }
}

fn probe_capabilities(socket_path: &Path) -> Result<BackendCapabilities> {
    let mut stream = std::os::unix::net::UnixStream::connect(socket_path)?;
    stream.set_read_timeout(Some(PROBE_TIMEOUT))?;
    stream.set_write_timeout(Some(PROBE_TIMEOUT))?;

    let payload = serde_json::to_vec(&DaemonRequest::Capabilities)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::Engine("request frame too large".to_string()))?;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(&payload)?;

    let mut header = [0u8; 4];
    stream.read_exact(&mut header)?;
    let len = u32::from_be_bytes(header);
    if len > MAX_FRAME_BYTES {
        return Err(Error::Engine(format!("daemon frame too large: {len} bytes")));
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf)?;

    match serde_json::from_slice(&buf)? {
        DaemonEvent::Capabilities { gpu_available } => Ok(BackendCapabilities { gpu_available }),
        DaemonEvent::Error { message } => Err(Error::Engine(message)),
        other => Err(Error::Engine(format!(
            "unexpected daemon reply to capabilities probe: {other:?}"
        ))),
    }
}

/// One engine instance inside the daemon, addressed by socket path.
pub struct DaemonBackend {
    socket_path: PathBuf,
    config: BackendConfig,
}

#[async_trait]
impl EngineBackend for DaemonBackend {
    async fn load_weights(
        &mut self,
        model_id: &str,
        progress: mpsc::Sender<LoadReport>,
    ) -> Result<()> {
        let request = DaemonRequest::Load {
            model_id,
            acceleration: self.config.acceleration,
            num_threads: self.config.num_threads,
        };
        let mut stream = send_request(&self.socket_path, &request).await?;

        loop {
            match read_event(&mut stream).await? {
                DaemonEvent::Progress { percent, text } => {
                    let _ = progress.send(LoadReport { percent, text }).await;
                }
                DaemonEvent::LoadComplete => {
                    debug!(model = model_id, "Daemon reported load complete");
                    return Ok(());
                }
                DaemonEvent::Error { message } => return Err(Error::Engine(message)),
                other => {
                    return Err(Error::Engine(format!(
                        "unexpected daemon event during load: {other:?}"
                    )))
                }
            }
        }
    }

    async fn stream_completion(
        &mut self,
        messages: &[Message],
        sampling: &SamplingParams,
    ) -> Result<mpsc::Receiver<StreamEvent>> {
        let request = DaemonRequest::Generate {
            messages: messages
                .iter()
                .map(|m| WireMessage {
                    role: m.role.as_str(),
                    content: m.content.clone(),
                })
                .collect(),
            max_tokens: sampling.max_tokens,
            temperature: sampling.temperature,
            top_p: sampling.top_p,
        };
        let mut stream = send_request(&self.socket_path, &request).await?;

        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            loop {
                let event = match read_event(&mut stream).await {
                    Ok(event) => event,
                    Err(e) => {
                        let _ = tx.send(StreamEvent::Error(e.to_string())).await;
                        return;
                    }
                };
                let out = match event {
                    DaemonEvent::Fragment { text } => StreamEvent::Fragment(text),
                    DaemonEvent::Done => StreamEvent::Done,
                    DaemonEvent::Error { message } => StreamEvent::Error(message),
                    other => StreamEvent::Error(format!(
                        "unexpected daemon event during generation: {other:?}"
                    )),
                };
                let terminal = !matches!(out, StreamEvent::Fragment(_));
                // A dropped receiver means the caller cancelled; closing the
                // connection tells the daemon to stop generating.
                if tx.send(out).await.is_err() || terminal {
                    return;
                }
            }
        });

        Ok(rx)
    }

    /// Best effort: the daemon may already be gone at shutdown.
    async fn release(&mut self) {
        match send_request(&self.socket_path, &DaemonRequest::Release).await {
            Ok(mut stream) => {
                if let Err(e) = read_event(&mut stream).await {
                    debug!("Daemon release reply not read: {e}");
                }
            }
            Err(e) => debug!("Daemon release skipped: {e}"),
        }
    }
}
