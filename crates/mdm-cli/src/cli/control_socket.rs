//! Control socket: server (during `mdm run`) and client (every other command).
//! Protocol: one JSON `ControlRequest` per line, answered by one JSON
//! `ControlResponse` line.

use anyhow::{bail, Context, Result};
use mdm_core::batch::BatchCoordinator;
use mdm_core::control::{self, ControlRequest, ControlResponse};
use std::io::ErrorKind;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;

/// Bind `path` (replacing a stale socket file) and answer requests against
/// `coordinator` until the task is aborted.
pub fn spawn_control_listener(
    coordinator: BatchCoordinator,
    path: impl AsRef<Path>,
) -> Result<JoinHandle<()>> {
    let path = path.as_ref().to_path_buf();
    let _ = std::fs::remove_file(&path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(&path)
        .with_context(|| format!("bind control socket {}", path.display()))?;
    let handle = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let coordinator = coordinator.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(coordinator, stream).await {
                            tracing::debug!("control connection: {:#}", e);
                        }
                    });
                }
                Err(e) => tracing::debug!("control socket accept: {}", e),
            }
        }
    });
    Ok(handle)
}

async fn serve_connection(coordinator: BatchCoordinator, stream: UnixStream) -> Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match control::decode_line::<ControlRequest>(&line) {
            Ok(request) => control::handle(&coordinator, request).await,
            Err(e) => ControlResponse::Error {
                message: format!("malformed request: {e}"),
            },
        };
        write
            .write_all(control::encode_line(&response)?.as_bytes())
            .await?;
    }
    Ok(())
}

/// Send one request. `Ok(None)` when no instance is listening at `path`.
pub async fn send(path: &Path, request: &ControlRequest) -> Result<Option<ControlResponse>> {
    let stream = match UnixStream::connect(path).await {
        Ok(s) => s,
        Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::ConnectionRefused) => {
            return Ok(None)
        }
        Err(e) => {
            return Err(e).with_context(|| format!("connect control socket {}", path.display()))
        }
    };
    let (read, mut write) = stream.into_split();
    write
        .write_all(control::encode_line(request)?.as_bytes())
        .await?;
    match BufReader::new(read).lines().next_line().await? {
        Some(line) => Ok(Some(control::decode_line(&line)?)),
        None => bail!("control socket closed without a response"),
    }
}

/// [`send`] to the default socket path.
pub async fn forward(request: ControlRequest) -> Result<Option<ControlResponse>> {
    let path = control::default_control_socket_path()?;
    send(&path, &request).await
}
