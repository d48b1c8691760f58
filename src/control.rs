// SPDX-License-Identifier: MIT
//! Control Socket (spec §4.11): a local Unix-domain, line-delimited JSON
//! protocol for `status`/`list`/`start`/`stop`/`warmup`.
//!
//! Grounded in the teacher's `ipc::mod` connection-handling loop (accept,
//! spawn a per-connection task, read until EOF) adapted from WebSocket
//! frames to newline-delimited JSON, and the Only1MCP reference's stdio
//! line framing for the request/response shape itself.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pool::Pool;
use crate::router::Router;
use crate::warmup;

/// One control-socket request, one JSON object per line (spec §4.11).
#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
enum ControlRequest {
    Status,
    List,
    Start { name: String },
    Stop { name: String },
    Warmup { dir: PathBuf },
}

/// Serves the control socket: binds `socket_path` (unlinking any stale
/// file first), accepts connections, and answers one JSON line per
/// request. Returns when `cancel` fires, removing the socket file on the
/// way out (spec §4.11: "Close removes the file").
pub async fn serve(
    socket_path: &Path,
    pool: Arc<Pool>,
    router: Arc<Router>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(socket_path)?;
    info!(path = %socket_path.display(), "control socket listening");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, _addr) = accepted?;
                let pool = pool.clone();
                let router = router.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, pool, router).await {
                        debug!(err = %e, "control connection ended with error");
                    }
                });
            }
        }
    }

    let _ = std::fs::remove_file(socket_path);
    info!(path = %socket_path.display(), "control socket closed");
    Ok(())
}

async fn handle_connection(
    stream: UnixStream,
    pool: Arc<Pool>,
    router: Arc<Router>,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = dispatch(&line, &pool, &router).await;
        let mut text = serde_json::to_string(&response)
            .unwrap_or_else(|_| json!({"error": "internal error"}).to_string());
        text.push('\n');
        write_half.write_all(text.as_bytes()).await?;
    }
    Ok(())
}

async fn dispatch(line: &str, pool: &Arc<Pool>, router: &Arc<Router>) -> Value {
    let request: ControlRequest = match serde_json::from_str(line) {
        Ok(req) => req,
        Err(e) => return json!({"error": format!("invalid request: {e}")}),
    };

    match request {
        ControlRequest::Status => {
            let lsps: Vec<Value> = pool
                .status()
                .await
                .into_iter()
                .map(|s| {
                    json!({
                        "name": s.name,
                        "flake": s.package_ref,
                        "state": format!("{:?}", s.state),
                        "started_at": s.started_at.map(|_| "running".to_string()),
                        "error": s.error,
                    })
                })
                .collect();
            json!({ "lsps": lsps })
        }
        ControlRequest::List => {
            json!({ "lsps": pool.names().await })
        }
        ControlRequest::Start { name } => {
            let template = crate::instance::InitTemplate::default();
            match pool.get_or_start(&name, &template).await {
                Ok(_) => json!({ "ok": true }),
                Err(e) => json!({ "error": e.to_string() }),
            }
        }
        ControlRequest::Stop { name } => match pool.stop(&name).await {
            Ok(()) => json!({ "ok": true }),
            Err(e) => json!({ "error": e.to_string() }),
        },
        ControlRequest::Warmup { dir } => {
            let pool = pool.clone();
            let router = router.clone();
            tokio::spawn(async move {
                warmup::warmup(dir, &router, &pool).await;
            });
            json!({ "ok": true })
        }
    }
}

/// A thin client for the control socket, used by the CLI's
/// `status`/`start`/`stop`/`warmup` subcommands (spec §6 "CLI surface").
pub struct ControlClient;

impl ControlClient {
    /// Sends one request and returns the parsed response line.
    pub async fn send(socket_path: &Path, request: Value) -> std::io::Result<Value> {
        let stream = UnixStream::connect(socket_path).await?;
        let (read_half, mut write_half) = stream.into_split();
        let mut line = request.to_string();
        line.push('\n');
        write_half.write_all(line.as_bytes()).await?;

        let mut reader = BufReader::new(read_half);
        let mut reply = String::new();
        reader.read_line(&mut reply).await?;
        serde_json::from_str(&reply)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub async fn status(socket_path: &Path) -> std::io::Result<Value> {
        Self::send(socket_path, json!({"command": "status"})).await
    }

    pub async fn list(socket_path: &Path) -> std::io::Result<Value> {
        Self::send(socket_path, json!({"command": "list"})).await
    }

    pub async fn start(socket_path: &Path, name: &str) -> std::io::Result<Value> {
        Self::send(socket_path, json!({"command": "start", "name": name})).await
    }

    pub async fn stop(socket_path: &Path, name: &str) -> std::io::Result<Value> {
        Self::send(socket_path, json!({"command": "stop", "name": name})).await
    }

    pub async fn warmup(socket_path: &Path, dir: &Path) -> std::io::Result<Value> {
        Self::send(socket_path, json!({"command": "warmup", "dir": dir})).await
    }
}
