// SPDX-License-Identifier: MIT
//! MCP stdio transport (spec §6 "mcp stdio"): one MCP JSON-RPC message per
//! line on stdin, one per line on stdout — the same newline-delimited
//! framing the Control Socket uses, not LSP's `Content-Length` framing.
//!
//! Grounded in the teacher's `mcp::transport::run_stdio` loop (read line,
//! parse, dispatch, write line) and Only1MCP's stdio MCP server reference.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use super::transport::{McpError, McpMessage, McpResourceUpdatedNotification, MCP_PARSE_ERROR};
use super::McpServer;

/// Runs the stdio transport to completion (EOF on stdin, or a write
/// error). Each line read is parsed as one [`McpMessage`]; a line that
/// fails to parse gets a `parse error` response rather than killing the
/// loop, since a single malformed line shouldn't take down the session.
/// Interleaved with the read/dispatch/write loop, this also drains the
/// server's [`crate::diagnostics::DiagnosticsStore`] and writes
/// `notifications/resources/updated` lines to the same output as soon as
/// they fire (spec §4.10, §6).
pub async fn run<R, W>(server: Arc<McpServer>, input: R, mut output: W) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(input).lines();
    let mut updates = Some(server.diagnostics().subscribe());

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let msg: McpMessage = match serde_json::from_str(&line) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(err = %e, "mcp stdio: failed to parse message");
                        let resp = super::transport::McpResponse::error(
                            serde_json::Value::Null,
                            McpError::new(MCP_PARSE_ERROR, format!("parse error: {e}")),
                        );
                        write_line(&mut output, &resp).await?;
                        continue;
                    }
                };

                if let Some(response) = server.handle(msg).await {
                    write_line(&mut output, &response).await?;
                }
            }
            update = recv_update(&mut updates) => {
                match update {
                    Some(Ok(event)) => {
                        let notification = McpResourceUpdatedNotification::new(event.resource_uri).to_message();
                        write_line(&mut output, &notification).await?;
                    }
                    Some(Err(RecvError::Lagged(_))) => continue,
                    Some(Err(RecvError::Closed)) | None => updates = None,
                }
            }
        }
    }

    debug!("mcp stdio: input closed, shutting down");
    Ok(())
}

/// Awaits the next diagnostics update, or never resolves once the
/// receiver has been torn down — keeps the `select!` loop above from
/// busy-spinning on a closed channel.
async fn recv_update(
    updates: &mut Option<tokio::sync::broadcast::Receiver<crate::diagnostics::ResourceUpdated>>,
) -> Option<Result<crate::diagnostics::ResourceUpdated, RecvError>> {
    match updates {
        Some(rx) => Some(rx.recv().await),
        None => std::future::pending().await,
    }
}

async fn write_line<W, T>(output: &mut W, value: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let mut text = serde_json::to_string(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    text.push('\n');
    output.write_all(text.as_bytes()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::Bridge;
    use crate::config::FormatterSpec;
    use crate::diagnostics::DiagnosticsStore;
    use crate::document_manager::BackendSource;
    use crate::instance::LspInstance;
    use crate::router::Router;

    struct NoBackends;

    #[async_trait::async_trait]
    impl BackendSource for NoBackends {
        async fn instance_for(&self, _backend_name: &str) -> Option<Arc<LspInstance>> {
            None
        }
    }

    fn server() -> Arc<McpServer> {
        let bridge = Arc::new(Bridge::new(
            Arc::new(NoBackends),
            Arc::new(Router::new(&[])),
            None,
            Vec::<FormatterSpec>::new(),
        ));
        Arc::new(McpServer::new(bridge, Arc::new(DiagnosticsStore::new())))
    }

    #[tokio::test]
    async fn initialize_request_gets_one_reply_line() {
        let input = b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"initialize\"}\n".to_vec();
        let mut output = Vec::new();
        run(server(), input.as_slice(), &mut output).await.unwrap();

        let text = String::from_utf8(output).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 1);
        let value: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(value["result"]["serverInfo"]["name"], "lux");
    }

    #[tokio::test]
    async fn malformed_line_gets_a_parse_error_and_the_loop_continues() {
        let input = b"not json\n{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"ping\"}\n".to_vec();
        let mut output = Vec::new();
        run(server(), input.as_slice(), &mut output).await.unwrap();

        let text = String::from_utf8(output).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["error"]["code"], MCP_PARSE_ERROR);
    }

    #[tokio::test]
    async fn notification_produces_no_output() {
        let input = b"{\"jsonrpc\":\"2.0\",\"method\":\"initialized\"}\n".to_vec();
        let mut output = Vec::new();
        run(server(), input.as_slice(), &mut output).await.unwrap();
        assert!(output.is_empty());
    }
}
