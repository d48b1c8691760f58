// SPDX-License-Identifier: MIT
//! LSP base-protocol framing (spec §4.1): an ASCII header block terminated
//! by `\r\n\r\n`, followed by exactly `Content-Length` bytes of UTF-8 JSON.
//!
//! Grounded in the header-parsing loop of the `lspmux` reference client's
//! `reader_loop` and the `Content-Length` writer in the teacher's
//! `lsp::proxy::ServerState::send`, rebuilt on `tokio::io` so both
//! directions (client↔Lux, Lux↔backend) can share one implementation.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::CoreError;
use crate::rpc::message::JsonRpcMessage;

/// Messages larger than this are rejected as a framing error rather than
/// read into memory unbounded.
pub const MAX_MESSAGE_BYTES: usize = 100 * 1024 * 1024;

/// Reads one framed JSON-RPC message from `reader`.
///
/// Headers are parsed case-insensitively; any header other than
/// `Content-Length` (notably `Content-Type`) is accepted and ignored.
pub async fn read_message<R>(reader: &mut R) -> Result<JsonRpcMessage, CoreError>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(CoreError::Io)?;
        if n == 0 {
            return Err(CoreError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream closed while reading headers",
            )));
        }

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }

        let mut parts = trimmed.splitn(2, ':');
        let name = parts.next().unwrap_or_default().trim();
        let value = parts.next().unwrap_or_default().trim();

        if name.eq_ignore_ascii_case("content-length") {
            let len: usize = value
                .parse()
                .map_err(|_| CoreError::Framing(format!("invalid Content-Length: {value:?}")))?;
            if len > MAX_MESSAGE_BYTES {
                return Err(CoreError::Framing(format!(
                    "Content-Length {len} exceeds maximum {MAX_MESSAGE_BYTES}"
                )));
            }
            content_length = Some(len);
        }
        // Unknown headers (Content-Type, ...) are skipped.
    }

    let len = content_length
        .ok_or_else(|| CoreError::Framing("missing Content-Length header".to_string()))?;

    let mut body = vec![0u8; len];
    tokio::io::AsyncReadExt::read_exact(reader, &mut body)
        .await
        .map_err(CoreError::Io)?;

    let value: serde_json::Value = serde_json::from_slice(&body).map_err(CoreError::Parse)?;
    JsonRpcMessage::from_value(value)
}

/// Writes one framed JSON-RPC message to `writer` and flushes.
///
/// Callers are responsible for serialising concurrent writers on the same
/// stream (spec §4.1: "concurrent writes on the same stream must be
/// serialised by the caller").
pub async fn write_message<W>(writer: &mut W, msg: &JsonRpcMessage) -> Result<(), CoreError>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(&msg.to_value()).map_err(CoreError::Parse)?;
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    writer
        .write_all(header.as_bytes())
        .await
        .map_err(CoreError::Io)?;
    writer.write_all(&body).await.map_err(CoreError::Io)?;
    writer.flush().await.map_err(CoreError::Io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::message::RequestId;

    #[tokio::test]
    async fn framing_round_trip_ping() {
        // S1: {"jsonrpc":"2.0","id":1,"method":"ping"} round-trips exactly.
        let msg = JsonRpcMessage::Request {
            id: RequestId::Number(1),
            method: "ping".to_string(),
            params: None,
        };

        let mut buf = Vec::new();
        write_message(&mut buf, &msg).await.unwrap();

        let header_line = std::str::from_utf8(&buf).unwrap();
        assert!(header_line.starts_with("Content-Length: "));
        assert!(header_line.contains("\r\n\r\n"));

        let mut reader = tokio::io::BufReader::new(&buf[..]);
        let parsed = read_message(&mut reader).await.unwrap();

        match parsed {
            JsonRpcMessage::Request { id, method, params } => {
                assert_eq!(id, RequestId::Number(1));
                assert_eq!(method, "ping");
                assert!(params.is_none());
            }
            other => panic!("expected Request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejects_truncated_body() {
        let bytes = b"Content-Length: 50\r\n\r\n{\"jsonrpc\":\"2.0\"}";
        let mut reader = tokio::io::BufReader::new(&bytes[..]);
        let result = read_message(&mut reader).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn rejects_missing_content_length() {
        let bytes = b"Content-Type: application/vscode-jsonrpc\r\n\r\n";
        let mut reader = tokio::io::BufReader::new(&bytes[..]);
        let result = read_message(&mut reader).await;
        assert!(matches!(result, Err(CoreError::Framing(_))));
    }

    #[tokio::test]
    async fn ignores_unknown_headers() {
        let msg = JsonRpcMessage::Notification {
            method: "initialized".to_string(),
            params: None,
        };
        let body = serde_json::to_vec(&msg.to_value()).unwrap();
        let mut bytes = format!(
            "Content-Type: application/vscode-jsonrpc; charset=utf-8\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        bytes.extend_from_slice(&body);

        let mut reader = tokio::io::BufReader::new(&bytes[..]);
        let parsed = read_message(&mut reader).await.unwrap();
        assert!(matches!(parsed, JsonRpcMessage::Notification { .. }));
    }
}
