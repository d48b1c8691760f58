// SPDX-License-Identifier: MIT
//! JSON-RPC Connection (spec §4.2).
//!
//! Owns a framed reader/writer pair and an inbound handler. Grounded in the
//! `lspmux` reference client's `PendingMap`/`oneshot` correlation scheme and
//! reader-task shape, generalised so either side of a link (client↔Lux or
//! Lux↔backend) can use the same type.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::codec::{read_message, write_message};
use crate::error::CoreError;
use crate::rpc::message::{JsonRpcMessage, RequestId, RpcError};

/// Implemented by whatever owns routing for inbound Requests/Notifications
/// on this connection (the client-facing Handler, or an LSP Instance's
/// server-initiated-request responder).
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// Handle an inbound request; returns the JSON `result` or a structured
    /// error. Must not block the read loop for longer than a short,
    /// deterministic bound — issue a reverse `call` from a spawned task if
    /// a handler needs one (spec §4.2 invariant).
    async fn handle_request(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError>;

    /// Handle an inbound notification. No reply is possible.
    async fn handle_notification(&self, method: &str, params: Option<Value>);
}

type PendingMap = Arc<Mutex<HashMap<RequestId, oneshot::Sender<Result<Value, RpcError>>>>>;

struct WriterState<W> {
    writer: W,
}

/// A full-duplex JSON-RPC connection over `(R, W)`.
pub struct Connection<W> {
    writer: Arc<Mutex<WriterState<W>>>,
    pending: PendingMap,
    next_id: AtomicI64,
    cancel: CancellationToken,
}

impl<W> Connection<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Spawns the read loop over `reader`, dispatching Responses to
    /// outstanding `call`s and Requests/Notifications to `handler`.
    /// Returns the connection handle plus a join handle for the read loop.
    pub fn spawn<R>(
        reader: R,
        writer: W,
        handler: Arc<dyn InboundHandler>,
    ) -> (Arc<Self>, tokio::task::JoinHandle<()>)
    where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        let conn = Arc::new(Connection {
            writer: Arc::new(Mutex::new(WriterState { writer })),
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicI64::new(1),
            cancel: CancellationToken::new(),
        });

        let join = tokio::spawn(Self::run_loop(
            reader,
            conn.pending.clone(),
            conn.writer.clone(),
            handler,
            conn.cancel.clone(),
        ));

        (conn, join)
    }

    async fn run_loop<R>(
        mut reader: R,
        pending: PendingMap,
        writer: Arc<Mutex<WriterState<W>>>,
        handler: Arc<dyn InboundHandler>,
        cancel: CancellationToken,
    ) where
        R: AsyncBufRead + Unpin + Send + 'static,
    {
        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => break,
                msg = read_message(&mut reader) => msg,
            };

            let msg = match msg {
                Ok(msg) => msg,
                Err(e) => {
                    debug!(err = %e, "connection read loop ending");
                    break;
                }
            };

            match msg {
                JsonRpcMessage::Response { id, result, error } => {
                    let mut guard = pending.lock().await;
                    if let Some(tx) = guard.remove(&id) {
                        let out = match error {
                            Some(e) => Err(e),
                            None => Ok(result.unwrap_or(Value::Null)),
                        };
                        let _ = tx.send(out);
                    } else {
                        warn!(%id, "response for unknown id — dropping");
                    }
                }
                JsonRpcMessage::Request { id, method, params } => {
                    let handler = handler.clone();
                    let writer = writer.clone();
                    tokio::spawn(async move {
                        let result = handler.handle_request(&method, params).await;
                        let reply = match result {
                            Ok(value) => JsonRpcMessage::response_ok(id, value),
                            Err(err) => JsonRpcMessage::response_err(id, err),
                        };
                        let mut guard = writer.lock().await;
                        if let Err(e) = write_message(&mut guard.writer, &reply).await {
                            warn!(err = %e, "failed to write response");
                        }
                    });
                }
                JsonRpcMessage::Notification { method, params } => {
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        handler.handle_notification(&method, params).await;
                    });
                }
            }
        }

        // Resolve every outstanding call with ConnectionClosed (invariant,
        // spec §4.2 / §8 property 5).
        let mut guard = pending.lock().await;
        for (_, tx) in guard.drain() {
            let _ = tx.send(Err(RpcError::from(CoreError::ConnectionClosed)));
        }
    }

    fn next_request_id(&self) -> RequestId {
        RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Sends a request and suspends until the matching response arrives, the
    /// token is cancelled, or the connection closes.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        token: CancellationToken,
    ) -> Result<Value, RpcError> {
        let id = self.next_request_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        let msg = JsonRpcMessage::request(id.clone(), method, params);
        {
            let mut guard = self.writer.lock().await;
            if let Err(e) = write_message(&mut guard.writer, &msg).await {
                self.pending.lock().await.remove(&id);
                return Err(RpcError::from(e));
            }
        }

        tokio::select! {
            _ = token.cancelled() => {
                self.cancel_call(&id).await;
                Err(RpcError::from(CoreError::Cancelled))
            }
            result = rx => {
                result.unwrap_or_else(|_| Err(RpcError::from(CoreError::ConnectionClosed)))
            }
        }
    }

    /// Sends `$/cancelRequest` and resolves the pending call with
    /// `Cancelled` (spec §4.2 `cancel`).
    async fn cancel_call(&self, id: &RequestId) {
        if let Some(tx) = self.pending.lock().await.remove(id) {
            let _ = tx.send(Err(RpcError::from(CoreError::Cancelled)));
        }
        let params = serde_json::json!({ "id": id_value(id) });
        let _ = self.notify("$/cancelRequest", Some(params)).await;
    }

    /// Writes a notification; returns once bytes are accepted.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), CoreError> {
        let msg = JsonRpcMessage::notification(method, params);
        let mut guard = self.writer.lock().await;
        write_message(&mut guard.writer, &msg).await
    }

    /// Stops the read loop; every outstanding call resolves with
    /// `ConnectionClosed`.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

fn id_value(id: &RequestId) -> Value {
    match id {
        RequestId::Number(n) => Value::from(*n),
        RequestId::String(s) => Value::String(s.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncWriteExt, BufReader};

    struct EchoHandler;

    #[async_trait]
    impl InboundHandler for EchoHandler {
        async fn handle_request(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
            Ok(serde_json::json!({"echo": method, "params": params}))
        }
        async fn handle_notification(&self, _method: &str, _params: Option<Value>) {}
    }

    #[tokio::test]
    async fn call_resolves_with_matching_response() {
        // Wire two in-memory duplex pipes so the connection's own writer
        // loops back to its own reader, simulating a peer that echoes.
        let (client_side, backend_side) = tokio::io::duplex(8192);
        let (backend_read, mut backend_write) = tokio::io::split(backend_side);
        let mut backend_read = BufReader::new(backend_read);

        let (client_read, client_write) = tokio::io::split(client_side);
        let (conn, _join) = Connection::spawn(
            BufReader::new(client_read),
            client_write,
            Arc::new(EchoHandler),
        );

        // Spawn a fake backend that reads one request and replies.
        tokio::spawn(async move {
            let msg = read_message(&mut backend_read).await.unwrap();
            if let JsonRpcMessage::Request { id, .. } = msg {
                let reply = JsonRpcMessage::response_ok(id, serde_json::json!("pong"));
                write_message(&mut backend_write, &reply).await.unwrap();
            }
        });

        let result = conn
            .call("ping", None, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!("pong"));
    }

    #[tokio::test]
    async fn close_resolves_outstanding_calls_with_connection_closed() {
        let (client_side, _backend_side) = tokio::io::duplex(8192);
        let (client_read, client_write) = tokio::io::split(client_side);
        let (conn, join) = Connection::spawn(
            BufReader::new(client_read),
            client_write,
            Arc::new(EchoHandler),
        );

        let conn2 = conn.clone();
        let call_task = tokio::spawn(async move {
            conn2.call("slow", None, CancellationToken::new()).await
        });

        // Give the call a moment to register, then close.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        conn.close();
        let _ = join.await;

        let result = call_task.await.unwrap();
        assert!(matches!(result, Err(RpcError { code, .. }) if code == crate::rpc::message::INTERNAL_ERROR));
    }
}
