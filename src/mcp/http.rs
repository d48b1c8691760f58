// SPDX-License-Identifier: MIT
//! MCP streamable-HTTP transport (spec §6 "mcp http"): a single
//! `POST /mcp` endpoint. A request carrying an MCP request gets back
//! its response as a JSON body; a request carrying only notifications
//! gets back `202 Accepted` with an empty body. `GET /mcp/events` carries
//! the otherwise-unsolicited `notifications/resources/updated` pushes
//! (spec §4.10) that a single request/response endpoint has no room for.
//!
//! Grounded in the teacher's `rest::start_rest_server`/`build_router`
//! shape (bind a `SocketAddr`, build an `axum::Router`, `axum::serve`)
//! adapted to MCP's single-endpoint, single-message-per-request contract
//! rather than teacher's many REST resource routes; the events endpoint
//! reuses the same `rest::sse` push pattern the SSE transport uses.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::{self, Stream};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use super::transport::{McpMessage, McpResourceUpdatedNotification};
use super::McpServer;

/// Builds the streamable-HTTP transport's router: `POST /mcp`, `GET /mcp/events`.
pub fn router(mcp: Arc<McpServer>) -> Router {
    Router::new()
        .route("/mcp", post(mcp_handler))
        .route("/mcp/events", get(events_handler))
        .layer(CorsLayer::permissive())
        .with_state(mcp)
}

/// Binds `addr` and serves the streamable-HTTP transport until the
/// process is killed.
pub async fn serve(addr: SocketAddr, mcp: Arc<McpServer>) -> anyhow::Result<()> {
    let router = router(mcp);
    info!(%addr, "mcp streamable-http listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

async fn mcp_handler(State(mcp): State<Arc<McpServer>>, Json(body): Json<Value>) -> impl IntoResponse {
    let message: McpMessage = match serde_json::from_value(body) {
        Ok(m) => m,
        Err(e) => {
            warn!(err = %e, "mcp http: malformed request body");
            return (axum::http::StatusCode::BAD_REQUEST, Json(Value::Null));
        }
    };

    match mcp.handle(message).await {
        Some(response) => (
            axum::http::StatusCode::OK,
            Json(serde_json::to_value(response).unwrap_or(Value::Null)),
        ),
        None => (axum::http::StatusCode::ACCEPTED, Json(Value::Null)),
    }
}

/// Streams `notifications/resources/updated` events as they're published
/// to the Diagnostics Store, for clients that keep this connection open
/// alongside their `POST /mcp` requests (spec §4.10).
async fn events_handler(
    State(mcp): State<Arc<McpServer>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let updates = mcp.diagnostics().subscribe();
    let events = stream::unfold(updates, |mut updates| async move {
        loop {
            match updates.recv().await {
                Ok(event) => {
                    let notification = McpResourceUpdatedNotification::new(event.resource_uri).to_message();
                    let payload = serde_json::to_string(&notification).unwrap_or_default();
                    let sse_event = Event::default().event("message").data(payload);
                    return Some((Ok(sse_event), updates));
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("ping"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::Bridge;
    use crate::config::FormatterSpec;
    use crate::diagnostics::DiagnosticsStore;
    use crate::document_manager::BackendSource;
    use crate::instance::LspInstance;
    use crate::router::Router as LuxRouter;

    struct NoBackends;

    #[async_trait::async_trait]
    impl BackendSource for NoBackends {
        async fn instance_for(&self, _backend_name: &str) -> Option<Arc<LspInstance>> {
            None
        }
    }

    fn mcp_server() -> Arc<McpServer> {
        let bridge = Arc::new(Bridge::new(
            Arc::new(NoBackends),
            Arc::new(LuxRouter::new(&[])),
            None,
            Vec::<FormatterSpec>::new(),
        ));
        Arc::new(McpServer::new(bridge, Arc::new(DiagnosticsStore::new())))
    }

    #[tokio::test]
    async fn request_returns_a_json_response() {
        let msg = McpMessage::request(Value::from(1), "ping", None);
        let (status, Json(body)) =
            mcp_handler(State(mcp_server()), Json(serde_json::to_value(&msg).unwrap())).await;
        assert_eq!(status, axum::http::StatusCode::OK);
        assert_eq!(body["result"], serde_json::json!({}));
    }

    #[tokio::test]
    async fn notification_returns_accepted_with_no_body() {
        let msg = McpMessage::notification("initialized", None);
        let (status, Json(body)) =
            mcp_handler(State(mcp_server()), Json(serde_json::to_value(&msg).unwrap())).await;
        assert_eq!(status, axum::http::StatusCode::ACCEPTED);
        assert_eq!(body, Value::Null);
    }

    #[tokio::test]
    async fn malformed_body_is_bad_request() {
        let (status, _) = mcp_handler(State(mcp_server()), Json(serde_json::json!({"nope": true}))).await;
        assert_eq!(status, axum::http::StatusCode::BAD_REQUEST);
    }
}
