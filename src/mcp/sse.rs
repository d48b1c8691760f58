// SPDX-License-Identifier: MIT
//! MCP SSE transport (spec §6 "mcp sse"): `GET /sse` opens an
//! event-stream and immediately announces a session-scoped `POST`
//! endpoint; the client posts one MCP message per request to that
//! endpoint and receives the response back over the open SSE stream.
//!
//! Grounded in the teacher's `rest::sse::session_events_sse` (an
//! `axum::response::sse::Sse` stream fed by a broadcast channel, with a
//! keep-alive ping) generalised from session push-events to MCP
//! responses, plus its own `rest::mod` router-building shape for how
//! routes are assembled onto one `axum::Router<Arc<...>>`.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router as AxumRouter};
use futures_util::stream::{self, Stream};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, Mutex};
use tower_http::cors::CorsLayer;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::document_manager::{BackendSource, DocumentManager};

use super::transport::McpResourceUpdatedNotification;
use super::McpServer;

/// One open SSE session: the client's `POST` target and the channel its
/// responses are pushed through.
struct Session {
    tx: mpsc::UnboundedSender<String>,
}

#[derive(Clone)]
struct SseState {
    mcp: Arc<McpServer>,
    sessions: Arc<Mutex<HashMap<String, Session>>>,
    document_manager: Arc<DocumentManager>,
    backend_source: Arc<dyn BackendSource>,
}

/// Builds the SSE transport's router: `GET /sse`, `POST /message`, and
/// the three document-lifecycle auxiliary endpoints `POST
/// /documents/open|close|close-all` (spec §6 "SSE").
pub fn router(
    mcp: Arc<McpServer>,
    document_manager: Arc<DocumentManager>,
    backend_source: Arc<dyn BackendSource>,
) -> AxumRouter {
    let state = SseState {
        mcp,
        sessions: Arc::new(Mutex::new(HashMap::new())),
        document_manager,
        backend_source,
    };
    AxumRouter::new()
        .route("/sse", get(sse_handler))
        .route("/message", post(message_handler))
        .route("/documents/open", post(documents_open))
        .route("/documents/close", post(documents_close))
        .route("/documents/close-all", post(documents_close_all))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct DocumentUri {
    uri: String,
}

async fn documents_open(State(state): State<SseState>, Json(body): Json<DocumentUri>) -> impl IntoResponse {
    match state
        .document_manager
        .open(state.backend_source.as_ref(), &body.uri, None)
        .await
    {
        Ok(()) => axum::http::StatusCode::OK,
        Err(e) => {
            warn!(uri = %body.uri, err = %e, "documents/open failed");
            axum::http::StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn documents_close(State(state): State<SseState>, Json(body): Json<DocumentUri>) -> impl IntoResponse {
    match state.document_manager.close(state.backend_source.as_ref(), &body.uri).await {
        Ok(()) => axum::http::StatusCode::OK,
        Err(e) => {
            warn!(uri = %body.uri, err = %e, "documents/close failed");
            axum::http::StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn documents_close_all(State(state): State<SseState>) -> impl IntoResponse {
    state.document_manager.close_all(state.backend_source.as_ref()).await;
    axum::http::StatusCode::OK
}

async fn sse_handler(
    State(state): State<SseState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let session_id = Uuid::new_v4().to_string();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let diagnostics_tx = tx.clone();
    let mut diagnostics_updates = state.mcp.diagnostics().subscribe();
    tokio::spawn(async move {
        loop {
            match diagnostics_updates.recv().await {
                Ok(event) => {
                    let notification = McpResourceUpdatedNotification::new(event.resource_uri).to_message();
                    let payload = serde_json::to_string(&notification).unwrap_or_default();
                    if diagnostics_tx.send(payload).is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    });

    state.sessions.lock().await.insert(session_id.clone(), Session { tx });

    let endpoint_event = Event::default()
        .event("endpoint")
        .data(format!("/message?session={session_id}"));

    let sessions = state.sessions.clone();
    let session_id_for_cleanup = session_id.clone();
    let body_stream = stream::unfold(
        (Some(endpoint_event), rx, sessions, session_id_for_cleanup),
        move |(first, mut rx, sessions, session_id)| async move {
            if let Some(event) = first {
                return Some((Ok(event), (None, rx, sessions, session_id)));
            }
            match rx.recv().await {
                Some(payload) => {
                    let event = Event::default().event("message").data(payload);
                    Some((Ok(event), (None, rx, sessions, session_id)))
                }
                None => {
                    sessions.lock().await.remove(&session_id);
                    None
                }
            }
        },
    );

    Sse::new(body_stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("ping"))
}

#[derive(Debug, Deserialize)]
struct MessageQuery {
    session: String,
}

async fn message_handler(
    State(state): State<SseState>,
    Query(query): Query<MessageQuery>,
    Json(msg): Json<Value>,
) -> impl IntoResponse {
    let message: super::transport::McpMessage = match serde_json::from_value(msg) {
        Ok(m) => m,
        Err(e) => {
            warn!(err = %e, "mcp sse: malformed message body");
            return axum::http::StatusCode::BAD_REQUEST;
        }
    };

    let Some(response) = state.mcp.handle(message).await else {
        return axum::http::StatusCode::ACCEPTED;
    };

    let sessions = state.sessions.lock().await;
    let Some(session) = sessions.get(&query.session) else {
        debug!(session = %query.session, "mcp sse: post to unknown session");
        return axum::http::StatusCode::NOT_FOUND;
    };
    let payload = serde_json::to_string(&response).unwrap_or_default();
    if session.tx.send(payload).is_err() {
        return axum::http::StatusCode::GONE;
    }
    axum::http::StatusCode::ACCEPTED
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::Bridge;
    use crate::config::FormatterSpec;
    use crate::diagnostics::DiagnosticsStore;
    use crate::document_manager::BackendSource;
    use crate::instance::LspInstance;
    use crate::mcp::transport::McpMessage;
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

    fn document_manager() -> Arc<DocumentManager> {
        Arc::new(DocumentManager::new(Arc::new(LuxRouter::new(&[]))))
    }

    #[test]
    fn router_mounts_sse_message_and_document_routes() {
        let _router = router(mcp_server(), document_manager(), Arc::new(NoBackends));
    }

    #[tokio::test]
    async fn posting_to_an_unknown_session_is_not_found() {
        let state = SseState {
            mcp: mcp_server(),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            document_manager: document_manager(),
            backend_source: Arc::new(NoBackends),
        };
        let msg = McpMessage::request(Value::from(1), "ping", None);
        let resp = message_handler(
            State(state),
            Query(MessageQuery { session: "ghost".into() }),
            Json(serde_json::to_value(&msg).unwrap()),
        )
        .await;
        assert_eq!(resp.into_response().status(), axum::http::StatusCode::NOT_FOUND);
    }
}
