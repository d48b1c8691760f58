// SPDX-License-Identifier: MIT
//! The client-facing Handler and the `Server` hub (spec §4.7, §9).
//!
//! `Server` is the single lifetime root described in the design notes:
//! it owns the [`Pool`], the [`Router`], and (once a client connects) a
//! handle back to the client's own JSON-RPC connection. Each freshly
//! constructed `LspInstance` is handed a [`UpstreamForwarder`] that holds
//! only a `Weak<Server>`, so instances never keep the hub alive and the
//! Handler→Pool→Instance→(weak)→Server cycle never leaks.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::builder::Builder;
use crate::config::LuxConfig;
use crate::diagnostics::DiagnosticsStore;
use crate::error::CoreError;
use crate::instance::{InitTemplate, LspInstance, UpstreamForwarder};
use crate::pool::Pool;
use crate::rpc::connection::{Connection, InboundHandler};
use crate::rpc::message::RpcError;
use crate::router::Router;

/// Narrow sink the hub uses to forward a server-initiated request to
/// whichever client connection is currently attached — independent of the
/// writer type a given transport uses.
#[async_trait]
pub trait ClientSink: Send + Sync {
    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError>;
}

#[async_trait]
impl<W> ClientSink for Connection<W>
where
    W: tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        Connection::call(self, method, params, CancellationToken::new()).await
    }
}

struct WeakForwarder(Weak<Server>);

#[async_trait]
impl UpstreamForwarder for WeakForwarder {
    async fn forward_request(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        match self.0.upgrade() {
            Some(server) => server.forward_to_client(method, params).await,
            None => Err(RpcError::internal("server hub dropped")),
        }
    }
}

/// The hub: owns the Pool and Router, and (once attached) the client
/// connection. One `Server` per running `lux serve` / `lux mcp ...`
/// process (spec §9 "the hub is the single lifetime root").
pub struct Server {
    pub pool: Arc<Pool>,
    pub router: Arc<Router>,
    pub config: Arc<LuxConfig>,
    client: RwLock<Option<Arc<dyn ClientSink>>>,
    init_template: RwLock<InitTemplate>,
}

impl Server {
    pub fn new(config: Arc<LuxConfig>, builder: Arc<Builder>, diagnostics: Arc<DiagnosticsStore>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Server>| {
            let upstream: Arc<dyn UpstreamForwarder> = Arc::new(WeakForwarder(weak.clone()));
            let pool = Arc::new(Pool::new(&config.backends, builder, Some(upstream), diagnostics));
            let router = Arc::new(Router::new(&config.routes));
            Server {
                pool,
                router,
                config,
                client: RwLock::new(None),
                init_template: RwLock::new(InitTemplate::default()),
            }
        })
    }

    /// Attaches the client connection once the transport has established
    /// it, so server-initiated requests (`workspace/configuration`,
    /// `client/registerCapability`, window messages) can be forwarded.
    pub async fn attach_client(&self, sink: Arc<dyn ClientSink>) {
        *self.client.write().await = Some(sink);
    }

    pub async fn init_template(&self) -> InitTemplate {
        self.init_template.read().await.clone()
    }

    async fn forward_to_client(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        let client = self.client.read().await.clone();
        match client {
            Some(sink) => sink.call(method, params).await,
            None => default_upstream_reply(method),
        }
    }

    /// Handles every inbound client *request* (spec §4.7).
    pub async fn handle_request(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        match method {
            "initialize" => self.handle_initialize(params).await,
            "shutdown" => {
                self.pool.stop_all().await;
                Ok(Value::Null)
            }
            _ => self
                .route_and_forward_request(method, params)
                .await
                .map_err(RpcError::from),
        }
    }

    /// Handles every inbound client *notification* (spec §4.7).
    pub async fn handle_notification(&self, method: &str, params: Option<Value>) {
        if method == "initialized" || method.starts_with("$/") {
            debug!(method, "client notification — no forwarding");
            return;
        }
        if method == "exit" {
            self.pool.stop_all().await;
            return;
        }

        if method == "textDocument/didOpen" {
            if let (Some(uri), Some(lang)) = (extract_uri(&params), extract_language_id(&params)) {
                self.router.record_language(&uri, &lang);
            }
        }
        if method == "textDocument/didClose" {
            if let Some(uri) = extract_uri(&params) {
                self.router.forget_language(&uri);
            }
        }

        if let Err(e) = self.route_and_forward_notification(method, params).await {
            debug!(method, err = %e, "failed to route client notification");
        }
    }

    async fn handle_initialize(&self, params: Option<Value>) -> Result<Value, RpcError> {
        let params = params.unwrap_or(Value::Null);
        let root_uri = params
            .get("rootUri")
            .and_then(Value::as_str)
            .map(str::to_string);
        let root_path = params
            .get("rootPath")
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .or_else(|| {
                root_uri
                    .as_deref()
                    .and_then(|u| url::Url::parse(u).ok())
                    .and_then(|u| u.to_file_path().ok())
            });
        let initialization_options = params.get("initializationOptions").cloned().unwrap_or(Value::Null);

        *self.init_template.write().await = InitTemplate {
            root_path,
            root_uri,
            initialization_options,
        };

        let capabilities = self.aggregate_capabilities().await;
        Ok(json!({
            "capabilities": capabilities,
            "serverInfo": { "name": "lux", "version": env!("CARGO_PKG_VERSION") },
        }))
    }

    /// Publishes the union of all configured backends' capabilities (spec
    /// §4.6 "Capability aggregation (client-facing)"). A backend with no
    /// cached capabilities (never started) falls back to the conservative
    /// default chosen in DESIGN.md rather than forcing a live handshake.
    async fn aggregate_capabilities(&self) -> Value {
        let mut per_backend = Vec::with_capacity(self.config.backends.len());
        for backend in &self.config.backends {
            let cached = match self.pool.get(&backend.name).await {
                Some(instance) => instance.capabilities().await,
                None => None,
            };
            per_backend.push(cached.unwrap_or_else(default_conservative_capabilities));
        }
        aggregate_capability_set(&per_backend)
    }

    async fn route_and_forward_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, CoreError> {
        let uri = extract_uri(&params);
        let backend_name = uri
            .as_deref()
            .and_then(|u| self.router.route_uri(u))
            .ok_or(CoreError::NotConfigured)?;
        let template = self.init_template.read().await.clone();
        let instance = self.pool.get_or_start(&backend_name, &template).await?;
        instance
            .call(&template, method, params, CancellationToken::new())
            .await
    }

    async fn route_and_forward_notification(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), CoreError> {
        let uri = extract_uri(&params);
        let Some(backend_name) = uri.as_deref().and_then(|u| self.router.route_uri(u)) else {
            return Ok(()); // dropped — no backend configured for this file
        };
        let template = self.init_template.read().await.clone();
        let instance = self.pool.get_or_start(&backend_name, &template).await?;
        instance.notify(&template, method, params).await
    }
}

/// Lets the Document Manager and MCP Bridge lazily start backends through
/// the same Pool the client-facing Handler uses, without depending on
/// `Server`'s concrete type.
#[async_trait]
impl crate::document_manager::BackendSource for Server {
    /// Returns the registered instance without starting it — the caller
    /// (Document Manager, Bridge) starts it with its own per-call
    /// `InitTemplate` rooted at the discovered project directory, not the
    /// client's global one (spec §4.9 step 2).
    async fn instance_for(&self, backend_name: &str) -> Option<Arc<LspInstance>> {
        self.pool.get(backend_name).await
    }
}

/// The `InboundHandler` the client's own `Connection` is spawned with —
/// thin glue onto `Server`.
pub struct ClientHandler {
    server: Arc<Server>,
}

impl ClientHandler {
    pub fn new(server: Arc<Server>) -> Self {
        ClientHandler { server }
    }
}

#[async_trait]
impl InboundHandler for ClientHandler {
    async fn handle_request(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        self.server.handle_request(method, params).await
    }

    async fn handle_notification(&self, method: &str, params: Option<Value>) {
        self.server.handle_notification(method, params).await;
    }
}

fn extract_uri(params: &Option<Value>) -> Option<String> {
    params
        .as_ref()?
        .get("textDocument")?
        .get("uri")?
        .as_str()
        .map(str::to_string)
}

fn extract_language_id(params: &Option<Value>) -> Option<String> {
    params
        .as_ref()?
        .get("textDocument")?
        .get("languageId")?
        .as_str()
        .map(str::to_string)
}

/// The source's capability aggregation accepts cached per-backend
/// capabilities when present; see DESIGN.md for the decision to fall back
/// to this conservative default (hover/definition/references, no
/// completion triggers) rather than forcing a live handshake.
fn default_conservative_capabilities() -> Value {
    json!({
        "hoverProvider": true,
        "definitionProvider": true,
        "referencesProvider": true,
    })
}

fn default_upstream_reply(method: &str) -> Result<Value, RpcError> {
    match method {
        "client/registerCapability" | "workspace/applyEdit" => Ok(json!({"applied": true})),
        _ if method.starts_with("window/") => Ok(Value::Null),
        other => Err(RpcError::method_not_found(other)),
    }
}

/// Pure aggregation step, factored out of `Server::aggregate_capabilities`
/// so it is directly testable against spec §8 scenario S2 without
/// spawning real backend processes: boolean providers OR together,
/// `completionProvider.triggerCharacters` lists union (deduplicated), and
/// `textDocumentSync` takes the max of the legal numeric sync kinds.
fn aggregate_capability_set(per_backend: &[Value]) -> Value {
    let mut hover = false;
    let mut definition = false;
    let mut references = false;
    let mut rename = false;
    let mut document_symbol = false;
    let mut code_action = false;
    let mut workspace_symbol = false;
    let mut formatting = false;
    let mut triggers: BTreeSet<String> = BTreeSet::new();
    let mut sync_kind: i64 = 0;

    for caps in per_backend {
        hover |= bool_cap(caps, "hoverProvider");
        definition |= bool_cap(caps, "definitionProvider");
        references |= bool_cap(caps, "referencesProvider");
        rename |= bool_cap(caps, "renameProvider");
        document_symbol |= bool_cap(caps, "documentSymbolProvider");
        code_action |= bool_cap(caps, "codeActionProvider");
        workspace_symbol |= bool_cap(caps, "workspaceSymbolProvider");
        formatting |= bool_cap(caps, "documentFormattingProvider");

        if let Some(chars) = caps
            .get("completionProvider")
            .and_then(|c| c.get("triggerCharacters"))
            .and_then(Value::as_array)
        {
            for c in chars {
                if let Some(s) = c.as_str() {
                    triggers.insert(s.to_string());
                }
            }
        }

        let kind = match caps.get("textDocumentSync") {
            Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
            Some(Value::Object(obj)) => obj.get("change").and_then(Value::as_i64).unwrap_or(0),
            _ => 0,
        };
        sync_kind = sync_kind.max(kind);
    }

    let mut result = json!({
        "hoverProvider": hover,
        "definitionProvider": definition,
        "referencesProvider": references,
        "renameProvider": rename,
        "documentSymbolProvider": document_symbol,
        "codeActionProvider": code_action,
        "workspaceSymbolProvider": workspace_symbol,
        "documentFormattingProvider": formatting,
        "textDocumentSync": sync_kind,
    });

    if !triggers.is_empty() {
        result["completionProvider"] = json!({
            "triggerCharacters": triggers.into_iter().collect::<Vec<_>>(),
        });
    }

    result
}

fn bool_cap(caps: &Value, key: &str) -> bool {
    caps.get(key).and_then(Value::as_bool).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s2_client_initialize_aggregates_capabilities() {
        // S2: gopls and pyright both advertise hover=true and a "." trigger;
        // definitionProvider is present via the default fallback path.
        let gopls = json!({
            "hoverProvider": true,
            "completionProvider": {"triggerCharacters": ["."]},
        });
        let pyright = json!({
            "hoverProvider": true,
            "completionProvider": {"triggerCharacters": ["."]},
        });
        let merged = aggregate_capability_set(&[gopls, pyright]);
        assert_eq!(merged["hoverProvider"], true);
        assert_eq!(
            merged["completionProvider"]["triggerCharacters"],
            json!(["."])
        );
    }

    #[test]
    fn missing_cache_falls_back_to_conservative_default() {
        let merged = aggregate_capability_set(&[default_conservative_capabilities()]);
        assert_eq!(merged["definitionProvider"], true);
        assert_eq!(merged["hoverProvider"], true);
        assert!(merged.get("completionProvider").is_none());
    }

    #[test]
    fn sync_kind_takes_the_max_across_backends() {
        let a = json!({"textDocumentSync": 1});
        let b = json!({"textDocumentSync": {"change": 2}});
        let merged = aggregate_capability_set(&[a, b]);
        assert_eq!(merged["textDocumentSync"], 2);
    }

    #[test]
    fn default_upstream_reply_answers_registercapability_and_applyedit() {
        assert_eq!(
            default_upstream_reply("client/registerCapability").unwrap(),
            json!({"applied": true})
        );
        assert_eq!(
            default_upstream_reply("workspace/applyEdit").unwrap(),
            json!({"applied": true})
        );
        assert!(default_upstream_reply("window/showMessage").unwrap().is_null());
        assert!(default_upstream_reply("some/unknownMethod").is_err());
    }
}
