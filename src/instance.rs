// SPDX-License-Identifier: MIT
//! LSP Instance state machine (spec §4.6).
//!
//! ```text
//! Idle ──start──▶ Starting ──initialize-ok──▶ Running
//!    └──────────────┬───────────────────────────┘
//!                   │error at any point
//!                   ▼
//!                 Failed
//! Running ──Stop──▶ Stopping ──shutdown+exit or kill──▶ Stopped
//! ```
//!
//! Grounded in the teacher's `lsp::proxy::LspProxy::start_server`
//! initialize handshake (deep-merged init options, capability caching) and
//! the Only1MCP reference's `StdioConnectionState` naming for the
//! lifecycle states.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::BufReader;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::builder::Builder;
use crate::config::BackendSpec;
use crate::diagnostics::DiagnosticsStore;
use crate::error::CoreError;
use crate::executor;
use crate::progress::ProgressTracker;
use crate::rpc::connection::{Connection, InboundHandler};
use crate::rpc::message::{RequestId, RpcError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

/// What a new instance is started against: the workspace root and any
/// client-negotiated initialize params to seed. Cloned per start attempt
/// (spec §4.6 step 5: "Clone `init_template`...").
#[derive(Debug, Clone, Default)]
pub struct InitTemplate {
    pub root_path: Option<PathBuf>,
    pub root_uri: Option<String>,
    pub initialization_options: Value,
}

/// Forwards a server-initiated request to the upstream client connection
/// when one exists (spec §4.6 "Server-initiated request handling"). The
/// hub (`Server`, spec §9) implements this and is handed to each instance
/// as a weak-reference-backed factory, avoiding a cyclic `Arc` between the
/// Handler and its Instances.
#[async_trait]
pub trait UpstreamForwarder: Send + Sync {
    async fn forward_request(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError>;
}

struct Shared {
    spec: Arc<BackendSpec>,
    builder: Arc<Builder>,
    progress: ProgressTracker,
    upstream: Option<Arc<dyn UpstreamForwarder>>,
    diagnostics: Arc<DiagnosticsStore>,
}

struct RunningState {
    child: tokio::process::Child,
    conn: Arc<Connection<tokio::process::ChildStdin>>,
    reader_task: tokio::task::JoinHandle<()>,
    capabilities: Value,
    started_at: Instant,
}

pub struct LspInstance {
    shared: Arc<Shared>,
    state: AsyncMutex<InstanceState>,
    running: AsyncMutex<Option<RunningState>>,
    error: AsyncMutex<Option<String>>,
    known_folders: AsyncMutex<HashSet<String>>,
}

struct InstanceInboundHandler {
    shared: Arc<Shared>,
}

#[async_trait]
impl InboundHandler for InstanceInboundHandler {
    async fn handle_request(&self, method: &str, params: Option<Value>) -> Result<Value, RpcError> {
        match method {
            "window/workDoneProgress/create" => {
                if let Some(token) = params.as_ref().and_then(|p| p.get("token")).cloned() {
                    if let Ok(id) = serde_json::from_value::<RequestId>(token) {
                        self.shared.progress.create(id);
                    }
                }
                Ok(Value::Null)
            }
            "workspace/configuration" => {
                let items = params
                    .as_ref()
                    .and_then(|p| p.get("items"))
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let wire_key = self.shared.spec.settings_wire_key();
                let settings = &self.shared.spec.settings;
                let results: Vec<Value> = items
                    .iter()
                    .map(|item| {
                        let section = item.get("section").and_then(Value::as_str).unwrap_or("");
                        resolve_section(settings, wire_key, section)
                    })
                    .collect();
                Ok(Value::Array(results))
            }
            "client/registerCapability" | "workspace/applyEdit" => {
                if let Some(upstream) = &self.shared.upstream {
                    upstream.forward_request(method, params).await
                } else {
                    Ok(serde_json::json!({"applied": true}))
                }
            }
            _ if method.starts_with("window/") => {
                if let Some(upstream) = &self.shared.upstream {
                    upstream.forward_request(method, params).await
                } else {
                    Ok(Value::Null)
                }
            }
            other => {
                if let Some(upstream) = &self.shared.upstream {
                    upstream.forward_request(other, params).await
                } else {
                    Err(RpcError::method_not_found(other))
                }
            }
        }
    }

    async fn handle_notification(&self, method: &str, params: Option<Value>) {
        if method == "$/progress" {
            if let Some(p) = params {
                if let (Some(token), Some(value)) = (p.get("token").cloned(), p.get("value").cloned()) {
                    if let Ok(id) = serde_json::from_value::<RequestId>(token) {
                        self.shared.progress.progress(id, value);
                    }
                }
            }
        } else if method == "textDocument/publishDiagnostics" {
            self.shared
                .diagnostics
                .publish(params.unwrap_or(Value::Null))
                .await;
        } else {
            debug!(method, "instance: unhandled inbound notification");
        }
    }
}

/// Walks `section` (dot-separated) inside the bare `settings` value and
/// returns what it finds; an absent path yields `{}` (spec §4.6
/// workspace/configuration rule). `settings` is never wrapped under
/// `wire_key` — the wire key only appears when this backend's settings are
/// sent *out* in a `workspace/didChangeConfiguration` notification, as
/// `{"settings": {wire_key: spec.settings}}`.
fn resolve_section(settings: &Value, wire_key: &str, section: &str) -> Value {
    let mut cursor = settings.clone();
    if section.is_empty() {
        return cursor;
    }
    // `section` arrives as e.g. "gopls.analyses.shadow"; the leading
    // component duplicates the wire key in common LSP configurations, so
    // strip it if present before walking the rest.
    let mut parts: Vec<&str> = section.split('.').collect();
    if parts.first() == Some(&wire_key) {
        parts.remove(0);
    }
    for part in parts {
        cursor = match cursor {
            Value::Object(ref map) => map.get(part).cloned().unwrap_or(Value::Object(Default::default())),
            _ => Value::Object(Default::default()),
        };
    }
    cursor
}

impl LspInstance {
    pub fn new(
        spec: Arc<BackendSpec>,
        builder: Arc<Builder>,
        upstream: Option<Arc<dyn UpstreamForwarder>>,
        diagnostics: Arc<DiagnosticsStore>,
    ) -> Self {
        LspInstance {
            shared: Arc::new(Shared {
                spec,
                builder,
                progress: ProgressTracker::new(),
                upstream,
                diagnostics,
            }),
            state: AsyncMutex::new(InstanceState::Idle),
            running: AsyncMutex::new(None),
            error: AsyncMutex::new(None),
            known_folders: AsyncMutex::new(HashSet::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.spec.name
    }

    pub async fn state(&self) -> InstanceState {
        *self.state.lock().await
    }

    pub async fn last_error(&self) -> Option<String> {
        self.error.lock().await.clone()
    }

    pub async fn started_at(&self) -> Option<Instant> {
        self.running.lock().await.as_ref().map(|r| r.started_at)
    }

    pub async fn capabilities(&self) -> Option<Value> {
        self.running.lock().await.as_ref().map(|r| r.capabilities.clone())
    }

    /// Returns the connection to issue calls over, starting the instance
    /// first if it is not already `Running` (spec §4.6 `get_or_start`,
    /// step 2's "atomic transition" — serialised by `state`'s lock).
    pub async fn ensure_running(
        &self,
        template: &InitTemplate,
    ) -> Result<Arc<Connection<tokio::process::ChildStdin>>, CoreError> {
        loop {
            let mut state = self.state.lock().await;
            match *state {
                InstanceState::Running => {
                    return Ok(self.running.lock().await.as_ref().unwrap().conn.clone());
                }
                InstanceState::Starting => {
                    drop(state);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
                InstanceState::Idle | InstanceState::Stopped => {
                    *state = InstanceState::Starting;
                    drop(state);
                    break;
                }
                InstanceState::Failed => {
                    let err = self.last_error().await.unwrap_or_default();
                    return Err(CoreError::InstanceFailed(err));
                }
                InstanceState::Stopping => {
                    drop(state);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            }
        }

        match self.start(template).await {
            Ok(conn) => Ok(conn),
            Err(e) => {
                *self.error.lock().await = Some(e.to_string());
                *self.state.lock().await = InstanceState::Failed;
                Err(e)
            }
        }
    }

    async fn start(
        &self,
        template: &InitTemplate,
    ) -> Result<Arc<Connection<tokio::process::ChildStdin>>, CoreError> {
        let spec = &self.shared.spec;

        let path = self
            .shared
            .builder
            .build(&spec.package_ref, spec.binary_hint.as_deref())
            .await
            .map_err(|e| CoreError::Build(e.to_string()))?;

        let workdir = template.root_path.as_deref();
        let process = executor::spawn(&spec.name, &path, &spec.args, &spec.env, workdir)?;
        let (child, stdin, stdout) = process.into_parts();
        let reader = BufReader::new(stdout);

        let handler = Arc::new(InstanceInboundHandler {
            shared: self.shared.clone(),
        });

        let (conn, reader_task) = Connection::spawn(reader, stdin, handler);

        let mut init_options = template.initialization_options.clone();
        deep_merge(&mut init_options, &spec.init_options);

        let init_params = serde_json::json!({
            "processId": std::process::id(),
            "rootUri": template.root_uri,
            "rootPath": template.root_path.as_ref().map(|p| p.display().to_string()),
            "capabilities": { "window": { "workDoneProgress": true } },
            "initializationOptions": init_options,
        });

        let result = conn
            .call("initialize", Some(init_params), CancellationToken::new())
            .await
            .map_err(|e| CoreError::Rpc {
                code: e.code,
                message: e.message,
                data: e.data,
            })?;

        let server_caps = result.get("capabilities").cloned().unwrap_or(Value::Null);
        let merged = apply_capability_override(server_caps, &spec.capability_override);

        conn.notify("initialized", Some(serde_json::json!({})))
            .await?;

        if !spec.settings.is_null() && spec.settings != Value::Object(Default::default()) {
            let payload = serde_json::json!({
                "settings": { spec.settings_wire_key(): spec.settings }
            });
            conn.notify("workspace/didChangeConfiguration", Some(payload))
                .await?;
        }

        let mut known_folders = self.known_folders.lock().await;
        if let Some(root_uri) = &template.root_uri {
            known_folders.insert(root_uri.clone());
        }
        drop(known_folders);

        info!(backend = %spec.name, "instance running");

        *self.running.lock().await = Some(RunningState {
            child,
            conn: conn.clone(),
            reader_task,
            capabilities: merged,
            started_at: Instant::now(),
        });
        *self.state.lock().await = InstanceState::Running;

        Ok(conn)
    }

    /// Sends `workspace/didChangeWorkspaceFolders` for `path` iff it is not
    /// already known (spec §4.6 "Workspace folders").
    pub async fn ensure_workspace_folder(&self, uri: &str) -> Result<(), CoreError> {
        let mut known = self.known_folders.lock().await;
        if known.contains(uri) {
            return Ok(());
        }
        if let Some(running) = self.running.lock().await.as_ref() {
            let params = serde_json::json!({
                "event": {
                    "added": [{"uri": uri, "name": uri}],
                    "removed": [],
                }
            });
            running
                .conn
                .notify("workspace/didChangeWorkspaceFolders", Some(params))
                .await?;
        }
        known.insert(uri.to_string());
        Ok(())
    }

    /// `Pool.stop(name)` body for a single instance (spec §4.6). A `Failed`
    /// instance transitions straight to `Stopped` and has its recorded
    /// error cleared, so the next `get_or_start` attempts a fresh start
    /// rather than re-reporting the stale failure forever (spec §7: an
    /// explicit `Stop` is what makes a `Failed` backend startable again).
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        if *state == InstanceState::Failed {
            *state = InstanceState::Stopped;
            drop(state);
            *self.error.lock().await = None;
            info!(backend = %self.shared.spec.name, "cleared failed instance, now stopped");
            return;
        }
        if *state != InstanceState::Running {
            return;
        }
        *state = InstanceState::Stopping;
        drop(state);

        let mut running_guard = self.running.lock().await;
        if let Some(mut running) = running_guard.take() {
            let deadline = Duration::from_secs(5);
            let shutdown_ok = tokio::time::timeout(
                deadline,
                running.conn.call("shutdown", None, CancellationToken::new()),
            )
            .await
            .is_ok();
            if shutdown_ok {
                let _ = running.conn.notify("exit", None).await;
            }
            running.conn.close();
            reader_task_abort(&running.reader_task);

            let exited = tokio::time::timeout(deadline, running.child.wait()).await;
            if exited.is_err() {
                warn!(backend = %self.shared.spec.name, "process did not exit in time, killing");
                let _ = running.child.start_kill();
            }
        }
        drop(running_guard);

        *self.state.lock().await = InstanceState::Stopped;
        self.known_folders.lock().await.clear();
        info!(backend = %self.shared.spec.name, "instance stopped");
    }

    pub async fn is_failed(&self) -> bool {
        *self.state.lock().await == InstanceState::Failed
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.shared.progress
    }

    pub fn spec(&self) -> &Arc<BackendSpec> {
        &self.shared.spec
    }

    /// Issues a request over the instance's connection, starting it first
    /// if necessary (spec §4.6 `get_or_start` folded into call sites that
    /// don't need the raw connection handle, e.g. the Handler and Bridge).
    pub async fn call(
        &self,
        template: &InitTemplate,
        method: &str,
        params: Option<Value>,
        token: CancellationToken,
    ) -> Result<Value, CoreError> {
        let conn = self.ensure_running(template).await?;
        conn.call(method, params, token).await.map_err(CoreError::from)
    }

    pub async fn notify(
        &self,
        template: &InitTemplate,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), CoreError> {
        let conn = self.ensure_running(template).await?;
        conn.notify(method, params).await
    }
}

fn reader_task_abort(task: &tokio::task::JoinHandle<()>) {
    task.abort();
}

/// Merges `capability_override` into `server_caps` (spec §4.6 step 6):
/// `disable` nulls a provider out; `enable` forces it on. See DESIGN.md for
/// the "enable-only-booleans" decision on non-boolean capability shapes.
fn apply_capability_override(
    mut server_caps: Value,
    overrides: &crate::config::CapabilityOverride,
) -> Value {
    if !server_caps.is_object() {
        server_caps = Value::Object(Default::default());
    }
    let obj = server_caps.as_object_mut().unwrap();

    for cap in &overrides.disable {
        obj.insert(cap.clone(), Value::Null);
    }
    for cap in &overrides.enable {
        match obj.get(cap) {
            Some(Value::Bool(true)) => {}
            Some(Value::Object(_)) => {
                debug!(capability = %cap, "enable override ignored for non-boolean capability");
            }
            _ => {
                obj.insert(cap.clone(), Value::Bool(true));
            }
        }
    }
    server_caps
}

/// Deep-merges `overlay` onto `base` in place (objects merge key-wise,
/// everything else is replaced) — used for `init_template.initializationOptions`
/// merged with the backend's own `init_options` (spec §4.6 step 5).
fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (k, v) in overlay_map {
                deep_merge(base_map.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
        (base_slot, overlay_value) => {
            if !overlay_value.is_null() {
                *base_slot = overlay_value.clone();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CapabilityOverride;

    #[test]
    fn capability_override_disable_nulls_provider() {
        let caps = serde_json::json!({"hoverProvider": true, "definitionProvider": true});
        let overrides = CapabilityOverride {
            disable: vec!["hoverProvider".to_string()],
            enable: vec![],
        };
        let merged = apply_capability_override(caps, &overrides);
        assert_eq!(merged["hoverProvider"], Value::Null);
        assert_eq!(merged["definitionProvider"], true);
    }

    #[test]
    fn capability_override_enable_forces_boolean_on() {
        let caps = serde_json::json!({});
        let overrides = CapabilityOverride {
            disable: vec![],
            enable: vec!["renameProvider".to_string()],
        };
        let merged = apply_capability_override(caps, &overrides);
        assert_eq!(merged["renameProvider"], true);
    }

    #[test]
    fn capability_override_enable_is_noop_for_object_shaped_capability() {
        let caps = serde_json::json!({"completionProvider": {"triggerCharacters": ["."]}});
        let overrides = CapabilityOverride {
            disable: vec![],
            enable: vec!["completionProvider".to_string()],
        };
        let merged = apply_capability_override(caps, &overrides);
        assert_eq!(merged["completionProvider"]["triggerCharacters"][0], ".");
    }

    #[test]
    fn deep_merge_overlays_nested_objects() {
        let mut base = serde_json::json!({"analyses": {"shadow": false, "unused": true}});
        let overlay = serde_json::json!({"analyses": {"shadow": true}});
        deep_merge(&mut base, &overlay);
        assert_eq!(base["analyses"]["shadow"], true);
        assert_eq!(base["analyses"]["unused"], true);
    }

    #[test]
    fn resolve_section_strips_leading_wire_key_from_bare_settings() {
        // `settings` is the bare value actually stored on `BackendSpec` —
        // never pre-wrapped under the wire key, matching the call site at
        // the top of this file.
        let settings = serde_json::json!({"analyses": {"shadow": false}});
        let value = resolve_section(&settings, "gopls", "gopls.analyses.shadow");
        assert_eq!(value, false);
    }

    #[test]
    fn resolve_section_missing_path_yields_empty_object() {
        let settings = serde_json::json!({});
        let value = resolve_section(&settings, "gopls", "gopls.analyses.shadow");
        assert_eq!(value, serde_json::json!({}));
    }

    #[test]
    fn resolve_section_empty_section_returns_whole_settings() {
        let settings = serde_json::json!({"analyses": {"shadow": false}});
        let value = resolve_section(&settings, "gopls", "");
        assert_eq!(value, settings);
    }
}
