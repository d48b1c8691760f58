// SPDX-License-Identifier: MIT
//! MCP Bridge (spec §4.9): converts MCP tool calls into stateful LSP
//! calls, retrying the one known transient failure and formatting results
//! as MCP-friendly text.
//!
//! Grounded in the teacher's `mcp::dispatch::McpDispatcher` shape (a
//! catalogue-checked dispatch over a fixed tool set, §2.6 "teacher's
//! dispatch shape") with the retry wrapped around the LSP call the way
//! `lspmux-cc`'s typed request wrappers (`hover`, `goto_definition`,
//! `find_references`) issue a single call each.

use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::FormatterSpec;
use crate::document_manager::{synthesize_template, uri_to_path, BackendSource, DocumentManager};
use crate::error::CoreError;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::router::Router;

/// A formatted MCP tool-call result. Bridge methods never propagate raw
/// errors to the transport (spec §7): they are caught here and surfaced as
/// `is_error = true` with a human-readable message.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub text: String,
    pub is_error: bool,
}

impl ToolResult {
    fn ok(text: String) -> Self {
        ToolResult { text, is_error: false }
    }

    fn err(e: CoreError) -> Self {
        ToolResult {
            text: format!("error: {e}"),
            is_error: true,
        }
    }
}

pub struct Bridge {
    backend_source: Arc<dyn BackendSource>,
    router: Arc<Router>,
    document_manager: Option<Arc<DocumentManager>>,
    formatters: Vec<FormatterSpec>,
}

impl Bridge {
    pub fn new(
        backend_source: Arc<dyn BackendSource>,
        router: Arc<Router>,
        document_manager: Option<Arc<DocumentManager>>,
        formatters: Vec<FormatterSpec>,
    ) -> Self {
        Bridge {
            backend_source,
            router,
            document_manager,
            formatters,
        }
    }

    pub async fn hover(&self, uri: &str, line: u32, character: u32) -> ToolResult {
        self.simple(uri, "textDocument/hover", position_params(uri, line, character), format_hover)
            .await
    }

    pub async fn definition(&self, uri: &str, line: u32, character: u32) -> ToolResult {
        self.simple(uri, "textDocument/definition", position_params(uri, line, character), format_locations)
            .await
    }

    pub async fn references(&self, uri: &str, line: u32, character: u32, include_declaration: bool) -> ToolResult {
        let mut params = position_params(uri, line, character);
        params["context"] = json!({ "includeDeclaration": include_declaration });
        self.simple(uri, "textDocument/references", params, |v| format_locations_truncated(v, 30))
            .await
    }

    pub async fn completion(&self, uri: &str, line: u32, character: u32) -> ToolResult {
        self.simple(uri, "textDocument/completion", position_params(uri, line, character), |v| {
            format_completions(v, 20)
        })
        .await
    }

    pub async fn document_symbols(&self, uri: &str) -> ToolResult {
        let params = json!({ "textDocument": { "uri": uri } });
        self.simple(uri, "textDocument/documentSymbol", params, format_symbols)
            .await
    }

    pub async fn code_action(&self, uri: &str, start: (u32, u32), end: (u32, u32)) -> ToolResult {
        let params = json!({
            "textDocument": { "uri": uri },
            "range": range_value(start, end),
            "context": { "diagnostics": [] },
        });
        self.simple(uri, "textDocument/codeAction", params, format_code_actions)
            .await
    }

    pub async fn rename(&self, uri: &str, line: u32, character: u32, new_name: &str) -> ToolResult {
        let mut params = position_params(uri, line, character);
        params["newName"] = json!(new_name);
        self.simple(uri, "textDocument/rename", params, |v| format_workspace_edit(v, 10))
            .await
    }

    pub async fn workspace_symbols(&self, uri_hint: &str, query: &str) -> ToolResult {
        let params = json!({ "query": query });
        self.simple(uri_hint, "workspace/symbol", params, |v| format_symbols_truncated(v, 50))
            .await
    }

    pub async fn diagnostics(&self, uri: &str, cached: Option<Value>) -> ToolResult {
        match cached {
            Some(params) => ToolResult::ok(format_diagnostics(&params, 30)),
            None => {
                // Not cached yet — open (which triggers the server to
                // analyse and eventually publish) and report "no
                // diagnostics yet" rather than blocking on a push model.
                if let Err(e) = self.ensure_open(uri).await {
                    return ToolResult::err(e);
                }
                ToolResult::ok("no diagnostics reported yet".to_string())
            }
        }
    }

    pub async fn format(&self, uri: &str) -> ToolResult {
        if let Some(formatter) = self.match_formatter(uri) {
            return match self.run_external_formatter(formatter, uri).await {
                Ok(text) => ToolResult::ok(text),
                Err(e) => ToolResult::err(e),
            };
        }
        let params = json!({
            "textDocument": { "uri": uri },
            "options": { "tabSize": 4, "insertSpaces": true },
        });
        self.simple(uri, "textDocument/formatting", params, |v| format_text_edits(v, 10))
            .await
    }

    /// Shared skeleton for ops with no special pre/post step: ensure
    /// open, call with retry, format.
    async fn simple<F>(&self, uri: &str, method: &str, params: Value, formatter: F) -> ToolResult
    where
        F: FnOnce(&Value) -> String,
    {
        if let Err(e) = self.ensure_open(uri).await {
            return ToolResult::err(e);
        }
        match self.call_with_retry(uri, method, params).await {
            Ok(result) => {
                let text = formatter(&result);
                if self.document_manager.is_none() {
                    self.ephemeral_close(uri).await;
                }
                ToolResult::ok(text)
            }
            Err(e) => {
                if self.document_manager.is_none() {
                    self.ephemeral_close(uri).await;
                }
                ToolResult::err(e)
            }
        }
    }

    /// "If a Document Manager is attached, ensures the URI is open and
    /// keeps it open for the session; else performs an ephemeral
    /// open/close around the call" (spec §4.9 step 3).
    async fn ensure_open(&self, uri: &str) -> Result<(), CoreError> {
        match &self.document_manager {
            Some(dm) => dm.open(self.backend_source.as_ref(), uri, None).await,
            None => {
                let path = uri_to_path(uri)?;
                let content = tokio::fs::read_to_string(&path).await.map_err(CoreError::Io)?;
                let (instance, template) = self.acquire(&path, uri).await?;
                let params = json!({
                    "textDocument": {
                        "uri": uri,
                        "languageId": "plaintext",
                        "version": 1,
                        "text": content,
                    }
                });
                instance.notify(&template, "textDocument/didOpen", Some(params)).await
            }
        }
    }

    async fn ephemeral_close(&self, uri: &str) {
        if let Ok(path) = uri_to_path(uri) {
            if let Ok((instance, template)) = self.acquire(&path, uri).await {
                let params = json!({ "textDocument": { "uri": uri } });
                let _ = instance.notify(&template, "textDocument/didClose", Some(params)).await;
            }
        }
    }

    async fn acquire(
        &self,
        path: &Path,
        uri: &str,
    ) -> Result<(Arc<crate::instance::LspInstance>, crate::instance::InitTemplate), CoreError> {
        let backend_name = self.router.route_uri(uri).ok_or(CoreError::NotConfigured)?;
        let instance = self
            .backend_source
            .instance_for(&backend_name)
            .await
            .ok_or(CoreError::NotConfigured)?;
        let template = synthesize_template(path);
        instance.ensure_running(&template).await?;
        Ok((instance, template))
    }

    /// Issues the LSP call with the "no views" retry policy (spec §4.9
    /// step 4): exponential backoff, base 500ms, multiplier 2, cap 5s, max
    /// 8 attempts, only for `code=0 ∧ message contains "no views"`.
    async fn call_with_retry(&self, uri: &str, method: &str, params: Value) -> Result<Value, CoreError> {
        let path = uri_to_path(uri)?;
        let (instance, template) = self.acquire(&path, uri).await?;
        let config = RetryConfig::bridge_no_views();
        retry_with_backoff(
            &config,
            |e: &CoreError| e.is_no_views(),
            || {
                let instance = instance.clone();
                let template = template.clone();
                let params = params.clone();
                let method = method.to_string();
                async move {
                    instance
                        .call(&template, &method, Some(params), CancellationToken::new())
                        .await
                }
            },
        )
        .await
    }

    fn match_formatter(&self, uri: &str) -> Option<&FormatterSpec> {
        let path = uri_to_path(uri).ok()?;
        let ext = path.extension().and_then(|e| e.to_str())?;
        self.formatters.iter().find(|f| {
            f.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext))
                || f.glob_patterns.iter().any(|pattern| {
                    globset::Glob::new(pattern)
                        .map(|g| g.compile_matcher().is_match(&path))
                        .unwrap_or(false)
                })
        })
    }

    /// Runs an external formatter binary against the file and returns its
    /// stdout as a single whole-file text edit (spec §4.9 "`format` has a
    /// pre-step...").
    async fn run_external_formatter(&self, formatter: &FormatterSpec, uri: &str) -> Result<String, CoreError> {
        let path = uri_to_path(uri)?;
        let mut args = formatter.args.clone();
        let file_arg = path.display().to_string();
        if let Some(slot) = args.iter_mut().find(|a| a.as_str() == "{file}") {
            *slot = file_arg;
        } else {
            args.push(file_arg);
        }

        let output = tokio::process::Command::new(&formatter.command)
            .args(&args)
            .output()
            .await
            .map_err(CoreError::Io)?;
        if !output.status.success() {
            return Err(CoreError::Protocol(format!(
                "formatter {:?} exited with {:?}",
                formatter.name, output.status
            )));
        }
        let new_text = String::from_utf8_lossy(&output.stdout).into_owned();
        debug!(formatter = %formatter.name, bytes = new_text.len(), "external formatter applied");
        Ok(format!("formatted via {} — 1 edit (whole file replacement)", formatter.name))
    }
}

fn position_params(uri: &str, line: u32, character: u32) -> Value {
    json!({
        "textDocument": { "uri": uri },
        "position": { "line": line, "character": character },
    })
}

fn range_value(start: (u32, u32), end: (u32, u32)) -> Value {
    json!({
        "start": { "line": start.0, "character": start.1 },
        "end": { "line": end.0, "character": end.1 },
    })
}

fn format_hover(result: &Value) -> String {
    if result.is_null() {
        return "no hover information".to_string();
    }
    match result.get("contents") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Object(obj)) => obj
            .get("value")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string).or_else(|| {
                v.get("value").and_then(Value::as_str).map(str::to_string)
            }))
            .collect::<Vec<_>>()
            .join("\n\n"),
        _ => "no hover information".to_string(),
    }
}

fn format_locations(result: &Value) -> String {
    format_locations_truncated(result, usize::MAX)
}

fn format_locations_truncated(result: &Value, limit: usize) -> String {
    let locations = match result {
        Value::Array(items) => items.clone(),
        Value::Object(_) => vec![result.clone()],
        _ => vec![],
    };
    if locations.is_empty() {
        return "no locations found".to_string();
    }
    render_truncated(&locations, limit, |loc| {
        let uri = loc.get("uri").and_then(Value::as_str).unwrap_or("?");
        let line = loc
            .get("range")
            .and_then(|r| r.get("start"))
            .and_then(|s| s.get("line"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        format!("{uri}:{}", line + 1)
    })
}

fn format_completions(result: &Value, limit: usize) -> String {
    let items = result
        .get("items")
        .and_then(Value::as_array)
        .cloned()
        .or_else(|| result.as_array().cloned())
        .unwrap_or_default();
    if items.is_empty() {
        return "no completions".to_string();
    }
    render_truncated(&items, limit, |item| {
        item.get("label").and_then(Value::as_str).unwrap_or("?").to_string()
    })
}

fn format_symbols(result: &Value) -> String {
    format_symbols_truncated(result, usize::MAX)
}

fn format_symbols_truncated(result: &Value, limit: usize) -> String {
    let items = result.as_array().cloned().unwrap_or_default();
    if items.is_empty() {
        return "no symbols found".to_string();
    }
    render_truncated(&items, limit, |item| {
        let name = item.get("name").and_then(Value::as_str).unwrap_or("?");
        let kind = item.get("kind").and_then(Value::as_u64).unwrap_or(0);
        format!("{name} (kind {kind})")
    })
}

fn format_code_actions(result: &Value) -> String {
    let items = result.as_array().cloned().unwrap_or_default();
    if items.is_empty() {
        return "no code actions available".to_string();
    }
    render_truncated(&items, usize::MAX, |item| {
        item.get("title").and_then(Value::as_str).unwrap_or("?").to_string()
    })
}

fn format_workspace_edit(result: &Value, limit: usize) -> String {
    let changes = result.get("changes").and_then(Value::as_object);
    let Some(changes) = changes else {
        return "no edits produced".to_string();
    };
    let mut lines = Vec::new();
    let mut total = 0usize;
    for (uri, edits) in changes {
        let count = edits.as_array().map(Vec::len).unwrap_or(0);
        total += count;
        if lines.len() < limit {
            lines.push(format!("{uri}: {count} edit(s)"));
        }
    }
    if total > limit {
        lines.push(format!("... and {} more", total - limit));
    }
    lines.join("\n")
}

fn format_text_edits(result: &Value, limit: usize) -> String {
    let edits = result.as_array().cloned().unwrap_or_default();
    if edits.is_empty() {
        return "no changes".to_string();
    }
    render_truncated(&edits, limit, |edit| {
        let start = edit
            .get("range")
            .and_then(|r| r.get("start"))
            .and_then(|s| s.get("line"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        format!("edit at line {}", start + 1)
    })
}

fn format_diagnostics(params: &Value, limit: usize) -> String {
    let diagnostics = params
        .get("diagnostics")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    if diagnostics.is_empty() {
        return "no diagnostics".to_string();
    }
    render_truncated(&diagnostics, limit, |d| {
        let message = d.get("message").and_then(Value::as_str).unwrap_or("");
        let severity = d.get("severity").and_then(Value::as_u64).unwrap_or(1);
        let line = d
            .get("range")
            .and_then(|r| r.get("start"))
            .and_then(|s| s.get("line"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        format!("[{severity}] line {}: {message}", line + 1)
    })
}

/// Shared "top N with `... and K more`" truncation rule (spec §4.9 step 5).
fn render_truncated<T>(items: &[T], limit: usize, render: impl Fn(&T) -> String) -> String {
    let shown: Vec<String> = items.iter().take(limit).map(render).collect();
    let mut text = shown.join("\n");
    if items.len() > limit {
        text.push_str(&format!("\n... and {} more", items.len() - limit));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_hover_extracts_markup_content() {
        let result = json!({"contents": {"kind": "markdown", "value": "func main()"}});
        assert_eq!(format_hover(&result), "func main()");
    }

    #[test]
    fn format_hover_handles_plain_string() {
        let result = json!({"contents": "plain text"});
        assert_eq!(format_hover(&result), "plain text");
    }

    #[test]
    fn truncation_rule_caps_completions_at_twenty() {
        let items: Vec<Value> = (0..25)
            .map(|i| json!({"label": format!("item{i}")}))
            .collect();
        let result = json!({ "items": items });
        let text = format_completions(&result, 20);
        assert!(text.contains("... and 5 more"));
        assert_eq!(text.lines().count(), 21);
    }

    #[test]
    fn truncation_rule_caps_diagnostics_at_thirty() {
        let diags: Vec<Value> = (0..35)
            .map(|i| json!({"message": format!("issue {i}"), "severity": 1}))
            .collect();
        let params = json!({ "diagnostics": diags });
        let text = format_diagnostics(&params, 30);
        assert!(text.contains("... and 5 more"));
    }

    #[test]
    fn format_locations_reports_none_found() {
        assert_eq!(format_locations(&Value::Array(vec![])), "no locations found");
    }
}
