// SPDX-License-Identifier: MIT
//! MCP surface (spec §6): wires the wire types and lifecycle handlers in
//! [`transport`], the tool catalogue in [`tools`], and the three
//! transports ([`stdio`], [`sse`], [`http`]) to a single [`McpServer`]
//! request dispatcher sitting in front of the [`crate::bridge::Bridge`].
//!
//! Grounded in the teacher's `mcp::dispatch::McpDispatcher` (one method
//! per request: `tools/list`, `tools/call`, `resources/list`,
//! `resources/read`, dispatched off `method` with a catalogue lookup for
//! unknown tool names).

pub mod http;
pub mod sse;
pub mod stdio;
pub mod tools;
pub mod transport;

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use crate::bridge::Bridge;
use crate::diagnostics::DiagnosticsStore;
use transport::{
    handle_initialize, handle_initialized, handle_ping, McpError, McpMessage, McpResponse,
    MCP_INVALID_PARAMS, MCP_METHOD_NOT_FOUND,
};

/// Dispatches MCP requests and notifications onto the [`Bridge`] and
/// [`DiagnosticsStore`]. One instance is shared across every transport.
pub struct McpServer {
    bridge: Arc<Bridge>,
    diagnostics: Arc<DiagnosticsStore>,
}

impl McpServer {
    pub fn new(bridge: Arc<Bridge>, diagnostics: Arc<DiagnosticsStore>) -> Self {
        McpServer { bridge, diagnostics }
    }

    /// The diagnostics store backing this server's `diagnostics` tool and
    /// `lux://diagnostics/...` resources — subscribed by each transport to
    /// fan out `notifications/resources/updated` (spec §4.10).
    pub fn diagnostics(&self) -> &Arc<DiagnosticsStore> {
        &self.diagnostics
    }

    /// Handles one incoming message, returning `None` for notifications
    /// (which never get a response) and `Some(response)` for requests.
    pub async fn handle(&self, msg: McpMessage) -> Option<McpResponse> {
        if msg.is_notification() {
            self.handle_notification(&msg).await;
            return None;
        }
        let id = msg.id.clone().unwrap_or(Value::Null);
        Some(self.handle_request(id, &msg.method, msg.params).await)
    }

    async fn handle_notification(&self, msg: &McpMessage) {
        match msg.method.as_str() {
            "notifications/initialized" | "initialized" => handle_initialized(),
            other => debug!(method = other, "ignoring unhandled MCP notification"),
        }
    }

    async fn handle_request(&self, id: Value, method: &str, params: Option<Value>) -> McpResponse {
        match method {
            "initialize" => handle_initialize(id),
            "ping" => handle_ping(id),
            "tools/list" => McpResponse::ok(
                id,
                json!({ "tools": tools::catalogue() }),
            ),
            "tools/call" => self.handle_tools_call(id, params).await,
            "resources/list" => self.handle_resources_list(id).await,
            "resources/read" => self.handle_resources_read(id, params).await,
            other => McpResponse::error(
                id,
                McpError::new(MCP_METHOD_NOT_FOUND, format!("unknown method: {other}")),
            ),
        }
    }

    async fn handle_tools_call(&self, id: Value, params: Option<Value>) -> McpResponse {
        let Some(params) = params else {
            return McpResponse::error(id, McpError::new(MCP_INVALID_PARAMS, "missing params"));
        };
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return McpResponse::error(id, McpError::new(MCP_INVALID_PARAMS, "missing tool name"));
        };
        let args = params.get("arguments").cloned().unwrap_or(Value::Null);

        let known = tools::catalogue().iter().any(|t| t.name == name);
        if !known {
            return McpResponse::error(
                id,
                McpError::new(MCP_METHOD_NOT_FOUND, format!("unknown tool: {name}")),
            );
        }

        let result: Result<crate::bridge::ToolResult, String> = async {
        match name {
            "hover" => {
                let uri = require_str(&args, "uri")?;
                let line = require_u32(&args, "line")?;
                let character = require_u32(&args, "character")?;
                Ok(self.bridge.hover(uri, line, character).await)
            }
            "definition" => {
                let uri = require_str(&args, "uri")?;
                let line = require_u32(&args, "line")?;
                let character = require_u32(&args, "character")?;
                Ok(self.bridge.definition(uri, line, character).await)
            }
            "references" => {
                let uri = require_str(&args, "uri")?;
                let line = require_u32(&args, "line")?;
                let character = require_u32(&args, "character")?;
                let include_declaration = args
                    .get("include_declaration")
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                Ok(self.bridge.references(uri, line, character, include_declaration).await)
            }
            "completion" => {
                let uri = require_str(&args, "uri")?;
                let line = require_u32(&args, "line")?;
                let character = require_u32(&args, "character")?;
                Ok(self.bridge.completion(uri, line, character).await)
            }
            "format" => {
                let uri = require_str(&args, "uri")?;
                Ok(self.bridge.format(uri).await)
            }
            "document_symbols" => {
                let uri = require_str(&args, "uri")?;
                Ok(self.bridge.document_symbols(uri).await)
            }
            "code_action" => {
                let uri = require_str(&args, "uri")?;
                let start = (require_u32(&args, "start_line")?, require_u32(&args, "start_character")?);
                let end = (require_u32(&args, "end_line")?, require_u32(&args, "end_character")?);
                Ok(self.bridge.code_action(uri, start, end).await)
            }
            "rename" => {
                let uri = require_str(&args, "uri")?;
                let line = require_u32(&args, "line")?;
                let character = require_u32(&args, "character")?;
                let new_name = require_str(&args, "new_name")?;
                Ok(self.bridge.rename(uri, line, character, new_name).await)
            }
            "workspace_symbols" => {
                let uri = require_str(&args, "uri")?;
                let query = require_str(&args, "query")?;
                Ok(self.bridge.workspace_symbols(uri, query).await)
            }
            "diagnostics" => {
                let uri = require_str(&args, "uri")?;
                let cached = self.diagnostics.get(uri).await;
                Ok(self.bridge.diagnostics(uri, cached).await)
            }
            _ => unreachable!("checked against the catalogue above"),
        }
        }
        .await;

        match result {
            Ok(text) => McpResponse::ok(id, json!({ "content": [{ "type": "text", "text": text.text }], "isError": text.is_error })),
            Err(msg) => McpResponse::error(id, McpError::new(MCP_INVALID_PARAMS, msg)),
        }
    }

    async fn handle_resources_list(&self, id: Value) -> McpResponse {
        let resources: Vec<Value> = self
            .diagnostics
            .list_resource_uris()
            .await
            .into_iter()
            .map(|uri| {
                json!({
                    "uri": uri,
                    "name": uri,
                    "mimeType": "application/json",
                })
            })
            .collect();
        McpResponse::ok(id, json!({ "resources": resources }))
    }

    async fn handle_resources_read(&self, id: Value, params: Option<Value>) -> McpResponse {
        let Some(uri) = params.as_ref().and_then(|p| p.get("uri")).and_then(Value::as_str) else {
            return McpResponse::error(id, McpError::new(MCP_INVALID_PARAMS, "missing uri"));
        };
        let Some(document_uri) = decode_diagnostics_uri(uri) else {
            return McpResponse::error(id, McpError::new(MCP_INVALID_PARAMS, "not a lux://diagnostics/ uri"));
        };
        let contents = self.diagnostics.get(&document_uri).await.unwrap_or(json!({}));
        McpResponse::ok(
            id,
            json!({
                "contents": [{
                    "uri": uri,
                    "mimeType": "application/json",
                    "text": contents.to_string(),
                }]
            }),
        )
    }
}

fn decode_diagnostics_uri(resource_uri: &str) -> Option<String> {
    let encoded = resource_uri.strip_prefix("lux://diagnostics/")?;
    percent_encoding::percent_decode_str(encoded)
        .decode_utf8()
        .ok()
        .map(|s| s.into_owned())
}

fn require_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, String> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("missing or non-string argument: {key}"))
}

fn require_u32(args: &Value, key: &str) -> Result<u32, String> {
    args.get(key)
        .and_then(Value::as_u64)
        .map(|n| n as u32)
        .ok_or_else(|| format!("missing or non-integer argument: {key}"))
}
