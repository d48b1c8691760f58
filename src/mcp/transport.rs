// SPDX-License-Identifier: MIT
//! MCP JSON-RPC 2.0 message types and lifecycle handlers (protocol version
//! `2024-11-05`, spec §6).
//!
//! Kept nearly verbatim in shape to the teacher's `mcp::transport` module
//! (`McpMessage`, `McpResponse`, `McpError`, the standard JSON-RPC error
//! codes, and the `initialize`/`ping` lifecycle handlers) — only the
//! `serverInfo` identity and the capabilities payload are Lux's own.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// An incoming or outgoing MCP JSON-RPC 2.0 message. Notifications (no
/// `id`) use the same wire shape but expect no response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpMessage {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl McpMessage {
    pub fn request(id: Value, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id: None,
            method: method.into(),
            params,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// A MCP JSON-RPC 2.0 response: success or error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<McpError>,
}

impl McpResponse {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, error: McpError) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl McpError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

pub const MCP_PARSE_ERROR: i32 = -32700;
pub const MCP_INVALID_REQUEST: i32 = -32600;
pub const MCP_METHOD_NOT_FOUND: i32 = -32601;
pub const MCP_INVALID_PARAMS: i32 = -32602;
pub const MCP_INTERNAL_ERROR: i32 = -32603;

/// `notifications/resources/updated` (spec §4.10): fanned out whenever the
/// Diagnostics Store's map changes for a URI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpResourceUpdatedNotification {
    pub method: String,
    pub params: McpResourceUpdatedParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpResourceUpdatedParams {
    pub uri: String,
}

impl McpResourceUpdatedNotification {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            method: "notifications/resources/updated".into(),
            params: McpResourceUpdatedParams { uri: uri.into() },
        }
    }

    pub fn to_message(&self) -> McpMessage {
        McpMessage::notification(
            self.method.clone(),
            Some(serde_json::to_value(&self.params).unwrap_or(Value::Null)),
        )
    }
}

/// Handle an `initialize` request from an MCP client.
pub fn handle_initialize(id: Value) -> McpResponse {
    McpResponse::ok(
        id,
        serde_json::json!({
            "protocolVersion": MCP_PROTOCOL_VERSION,
            "capabilities": {
                "tools": { "listChanged": false },
                "resources": { "subscribe": false, "listChanged": true },
            },
            "serverInfo": {
                "name": "lux",
                "version": env!("CARGO_PKG_VERSION"),
            },
        }),
    )
}

/// Handle a `ping` request.
pub fn handle_ping(id: Value) -> McpResponse {
    McpResponse::ok(id, serde_json::json!({}))
}

/// Handle the `initialized` notification — no response needed.
pub fn handle_initialized() {
    tracing::debug!("MCP client sent 'initialized' — session ready");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_advertises_protocol_version_and_server_info() {
        let resp = handle_initialize(Value::from(1));
        let result = resp.result.unwrap();
        assert_eq!(result["protocolVersion"], MCP_PROTOCOL_VERSION);
        assert_eq!(result["serverInfo"]["name"], "lux");
    }

    #[test]
    fn notification_has_no_id() {
        let msg = McpMessage::notification("notifications/resources/updated", None);
        assert!(msg.is_notification());
        let value = serde_json::to_value(&msg).unwrap();
        assert!(value.get("id").is_none());
    }
}
