// SPDX-License-Identifier: MIT
//! The JSON-RPC 2.0 message envelope (spec §3 `JsonRpcMessage`).
//!
//! Per the design notes (§9 "Dynamic typing of JSON payloads"), `params`
//! and `result` stay opaque [`serde_json::Value`]s — parsed into a typed
//! shape only at the point of first use (initialize, progress,
//! configuration, diagnostics). We never round-trip through one
//! monomorphic struct.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

use crate::error::CoreError;

/// A JSON-RPC request/response id: integer or string, per spec.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(METHOD_NOT_FOUND, format!("method not found: {method}"))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }
}

impl From<RpcError> for CoreError {
    fn from(e: RpcError) -> Self {
        CoreError::Rpc {
            code: e.code,
            message: e.message,
            data: e.data,
        }
    }
}

impl From<CoreError> for RpcError {
    fn from(e: CoreError) -> Self {
        if let CoreError::Rpc { code, message, data } = e {
            RpcError { code, message, data }
        } else {
            RpcError::new(e.to_jsonrpc_code(), e.to_string())
        }
    }
}

/// Tagged union over Request / Response / Notification (spec §3).
#[derive(Debug, Clone)]
pub enum JsonRpcMessage {
    Request {
        id: RequestId,
        method: String,
        params: Option<Value>,
    },
    Response {
        id: RequestId,
        result: Option<Value>,
        error: Option<RpcError>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

impl JsonRpcMessage {
    pub fn request(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        JsonRpcMessage::Request {
            id,
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        JsonRpcMessage::Notification {
            method: method.into(),
            params,
        }
    }

    pub fn response_ok(id: RequestId, result: Value) -> Self {
        JsonRpcMessage::Response {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn response_err(id: RequestId, error: RpcError) -> Self {
        JsonRpcMessage::Response {
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Parses a raw JSON value into the tagged union, per its present
    /// fields (`method` ⇒ Request/Notification, `result`/`error` ⇒
    /// Response). Fails with [`CoreError::Protocol`] if both `result` and
    /// `error` are present, or neither shape is recognisable.
    pub fn from_value(value: Value) -> Result<Self, CoreError> {
        let obj = value
            .as_object()
            .ok_or_else(|| CoreError::Protocol("message is not a JSON object".to_string()))?;

        if let Some(method) = obj.get("method").and_then(Value::as_str) {
            let params = obj.get("params").cloned();
            return Ok(match obj.get("id") {
                Some(id_val) => {
                    let id = parse_id(id_val)?;
                    JsonRpcMessage::Request {
                        id,
                        method: method.to_string(),
                        params,
                    }
                }
                None => JsonRpcMessage::Notification {
                    method: method.to_string(),
                    params,
                },
            });
        }

        let has_result = obj.contains_key("result");
        let has_error = obj.contains_key("error");
        if has_result && has_error {
            return Err(CoreError::Protocol(
                "response carries both result and error".to_string(),
            ));
        }

        let id_val = obj
            .get("id")
            .ok_or_else(|| CoreError::Protocol("response missing id".to_string()))?;
        let id = parse_id(id_val)?;

        if has_error {
            let error: RpcError = serde_json::from_value(obj["error"].clone())?;
            Ok(JsonRpcMessage::Response {
                id,
                result: None,
                error: Some(error),
            })
        } else {
            Ok(JsonRpcMessage::Response {
                id,
                result: obj.get("result").cloned(),
                error: None,
            })
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            JsonRpcMessage::Request { id, method, params } => {
                let mut map = serde_json::Map::new();
                map.insert("jsonrpc".to_string(), Value::String("2.0".to_string()));
                map.insert("id".to_string(), id_to_value(id));
                map.insert("method".to_string(), Value::String(method.clone()));
                if let Some(p) = params {
                    map.insert("params".to_string(), p.clone());
                }
                Value::Object(map)
            }
            JsonRpcMessage::Notification { method, params } => {
                let mut map = serde_json::Map::new();
                map.insert("jsonrpc".to_string(), Value::String("2.0".to_string()));
                map.insert("method".to_string(), Value::String(method.clone()));
                if let Some(p) = params {
                    map.insert("params".to_string(), p.clone());
                }
                Value::Object(map)
            }
            JsonRpcMessage::Response { id, result, error } => {
                let mut map = serde_json::Map::new();
                map.insert("jsonrpc".to_string(), Value::String("2.0".to_string()));
                map.insert("id".to_string(), id_to_value(id));
                if let Some(err) = error {
                    map.insert("error".to_string(), serde_json::to_value(err).unwrap());
                } else {
                    map.insert("result".to_string(), result.clone().unwrap_or(Value::Null));
                }
                Value::Object(map)
            }
        }
    }
}

fn parse_id(value: &Value) -> Result<RequestId, CoreError> {
    if let Some(n) = value.as_i64() {
        Ok(RequestId::Number(n))
    } else if let Some(s) = value.as_str() {
        Ok(RequestId::String(s.to_string()))
    } else {
        Err(CoreError::Protocol(format!("invalid id: {value}")))
    }
}

fn id_to_value(id: &RequestId) -> Value {
    match id {
        RequestId::Number(n) => Value::from(*n),
        RequestId::String(s) => Value::String(s.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips_through_value() {
        let msg = JsonRpcMessage::request(
            RequestId::Number(1),
            "textDocument/hover",
            Some(serde_json::json!({"foo": "bar"})),
        );
        let value = msg.to_value();
        let parsed = JsonRpcMessage::from_value(value).unwrap();
        match parsed {
            JsonRpcMessage::Request { id, method, params } => {
                assert_eq!(id, RequestId::Number(1));
                assert_eq!(method, "textDocument/hover");
                assert_eq!(params.unwrap()["foo"], "bar");
            }
            _ => panic!("expected request"),
        }
    }

    #[test]
    fn response_with_both_result_and_error_is_protocol_error() {
        let value = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {},
            "error": {"code": -32000, "message": "oops"}
        });
        let result = JsonRpcMessage::from_value(value);
        assert!(matches!(result, Err(CoreError::Protocol(_))));
    }

    #[test]
    fn string_id_round_trips() {
        let msg = JsonRpcMessage::notification("initialized", None);
        let value = msg.to_value();
        assert!(value.get("id").is_none());

        let req = JsonRpcMessage::request(
            RequestId::String("abc".to_string()),
            "ping",
            None,
        );
        let parsed = JsonRpcMessage::from_value(req.to_value()).unwrap();
        match parsed {
            JsonRpcMessage::Request { id, .. } => {
                assert_eq!(id, RequestId::String("abc".to_string()))
            }
            _ => panic!("expected request"),
        }
    }
}
