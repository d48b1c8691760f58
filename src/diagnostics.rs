// SPDX-License-Identifier: MIT
//! Diagnostics Store (spec §4.10): latest `publishDiagnostics` per URI,
//! fanning out MCP `notifications/resources/updated` on every change.
//!
//! Grounded in the teacher's `ipc/mod.rs` broadcast-notification pattern
//! (a `tokio::sync::broadcast` channel fed by a write-exclusive map) and
//! spec §4.10's write-on-change semantics directly.

use std::collections::HashMap;

use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

/// Canonical MCP resource URI for a diagnostics entry (spec §4.10:
/// `lux://diagnostics/<percent-encoded-file-uri>`).
pub fn resource_uri(document_uri: &str) -> String {
    format!(
        "lux://diagnostics/{}",
        utf8_percent_encode(document_uri, NON_ALPHANUMERIC)
    )
}

/// A resource-updated fan-out event, consumed by MCP transports that keep
/// a subscription open (SSE, streamable HTTP).
#[derive(Debug, Clone)]
pub struct ResourceUpdated {
    pub resource_uri: String,
}

/// `URI → PublishDiagnosticsParams` map (spec §3 `DiagnosticsEntry`, §4.10).
pub struct DiagnosticsStore {
    entries: RwLock<HashMap<String, Value>>,
    updates: broadcast::Sender<ResourceUpdated>,
}

impl DiagnosticsStore {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(256);
        DiagnosticsStore {
            entries: RwLock::new(HashMap::new()),
            updates: tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResourceUpdated> {
        self.updates.subscribe()
    }

    /// Applies a `textDocument/publishDiagnostics` notification params
    /// payload. Zero diagnostics removes the entry; otherwise it is
    /// replaced (spec §4.10 write-on-change semantics).
    pub async fn publish(&self, params: Value) {
        let Some(uri) = params.get("uri").and_then(Value::as_str).map(str::to_string) else {
            debug!("publishDiagnostics missing uri — dropping");
            return;
        };
        let diagnostics_is_empty = params
            .get("diagnostics")
            .and_then(Value::as_array)
            .map(|a| a.is_empty())
            .unwrap_or(true);

        let mut entries = self.entries.write().await;
        if diagnostics_is_empty {
            entries.remove(&uri);
        } else {
            entries.insert(uri.clone(), params);
        }
        drop(entries);

        let _ = self.updates.send(ResourceUpdated {
            resource_uri: resource_uri(&uri),
        });
    }

    pub async fn get(&self, uri: &str) -> Option<Value> {
        self.entries.read().await.get(uri).cloned()
    }

    pub async fn list_resource_uris(&self) -> Vec<String> {
        self.entries
            .read()
            .await
            .keys()
            .map(|uri| resource_uri(uri))
            .collect()
    }
}

impl Default for DiagnosticsStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_replaces_entry_on_nonempty_diagnostics() {
        let store = DiagnosticsStore::new();
        store
            .publish(serde_json::json!({
                "uri": "file:///p/main.go",
                "diagnostics": [{"message": "unused import"}],
            }))
            .await;
        let entry = store.get("file:///p/main.go").await.unwrap();
        assert_eq!(entry["diagnostics"][0]["message"], "unused import");
    }

    #[tokio::test]
    async fn publish_removes_entry_on_zero_diagnostics() {
        let store = DiagnosticsStore::new();
        store
            .publish(serde_json::json!({
                "uri": "file:///p/main.go",
                "diagnostics": [{"message": "x"}],
            }))
            .await;
        store
            .publish(serde_json::json!({
                "uri": "file:///p/main.go",
                "diagnostics": [],
            }))
            .await;
        assert!(store.get("file:///p/main.go").await.is_none());
    }

    #[tokio::test]
    async fn publish_broadcasts_resource_updated() {
        let store = DiagnosticsStore::new();
        let mut rx = store.subscribe();
        store
            .publish(serde_json::json!({"uri": "file:///p/main.go", "diagnostics": []}))
            .await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.resource_uri, resource_uri("file:///p/main.go"));
    }

    #[test]
    fn resource_uri_percent_encodes_document_uri() {
        let uri = resource_uri("file:///p/main.go");
        assert!(uri.starts_with("lux://diagnostics/"));
        assert!(!uri.contains("://p")); // the inner "://" is encoded
    }
}
