// SPDX-License-Identifier: MIT
//! Document Manager (spec §4.8): per-URI `didOpen`/`didChange`/`didClose`
//! state machine that makes stateless MCP tool calls safe against
//! stateful LSP backends.
//!
//! Grounded in the `lspmux-cc` reference client's `ensure_file_open`
//! (open-vs-change decision, version counter) generalised to the spec's
//! exact contract: re-`open` always sends a full-text `didChange` (no
//! content-hash short-circuit — spec §8 property 1 requires the observed
//! version sequence to be strictly increasing on every re-open, not only
//! on content change), and `close` is tracked per-manager rather than
//! per-connection.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;
use tracing::debug;

use crate::error::CoreError;
use crate::instance::{InitTemplate, LspInstance};
use crate::router::Router;
use std::sync::Arc;

/// Marker files that stop the upward walk in `discover_project_root`
/// (spec §4.8).
const ROOT_MARKERS: &[&str] = &[
    ".lux",
    ".git",
    "go.mod",
    "package.json",
    "Cargo.toml",
    "pyproject.toml",
];

/// Per-URI state held by the Document Manager (spec §3 `OpenDoc`).
#[derive(Debug, Clone)]
struct OpenDoc {
    language_id: String,
    version: u64,
    backend_name: String,
}

/// What the Document Manager needs from its host to route and start
/// backends: the router (URI → backend name) and the pool-like surface
/// that can lazily start an instance. Kept narrow so this module doesn't
/// depend on `Pool` or `Handler` directly.
#[async_trait::async_trait]
pub trait BackendSource: Send + Sync {
    async fn instance_for(&self, backend_name: &str) -> Option<Arc<LspInstance>>;
}

/// Per-URI `didOpen`/`didChange`/`didClose` tracker (spec §4.8, §3
/// `OpenDoc`). `open`/`close` on a given manager are serialised by the
/// single lock guarding `docs`, which is also what gives version numbers
/// their per-URI monotonic guarantee (spec §5).
pub struct DocumentManager {
    router: Arc<Router>,
    docs: Mutex<HashMap<String, OpenDoc>>,
}

impl DocumentManager {
    pub fn new(router: Arc<Router>) -> Self {
        DocumentManager {
            router,
            docs: Mutex::new(HashMap::new()),
        }
    }

    pub async fn is_open(&self, uri: &str) -> bool {
        self.docs.lock().await.contains_key(uri)
    }

    /// `open(uri)` (spec §4.8): routes to a backend, reads the file from
    /// disk, ensures the instance is running and knows the project root,
    /// then sends `didOpen` (first open) or a full-text `didChange`
    /// (re-open).
    pub async fn open(
        &self,
        backend_source: &dyn BackendSource,
        uri: &str,
        language_id_hint: Option<&str>,
    ) -> Result<(), CoreError> {
        let backend_name = self
            .router
            .route_uri(uri)
            .ok_or(CoreError::NotConfigured)?;
        let instance = backend_source
            .instance_for(&backend_name)
            .await
            .ok_or(CoreError::NotConfigured)?;

        let path = uri_to_path(uri)?;
        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(CoreError::Io)?;

        let template = synthesize_template(&path);
        instance.ensure_running(&template).await?;
        if let Some(root_uri) = &template.root_uri {
            instance.ensure_workspace_folder(root_uri).await?;
        }

        let mut docs = self.docs.lock().await;
        if let Some(doc) = docs.get_mut(uri) {
            doc.version += 1;
            let params = serde_json::json!({
                "textDocument": { "uri": uri, "version": doc.version },
                "contentChanges": [{ "text": content }],
            });
            instance
                .notify(&template, "textDocument/didChange", Some(params))
                .await?;
            debug!(uri, version = doc.version, "document refreshed (didChange)");
        } else {
            let language_id = language_id_hint
                .map(str::to_string)
                .unwrap_or_else(|| detect_language_id(&path));
            let version = 1u64;
            let params = serde_json::json!({
                "textDocument": {
                    "uri": uri,
                    "languageId": language_id,
                    "version": version,
                    "text": content,
                }
            });
            instance
                .notify(&template, "textDocument/didOpen", Some(params))
                .await?;
            self.router.record_language(uri, &language_id);
            docs.insert(
                uri.to_string(),
                OpenDoc {
                    language_id,
                    version,
                    backend_name: backend_name.clone(),
                },
            );
            debug!(uri, "document opened (didOpen)");
        }

        Ok(())
    }

    /// `close(uri)` (spec §4.8): no-op if untracked.
    pub async fn close(
        &self,
        backend_source: &dyn BackendSource,
        uri: &str,
    ) -> Result<(), CoreError> {
        let mut docs = self.docs.lock().await;
        let Some(doc) = docs.remove(uri) else {
            return Ok(());
        };
        drop(docs);

        self.router.forget_language(uri);

        if let Some(instance) = backend_source.instance_for(&doc.backend_name).await {
            let params = serde_json::json!({ "textDocument": { "uri": uri } });
            let template = InitTemplate::default();
            // The instance is necessarily already running (it has an
            // open document); `notify` only starts it if not, which
            // would be a no-op worth logging rather than failing on.
            instance
                .notify(&template, "textDocument/didClose", Some(params))
                .await?;
        }
        Ok(())
    }

    /// `close_all`: sends `didClose` for every tracked URI, then clears.
    pub async fn close_all(&self, backend_source: &dyn BackendSource) {
        let uris: Vec<String> = self.docs.lock().await.keys().cloned().collect();
        for uri in uris {
            if let Err(e) = self.close(backend_source, &uri).await {
                debug!(uri, err = %e, "close_all: failed to close document");
            }
        }
    }
}

/// Converts a `file://` URI to a filesystem path. Lux only deals in
/// `file://` URIs for on-disk document content (spec §4.8 "read file from
/// disk").
pub fn uri_to_path(uri: &str) -> Result<PathBuf, CoreError> {
    let parsed = url::Url::parse(uri).map_err(|e| CoreError::Protocol(e.to_string()))?;
    parsed
        .to_file_path()
        .map_err(|_| CoreError::Protocol(format!("not a file:// uri: {uri}")))
}

/// Builds a synthesised `InitTemplate` rooted at the discovered project
/// directory for `path` — used both by `open()` above and by the MCP
/// Bridge when it starts a backend on a caller's behalf (spec §4.9 step 2:
/// "a synthesised initialize template rooted at the discovered project
/// directory").
pub fn synthesize_template(path: &Path) -> InitTemplate {
    let root = discover_project_root(path);
    InitTemplate {
        root_path: root.clone(),
        root_uri: root.as_deref().map(path_to_uri),
        initialization_options: serde_json::Value::Null,
    }
}

pub fn path_to_uri(path: &Path) -> String {
    url::Url::from_file_path(path)
        .map(|u| u.to_string())
        .unwrap_or_else(|_| format!("file://{}", path.display()))
}

/// Walks parent directories from `path` looking for the first directory
/// containing any [`ROOT_MARKERS`] entry, never climbing above the user's
/// home directory (spec §4.8 "Project root discovery").
pub fn discover_project_root(path: &Path) -> Option<PathBuf> {
    let home = dirs::home_dir();
    let mut dir = if path.is_dir() {
        Some(path.to_path_buf())
    } else {
        path.parent().map(Path::to_path_buf)
    };

    while let Some(current) = dir {
        if ROOT_MARKERS.iter().any(|marker| current.join(marker).exists()) {
            return Some(current);
        }
        if Some(&current) == home.as_ref() {
            break;
        }
        match current.parent() {
            Some(parent) if parent != current => dir = Some(parent.to_path_buf()),
            _ => break,
        }
    }
    None
}

/// Infers a language id from a file extension — a small, explicit table
/// rather than a crate dependency, since this only feeds `didOpen`'s
/// `languageId` field and the router already owns the authoritative
/// extension→backend mapping.
fn detect_language_id(path: &Path) -> String {
    match path.extension().and_then(|e| e.to_str()) {
        Some("go") => "go",
        Some("rs") => "rust",
        Some("py") => "python",
        Some("ts") => "typescript",
        Some("tsx") => "typescriptreact",
        Some("js") => "javascript",
        Some("jsx") => "javascriptreact",
        Some("c") => "c",
        Some("h") => "c",
        Some("cpp") | Some("cc") | Some("cxx") => "cpp",
        Some("md") => "markdown",
        Some("json") => "json",
        Some("toml") => "toml",
        Some("yaml") | Some("yml") => "yaml",
        Some(other) => return other.to_string(),
        None => "plaintext",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discover_project_root_finds_cargo_toml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "").unwrap();
        let sub = dir.path().join("src");
        std::fs::create_dir(&sub).unwrap();
        let file = sub.join("main.rs");
        std::fs::write(&file, "").unwrap();

        let root = discover_project_root(&file).unwrap();
        assert_eq!(root, dir.path().canonicalize().unwrap_or(dir.path().to_path_buf()));
    }

    #[test]
    fn discover_project_root_returns_none_without_marker() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("lonely.go");
        std::fs::write(&file, "").unwrap();
        // No marker anywhere up to $HOME — likely None in a clean tmpdir,
        // though this can't be guaranteed in every CI sandbox, so we only
        // assert it doesn't panic and is consistent with marker absence
        // at this specific directory.
        let root = discover_project_root(&file);
        assert!(root.is_none() || root.unwrap() != dir.path());
    }

    #[test]
    fn detect_language_id_maps_common_extensions() {
        assert_eq!(detect_language_id(Path::new("a.go")), "go");
        assert_eq!(detect_language_id(Path::new("a.rs")), "rust");
        assert_eq!(detect_language_id(Path::new("a.unknown")), "unknown");
    }
}
