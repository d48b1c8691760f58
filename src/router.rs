// SPDX-License-Identifier: MIT
//! File-match Router (spec §4.3).
//!
//! Maps `(path, extension, languageId)` to a backend name. Dispatch order
//! for a URI is language-id (if known) > extension > glob. Glob matching
//! uses `globset`, the crate the wider example pack (Alb-O-xeno) reaches
//! for when routing files by pattern.

use std::collections::HashMap;
use std::sync::RwLock;

use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::debug;

use crate::config::FiletypeRoute;

struct CompiledRoute {
    globs: GlobSet,
    backend: Option<String>,
}

/// Built once from the configured `FiletypeRoute`s; routing itself needs
/// only read access plus the mutable URI→language_id table.
pub struct Router {
    routes: Vec<CompiledRoute>,
    by_extension: HashMap<String, usize>,
    by_language_id: HashMap<String, usize>,
    /// Updated on every `textDocument/didOpen` (record) / `didClose`
    /// (forget), so subsequent routing for a URI uses the client's
    /// declared language rather than re-deriving it from the extension.
    uri_language: RwLock<HashMap<String, String>>,
}

impl Router {
    pub fn new(routes: &[FiletypeRoute]) -> Self {
        let mut compiled = Vec::with_capacity(routes.len());
        let mut by_extension = HashMap::new();
        let mut by_language_id = HashMap::new();

        for (idx, route) in routes.iter().enumerate() {
            let mut builder = GlobSetBuilder::new();
            for pattern in &route.glob_patterns {
                if let Ok(glob) = Glob::new(pattern) {
                    builder.add(glob);
                } else {
                    debug!(pattern, "invalid glob pattern — skipping");
                }
            }
            let globs = builder.build().unwrap_or_else(|_| GlobSetBuilder::new().build().unwrap());

            for ext in &route.extensions {
                by_extension.insert(ext.to_ascii_lowercase(), idx);
            }
            for lang in &route.language_ids {
                by_language_id.insert(lang.clone(), idx);
            }

            compiled.push(CompiledRoute {
                globs,
                backend: route.backend.clone(),
            });
        }

        Router {
            routes: compiled,
            by_extension,
            by_language_id,
            uri_language: RwLock::new(HashMap::new()),
        }
    }

    pub fn by_language_id(&self, lang: &str) -> Option<String> {
        self.by_language_id
            .get(lang)
            .and_then(|idx| self.routes[*idx].backend.clone())
    }

    pub fn by_extension(&self, ext: &str) -> Option<String> {
        self.by_extension
            .get(&ext.to_ascii_lowercase())
            .and_then(|idx| self.routes[*idx].backend.clone())
    }

    pub fn by_glob(&self, path: &str) -> Option<String> {
        self.routes
            .iter()
            .find(|r| r.globs.is_match(path))
            .and_then(|r| r.backend.clone())
    }

    /// Extracts the extension from a `file://` (or bare) path, lowercased,
    /// without the leading dot. `None` if the path has no extension.
    fn extension_of(path: &str) -> Option<String> {
        std::path::Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
    }

    /// Routes a URI using the full dispatch order: language-id (if known
    /// for this URI) > extension > glob.
    pub fn route_uri(&self, uri: &str) -> Option<String> {
        if let Some(lang) = self.uri_language.read().unwrap().get(uri) {
            if let Some(backend) = self.by_language_id(lang) {
                return Some(backend);
            }
        }
        if let Some(ext) = Self::extension_of(uri) {
            if let Some(backend) = self.by_extension(&ext) {
                return Some(backend);
            }
        }
        self.by_glob(uri)
    }

    /// Records the client-declared language id for `uri` (`didOpen`).
    pub fn record_language(&self, uri: &str, language_id: &str) {
        self.uri_language
            .write()
            .unwrap()
            .insert(uri.to_string(), language_id.to_string());
    }

    /// Forgets the declared language id for `uri` (`didClose`).
    pub fn forget_language(&self, uri: &str) {
        self.uri_language.write().unwrap().remove(uri);
    }

    pub fn route_for_path(&self, path: &std::path::Path) -> Option<String> {
        let path_str = path.to_string_lossy();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            if let Some(backend) = self.by_extension(ext) {
                return Some(backend);
            }
        }
        self.by_glob(&path_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn route(name: &str, ext: &str, backend: &str) -> FiletypeRoute {
        FiletypeRoute {
            name: name.to_string(),
            extensions: [ext.to_string()].into_iter().collect(),
            glob_patterns: vec![],
            language_ids: HashSet::new(),
            backend: Some(backend.to_string()),
        }
    }

    #[test]
    fn routes_by_extension_then_glob() {
        // S3: one FiletypeRoute {name: "go", extensions: ["go"], backend: "gopls"}.
        let router = Router::new(&[route("go", "go", "gopls")]);
        assert_eq!(
            router.route_uri("file:///p/main.go"),
            Some("gopls".to_string())
        );
        assert_eq!(router.route_uri("file:///p/README.md"), None);
    }

    #[test]
    fn language_id_takes_priority_over_extension() {
        let mut go_route = route("go", "txt", "textbackend");
        go_route.language_ids = ["go".to_string()].into_iter().collect();
        go_route.backend = Some("gopls".to_string());
        let router = Router::new(&[go_route]);
        router.record_language("file:///p/main.go", "go");
        assert_eq!(
            router.route_uri("file:///p/main.go"),
            Some("gopls".to_string())
        );
    }

    #[test]
    fn forget_language_falls_back_to_extension() {
        let router = Router::new(&[route("go", "go", "gopls")]);
        router.record_language("file:///p/main.go", "go");
        router.forget_language("file:///p/main.go");
        assert_eq!(
            router.route_uri("file:///p/main.go"),
            Some("gopls".to_string())
        );
    }

    #[test]
    fn glob_pattern_matches_when_no_extension_route() {
        let r = FiletypeRoute {
            name: "makefiles".to_string(),
            extensions: HashSet::new(),
            glob_patterns: vec!["**/Makefile".to_string()],
            language_ids: HashSet::new(),
            backend: Some("make-lsp".to_string()),
        };
        let router = Router::new(&[r]);
        assert_eq!(
            router.route_uri("file:///p/Makefile"),
            Some("make-lsp".to_string())
        );
    }
}
