// SPDX-License-Identifier: MIT
//! Warmup Scanner (spec §4.11 `warmup` command): walks a directory and
//! reports which configured backends are needed, so the control socket's
//! `warmup <dir>` command can pre-start them before the editor opens its
//! first file. Grounded directly in spec §4.11 — "simple directory walk";
//! no crate beyond `tokio::fs` is needed for it.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::document_manager::path_to_uri;
use crate::instance::InitTemplate;
use crate::pool::Pool;
use crate::router::Router;

/// Directory names never descended into — version-control metadata and
/// dependency/output trees that are both huge and never contain source
/// files a route would match.
const SKIP_DIRS: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "node_modules",
    "target",
    ".lux",
    "dist",
    "build",
];

/// Walks `root`, returning the set of distinct backend names whose
/// `FiletypeRoute` matches at least one file found (spec §4.11).
pub async fn scan(root: &Path, router: &Router) -> HashSet<String> {
    let mut found = HashSet::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %dir.display(), err = %e, "warmup: cannot read directory — skipping");
                continue;
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let file_type = match entry.file_type().await {
                Ok(ft) => ft,
                Err(_) => continue,
            };

            if file_type.is_dir() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if !SKIP_DIRS.contains(&name.as_ref()) && !name.starts_with('.') {
                    stack.push(path);
                }
                continue;
            }

            if !file_type.is_file() {
                continue;
            }

            if let Some(backend) = router.route_for_path(&path) {
                found.insert(backend);
            }
        }
    }

    info!(dir = %root.display(), backends = found.len(), "warmup scan complete");
    found
}

/// Scans `root` and pre-starts every backend the scan found, each rooted
/// at `root` itself (spec §4.11: "spawns a background scan that
/// pre-starts every backend whose FiletypeRoute matches at least one file
/// under `<dir>`"). Runs to completion; callers that want "background"
/// semantics `tokio::spawn` this themselves (the Control Socket does).
pub async fn warmup(root: PathBuf, router: &Router, pool: &Pool) {
    let backends = scan(&root, router).await;
    let template = InitTemplate {
        root_path: Some(root.clone()),
        root_uri: Some(path_to_uri(&root)),
        initialization_options: serde_json::Value::Null,
    };

    for name in backends {
        match pool.get_or_start(&name, &template).await {
            Ok(_) => info!(backend = %name, "warmup: started"),
            Err(e) => debug!(backend = %name, err = %e, "warmup: failed to start"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FiletypeRoute;
    use std::collections::HashSet as Set;

    fn route(ext: &str, backend: &str) -> FiletypeRoute {
        FiletypeRoute {
            name: ext.to_string(),
            extensions: [ext.to_string()].into_iter().collect(),
            glob_patterns: vec![],
            language_ids: Set::new(),
            backend: Some(backend.to_string()),
        }
    }

    #[tokio::test]
    async fn scan_finds_backend_for_matching_extension() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.go"), "").unwrap();
        std::fs::write(dir.path().join("README.md"), "").unwrap();

        let router = Router::new(&[route("go", "gopls")]);
        let found = scan(dir.path(), &router).await;
        assert_eq!(found, ["gopls".to_string()].into_iter().collect());
    }

    #[tokio::test]
    async fn scan_skips_vcs_and_dependency_directories() {
        let dir = tempfile::tempdir().unwrap();
        let hidden = dir.path().join(".git");
        std::fs::create_dir(&hidden).unwrap();
        std::fs::write(hidden.join("config.go"), "").unwrap();

        let router = Router::new(&[route("go", "gopls")]);
        let found = scan(dir.path(), &router).await;
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn scan_descends_into_ordinary_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("src");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join("main.go"), "").unwrap();

        let router = Router::new(&[route("go", "gopls")]);
        let found = scan(dir.path(), &router).await;
        assert!(found.contains("gopls"));
    }
}
