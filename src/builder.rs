// SPDX-License-Identifier: MIT
//! Builder: resolves an opaque package reference to an executable path
//! (spec §4.4).
//!
//! Memoised per `(package_ref, binary_hint)` for the process lifetime, as
//! the design notes require ("scoped to its owning instance, not a
//! global" — in practice each `LspInstance` owns one `Builder`). Path
//! safety (rejecting escapes out of the build root) follows the
//! percent-decode-then-normalise discipline the `lspmux` reference
//! client's `uri_to_path` uses for untrusted URIs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use crate::error::CoreError;

/// Turns a `package_ref` into a build output root on disk. The concrete
/// strategy (Nix flake build, pre-built toolchain lookup, ...) is supplied
/// by the caller; this trait only names the contract the rest of the core
/// depends on, per spec §1 ("a build/fetch backend ... abstracted as a
/// `Builder`").
#[async_trait]
pub trait BuildBackend: Send + Sync {
    async fn build_root(&self, package_ref: &str) -> Result<PathBuf, CoreError>;
}

/// Treats `package_ref` as an absolute or `$PATH`-relative directory that
/// already contains the built tree — the common case when backends are
/// installed ahead of time rather than fetched on demand.
pub struct DirectBuildBackend;

#[async_trait]
impl BuildBackend for DirectBuildBackend {
    async fn build_root(&self, package_ref: &str) -> Result<PathBuf, CoreError> {
        let path = PathBuf::from(package_ref);
        if path.is_dir() {
            Ok(path)
        } else {
            Err(CoreError::Build(format!(
                "package_ref {package_ref:?} is not a directory"
            )))
        }
    }
}

/// Resolves `(package_ref, binary_hint)` to an executable path, memoising
/// results for the process lifetime (spec §4.4: "must be idempotent and
/// safe to call concurrently").
pub struct Builder {
    backend: Box<dyn BuildBackend>,
    cache: Mutex<HashMap<(String, Option<String>), PathBuf>>,
}

impl Builder {
    pub fn new(backend: Box<dyn BuildBackend>) -> Self {
        Builder {
            backend,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn build(
        &self,
        package_ref: &str,
        binary_hint: Option<&str>,
    ) -> Result<PathBuf, CoreError> {
        let key = (package_ref.to_string(), binary_hint.map(str::to_string));
        if let Some(cached) = self.cache.lock().unwrap().get(&key) {
            debug!(package_ref, "builder cache hit");
            return Ok(cached.clone());
        }

        let root = self.backend.build_root(package_ref).await?;
        let resolved = resolve_binary(&root, binary_hint)?;

        self.cache.lock().unwrap().insert(key, resolved.clone());
        Ok(resolved)
    }
}

/// Binary resolution inside the build output (spec §4.4):
/// 1. a hint with a path separator resolves relative to the root;
///    otherwise it is looked up under `<root>/bin/<hint>`.
/// 2. the resolved path must stay within the root (reject escapes), be a
///    regular file, and be executable.
/// 3. with no hint, scan `<root>/bin/` for the first executable file, or
///    fall back to the root itself if it is executable.
fn resolve_binary(root: &Path, binary_hint: Option<&str>) -> Result<PathBuf, CoreError> {
    let root = root
        .canonicalize()
        .map_err(|e| CoreError::Build(format!("cannot canonicalise build root: {e}")))?;

    let candidate = match binary_hint {
        Some(hint) if hint.contains('/') || hint.contains(std::path::MAIN_SEPARATOR) => {
            root.join(hint)
        }
        Some(hint) => root.join("bin").join(hint),
        None => {
            let bin_dir = root.join("bin");
            if bin_dir.is_dir() {
                return first_executable_in(&bin_dir)
                    .ok_or_else(|| CoreError::Build("no executable found in bin/".to_string()));
            }
            return if is_executable_file(&root) {
                Ok(root)
            } else {
                Err(CoreError::Build(
                    "no bin/ directory and root is not executable".to_string(),
                ))
            };
        }
    };

    within_root_and_executable(&root, &candidate)
}

fn within_root_and_executable(root: &Path, candidate: &Path) -> Result<PathBuf, CoreError> {
    let normalised = normalise(candidate);
    if !normalised.starts_with(root) {
        return Err(CoreError::Build(format!(
            "resolved path {normalised:?} escapes build root {root:?}"
        )));
    }
    if !is_executable_file(&normalised) {
        return Err(CoreError::Build(format!(
            "{normalised:?} is not an executable regular file"
        )));
    }
    Ok(normalised)
}

/// Lexically normalises `.`/`..` components without touching the
/// filesystem (the path may not exist yet at canonicalisation time).
fn normalise(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        use std::path::Component;
        match comp {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn first_executable_in(dir: &Path) -> Option<PathBuf> {
    let mut entries: Vec<_> = std::fs::read_dir(dir).ok()?.flatten().collect();
    entries.sort_by_key(|e| e.file_name());
    entries
        .into_iter()
        .map(|e| e.path())
        .find(|p| is_executable_file(p))
}

#[cfg(unix)]
fn is_executable_file(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn is_executable_file(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn make_executable(path: &Path) {
        std::fs::write(path, b"#!/bin/sh\n").unwrap();
        let mut perm = std::fs::metadata(path).unwrap().permissions();
        perm.set_mode(0o755);
        std::fs::set_permissions(path, perm).unwrap();
    }

    #[test]
    fn resolves_binary_hint_under_bin() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("bin")).unwrap();
        let bin = dir.path().join("bin").join("gopls");
        make_executable(&bin);

        let resolved = resolve_binary(dir.path(), Some("gopls")).unwrap();
        assert_eq!(resolved, bin.canonicalize().unwrap());
    }

    #[test]
    fn rejects_path_escape() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("bin")).unwrap();
        let result = resolve_binary(dir.path(), Some("../../etc/passwd"));
        assert!(result.is_err());
    }

    #[test]
    fn falls_back_to_first_executable_in_bin_with_no_hint() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("bin")).unwrap();
        let bin = dir.path().join("bin").join("server");
        make_executable(&bin);

        let resolved = resolve_binary(dir.path(), None).unwrap();
        assert_eq!(resolved, bin.canonicalize().unwrap());
    }
}
