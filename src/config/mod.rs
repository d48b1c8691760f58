// SPDX-License-Identifier: MIT
//! Configuration file loading (spec §3, §6).
//!
//! The core treats configuration as an external collaborator: it consumes
//! already-parsed [`BackendSpec`]/[`FiletypeRoute`] values. This module is
//! the loader that gets them there — `lsps.toml` (`[[backend]]` tables),
//! `formatters.toml`, and one `filetype/<name>.toml` per route — following
//! the teacher's `load_toml`-returns-`Option`-and-logs-on-parse-error
//! convention and XDG-aware default directories.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{error, warn};

/// `{disable: [cap], enable: [cap]}` — applied after capability merge
/// (spec §4.6 step 6, §4.9 Open Question on non-boolean `enable`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CapabilityOverride {
    #[serde(default)]
    pub disable: Vec<String>,
    #[serde(default)]
    pub enable: Vec<String>,
}

fn default_ready_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_activity_timeout() -> Duration {
    Duration::from_secs(30)
}

fn deser_secs<'de, D>(d: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let secs = u64::deserialize(d)?;
    Ok(Duration::from_secs(secs))
}

/// A configured, registered-once backend (spec §3 `BackendSpec`).
#[derive(Debug, Clone, Deserialize)]
pub struct BackendSpec {
    pub name: String,
    /// Opaque string passed to the `Builder`, e.g. a Nix flake reference.
    pub package_ref: String,
    /// Relative path or executable name within the built tree.
    pub binary_hint: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub init_options: serde_json::Value,
    #[serde(default)]
    pub settings: serde_json::Value,
    pub settings_wire_key: Option<String>,
    #[serde(default)]
    pub capability_override: CapabilityOverride,
    #[serde(default = "default_true")]
    pub wait_for_ready: bool,
    #[serde(default = "default_ready_timeout", deserialize_with = "deser_secs")]
    pub ready_timeout: Duration,
    #[serde(
        default = "default_activity_timeout",
        deserialize_with = "deser_secs"
    )]
    pub activity_timeout: Duration,
}

fn default_true() -> bool {
    true
}

impl BackendSpec {
    /// The top-level key settings are nested under in
    /// `workspace/didChangeConfiguration` (spec §3: "defaults to `name`").
    pub fn settings_wire_key(&self) -> &str {
        self.settings_wire_key.as_deref().unwrap_or(&self.name)
    }
}

/// A route from a file identity to a backend (spec §3 `FiletypeRoute`).
#[derive(Debug, Clone, Deserialize)]
pub struct FiletypeRoute {
    pub name: String,
    #[serde(default)]
    pub extensions: HashSet<String>,
    #[serde(default)]
    pub glob_patterns: Vec<String>,
    #[serde(default)]
    pub language_ids: HashSet<String>,
    pub backend: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FormatterSpec {
    pub name: String,
    #[serde(default)]
    pub extensions: HashSet<String>,
    #[serde(default)]
    pub glob_patterns: Vec<String>,
    /// Executable to spawn; argv is `[command, ...args, "<file>"]` with
    /// `<file>` substituted for the literal token `{file}` if present, else
    /// appended.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct LspsToml {
    #[serde(rename = "backend", default)]
    backends: Vec<BackendSpec>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FormattersToml {
    #[serde(rename = "formatter", default)]
    formatters: Vec<FormatterSpec>,
}

/// The fully loaded, validated configuration.
#[derive(Debug, Clone, Default)]
pub struct LuxConfig {
    pub backends: Vec<BackendSpec>,
    pub routes: Vec<FiletypeRoute>,
    pub formatters: Vec<FormatterSpec>,
    pub socket_path: PathBuf,
    pub data_dir: PathBuf,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("duplicate extension {0:?} across FiletypeRoutes")]
    DuplicateExtension(String),
    #[error("duplicate language_id {0:?} across FiletypeRoutes")]
    DuplicateLanguageId(String),
    #[error("route {0:?} references unknown backend {1:?}")]
    UnknownBackend(String, String),
}

impl LuxConfig {
    /// Load `lsps.toml`, `formatters.toml`, and `filetype/*.toml` from
    /// `config_dir`, falling back to empty collections for files that don't
    /// exist, and logging (not failing) on parse errors — the same
    /// posture as the teacher's `load_toml`.
    pub fn load(config_dir: &Path, data_dir: PathBuf) -> Result<Self, ConfigError> {
        let lsps = load_toml::<LspsToml>(&config_dir.join("lsps.toml")).unwrap_or_default();
        let formatters =
            load_toml::<FormattersToml>(&config_dir.join("formatters.toml")).unwrap_or_default();
        let routes = load_filetype_routes(&config_dir.join("filetype"));

        let cfg = LuxConfig {
            backends: lsps.backends,
            routes,
            formatters: formatters.formatters,
            socket_path: default_socket_path(),
            data_dir,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen_ext = HashSet::new();
        let mut seen_lang = HashSet::new();
        let backend_names: HashSet<&str> = self.backends.iter().map(|b| b.name.as_str()).collect();

        for route in &self.routes {
            for ext in &route.extensions {
                if !seen_ext.insert(ext.to_ascii_lowercase()) {
                    return Err(ConfigError::DuplicateExtension(ext.clone()));
                }
            }
            for lang in &route.language_ids {
                if !seen_lang.insert(lang.clone()) {
                    return Err(ConfigError::DuplicateLanguageId(lang.clone()));
                }
            }
            if let Some(backend) = &route.backend {
                if !backend_names.contains(backend.as_str()) {
                    return Err(ConfigError::UnknownBackend(route.name.clone(), backend.clone()));
                }
            }
        }
        Ok(())
    }

    pub fn backend(&self, name: &str) -> Option<&BackendSpec> {
        self.backends.iter().find(|b| b.name == name)
    }
}

fn load_toml<T: for<'de> Deserialize<'de>>(path: &Path) -> Option<T> {
    let contents = std::fs::read_to_string(path).ok()?;
    match toml::from_str::<T>(&contents) {
        Ok(value) => Some(value),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config file — ignoring");
            None
        }
    }
}

fn load_filetype_routes(dir: &Path) -> Vec<FiletypeRoute> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };

    let mut routes = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("toml") {
            continue;
        }
        match load_toml::<FiletypeRoute>(&path) {
            Some(route) => routes.push(route),
            None => warn!(path = %path.display(), "skipping unparsable filetype route"),
        }
    }
    routes
}

/// `$XDG_CONFIG_HOME/lux` or `~/.config/lux`.
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lux")
}

/// `$XDG_DATA_HOME/lux` or `~/.local/share/lux`.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lux")
}

/// `$XDG_RUNTIME_DIR/lux.sock`, falling back to `$TMPDIR/lux.sock`.
pub fn default_socket_path() -> PathBuf {
    let runtime_dir = std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .or_else(dirs::runtime_dir)
        .unwrap_or_else(std::env::temp_dir);
    runtime_dir.join("lux.sock")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_duplicate_extension_across_routes() {
        let cfg = LuxConfig {
            backends: vec![],
            routes: vec![
                FiletypeRoute {
                    name: "go".into(),
                    extensions: ["go".to_string()].into_iter().collect(),
                    glob_patterns: vec![],
                    language_ids: HashSet::new(),
                    backend: None,
                },
                FiletypeRoute {
                    name: "go2".into(),
                    extensions: ["go".to_string()].into_iter().collect(),
                    glob_patterns: vec![],
                    language_ids: HashSet::new(),
                    backend: None,
                },
            ],
            formatters: vec![],
            socket_path: PathBuf::new(),
            data_dir: PathBuf::new(),
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::DuplicateExtension(_))
        ));
    }

    #[test]
    fn rejects_route_referencing_unknown_backend() {
        let cfg = LuxConfig {
            backends: vec![],
            routes: vec![FiletypeRoute {
                name: "go".into(),
                extensions: HashSet::new(),
                glob_patterns: vec![],
                language_ids: HashSet::new(),
                backend: Some("gopls".into()),
            }],
            formatters: vec![],
            socket_path: PathBuf::new(),
            data_dir: PathBuf::new(),
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::UnknownBackend(_, _))
        ));
    }

    #[test]
    fn settings_wire_key_defaults_to_name() {
        let spec = BackendSpec {
            name: "gopls".into(),
            package_ref: "nixpkgs#gopls".into(),
            binary_hint: None,
            args: vec![],
            env: HashMap::new(),
            init_options: serde_json::Value::Null,
            settings: serde_json::Value::Null,
            settings_wire_key: None,
            capability_override: CapabilityOverride::default(),
            wait_for_ready: true,
            ready_timeout: default_ready_timeout(),
            activity_timeout: default_activity_timeout(),
        };
        assert_eq!(spec.settings_wire_key(), "gopls");
    }
}
