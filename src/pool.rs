// SPDX-License-Identifier: MIT
//! Subprocess Pool (spec §4.6): a registry of named [`LspInstance`]s with
//! double-checked lazy start, stop-all, and status reporting. Grounded in
//! the teacher's `process_pool::ProcessPool` (acquire/release against a
//! shared registry under a `Mutex`), generalised from a fixed-size worker
//! queue to a named-instance map where each entry owns its own lifecycle.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use crate::builder::Builder;
use crate::config::BackendSpec;
use crate::diagnostics::DiagnosticsStore;
use crate::error::CoreError;
use crate::instance::{InitTemplate, InstanceState, LspInstance, UpstreamForwarder};

/// A snapshot of one instance's state, returned by `status` (spec §4.11
/// control socket `status` command and §3 `LspInstance`).
#[derive(Debug, Clone)]
pub struct InstanceStatus {
    pub name: String,
    pub package_ref: String,
    pub state: InstanceState,
    pub started_at: Option<std::time::Instant>,
    pub error: Option<String>,
}

/// Registry of named [`LspInstance`]s, built once from the configured
/// `BackendSpec`s (spec §3 "Lifecycle": "BackendSpecs are created at
/// config load and registered once into the Pool").
pub struct Pool {
    instances: RwLock<HashMap<String, Arc<LspInstance>>>,
}

impl Pool {
    pub fn new(
        backends: &[BackendSpec],
        builder: Arc<Builder>,
        upstream: Option<Arc<dyn UpstreamForwarder>>,
        diagnostics: Arc<DiagnosticsStore>,
    ) -> Self {
        let mut instances = HashMap::new();
        for backend in backends {
            let spec = Arc::new(backend.clone());
            let name = spec.name.clone();
            instances.insert(
                name,
                Arc::new(LspInstance::new(
                    spec,
                    builder.clone(),
                    upstream.clone(),
                    diagnostics.clone(),
                )),
            );
        }
        Pool {
            instances: RwLock::new(instances),
        }
    }

    /// Names of every registered backend, regardless of current state.
    pub async fn names(&self) -> Vec<String> {
        self.instances.read().await.keys().cloned().collect()
    }

    pub async fn is_registered(&self, name: &str) -> bool {
        self.instances.read().await.contains_key(name)
    }

    /// Returns the instance for `name` without starting it.
    pub async fn get(&self, name: &str) -> Option<Arc<LspInstance>> {
        self.instances.read().await.get(name).cloned()
    }

    /// `Pool.get_or_start(name, init_template)` (spec §4.6): look up by
    /// name (error if unknown), then delegate to the instance's own
    /// serialised start — double-checked locking lives in
    /// `LspInstance::ensure_running`, not here, since the instance's state
    /// lock is the correct granularity (spec §5 "LSP Instance state
    /// machine transitions are serialised by a per-instance lock").
    pub async fn get_or_start(
        &self,
        name: &str,
        template: &InitTemplate,
    ) -> Result<Arc<LspInstance>, CoreError> {
        let instance = self
            .instances
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or(CoreError::NotConfigured)?;
        instance.ensure_running(template).await?;
        Ok(instance)
    }

    /// `Pool.stop(name)`: no-op if not Running (spec §4.6).
    pub async fn stop(&self, name: &str) -> Result<(), CoreError> {
        let instance = self
            .instances
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or(CoreError::NotConfigured)?;
        instance.stop().await;
        Ok(())
    }

    /// `Pool.stop_all`: snapshot names under the pool lock, then stop each
    /// independently (spec §4.6).
    pub async fn stop_all(&self) {
        let names = self.names().await;
        info!(count = names.len(), "stopping all instances");
        let stops = names.iter().map(|name| {
            let instances = &self.instances;
            async move {
                if let Some(instance) = instances.read().await.get(name).cloned() {
                    instance.stop().await;
                }
            }
        });
        futures_util::future::join_all(stops).await;
    }

    pub async fn status(&self) -> Vec<InstanceStatus> {
        let mut out = Vec::new();
        for (name, instance) in self.instances.read().await.iter() {
            out.push(InstanceStatus {
                name: name.clone(),
                package_ref: instance.spec().package_ref.clone(),
                state: instance.state().await,
                started_at: instance.started_at().await,
                error: instance.last_error().await,
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}
