// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::client::ClusterClient;

use super::{AdmissionError, AdmissionResult, ReadyFunc, ValidationChain, ValidationInterface};

/// Dependencies handed to plugin factories.
#[derive(Clone)]
pub struct PluginContext<C> {
    /// Client serving reads from informer caches.
    pub cache_client: C,
    /// Client performing quorum reads.
    pub live_client: C,
    /// Reports whether the caches behind `cache_client` have synced.
    pub ready_func: Option<ReadyFunc>,
    /// Upper bound for waiting on `ready_func` per request.
    pub ready_timeout: Duration,
}

/// Creates a plugin from its dependencies.
pub type Factory<C> =
    Arc<dyn Fn(&PluginContext<C>) -> AdmissionResult<Arc<dyn ValidationInterface>> + Send + Sync>;

/// Registry of admission plugin factories by name.
pub struct Plugins<C> {
    factories: BTreeMap<String, Factory<C>>,
}

impl<C: ClusterClient> Default for Plugins<C> {
    fn default() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }
}

impl<C: ClusterClient> Plugins<C> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a plugin factory. Names must be unique.
    pub fn register(&mut self, name: &str, factory: Factory<C>) -> AdmissionResult<()> {
        if self.factories.contains_key(name) {
            return Err(AdmissionError::Internal(format!(
                "admission plugin {name:?} was registered twice"
            )));
        }
        tracing::debug!(plugin = %name, "Registered admission plugin");
        self.factories.insert(name.to_string(), factory);
        Ok(())
    }

    /// Names of all registered plugins, sorted.
    pub fn registered(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Instantiates the named plugins in order and checks their
    /// initialization.
    pub fn new_from_plugins(&self, names: &[String], ctx: &PluginContext<C>) -> AdmissionResult<ValidationChain> {
        let mut plugins = Vec::with_capacity(names.len());
        for name in names {
            let factory = self
                .factories
                .get(name)
                .ok_or_else(|| AdmissionError::Internal(format!("unknown admission plugin: {name}")))?;
            let plugin = factory(ctx)?;
            plugin.validate_initialization().map_err(|e| {
                AdmissionError::Internal(format!("failed to initialize admission plugin {name}: {e}"))
            })?;
            tracing::info!(plugin = %name, "Enabled admission plugin");
            plugins.push((name.clone(), plugin));
        }
        Ok(ValidationChain::new(plugins))
    }
}
