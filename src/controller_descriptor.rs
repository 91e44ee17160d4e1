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

//! Controller descriptor and registry.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::client::ClusterClient;
use crate::controller::{CancellationToken, Controller, ControllerError, Result};
use crate::controller_context::ControllerContext;
use crate::feature::FeatureGate;

/// Boxed future for async controller construction.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A builder function that creates a controller instance.
///
/// It returns `Ok(Some(controller))` if the controller was successfully
/// created, `Ok(None)` if the controller is disabled (e.g. missing
/// dependencies), or `Err` if there was a fatal error.
pub type ControllerConstructor<C> = Arc<
    dyn Fn(ControllerContext<C>, CancellationToken) -> BoxFuture<'static, Result<Option<Arc<dyn Controller<C>>>>>
        + Send
        + Sync,
>;

/// Descriptor for a controller: metadata and a constructor.
///
/// ```ignore
/// let descriptor = controller_descriptor::builder("shoot")
///     .with_alias("shoots")
///     .build(constructor);
/// ```
pub struct ControllerDescriptor<C> {
    name: String,

    /// Alternative names, never removed once added.
    aliases: Vec<String>,

    required_feature_gates: Vec<String>,

    disabled_by_default: bool,

    constructor: ControllerConstructor<C>,
}

impl<C> Clone for ControllerDescriptor<C> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            aliases: self.aliases.clone(),
            required_feature_gates: self.required_feature_gates.clone(),
            disabled_by_default: self.disabled_by_default,
            constructor: self.constructor.clone(),
        }
    }
}

/// Creates a new builder for a controller descriptor.
///
/// The cluster client type is only fixed by [`Builder::build`].
pub fn builder(name: impl Into<String>) -> Builder {
    Builder::new(name)
}

impl<C: ClusterClient> ControllerDescriptor<C> {
    /// Canonical name of the controller.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Alternative names the controller can be enabled or disabled by.
    pub fn aliases(&self) -> &[String] {
        &self.aliases
    }

    /// Feature gates that must be enabled for the controller to start.
    pub fn required_feature_gates(&self) -> &[String] {
        &self.required_feature_gates
    }

    /// Whether `*` leaves the controller out.
    pub fn is_disabled_by_default(&self) -> bool {
        self.disabled_by_default
    }

    /// Builds a controller instance from this descriptor.
    ///
    /// Returns `Ok(None)` if a required feature gate is not enabled.
    pub async fn build_controller(
        &self,
        ctx: ControllerContext<C>,
        cancel: CancellationToken,
        feature_gate: &dyn FeatureGate,
    ) -> Result<Option<Arc<dyn Controller<C>>>> {
        for gate in &self.required_feature_gates {
            if !feature_gate.enabled(gate) {
                tracing::debug!(controller = %self.name, gate = %gate, "Controller disabled by feature gate");
                return Ok(None);
            }
        }

        (self.constructor)(ctx, cancel).await
    }
}

impl<C> fmt::Debug for ControllerDescriptor<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerDescriptor")
            .field("name", &self.name)
            .field("aliases", &self.aliases)
            .field("required_feature_gates", &self.required_feature_gates)
            .field("disabled_by_default", &self.disabled_by_default)
            .finish()
    }
}

/// Builder for creating [`ControllerDescriptor`] instances.
pub struct Builder {
    name: String,
    aliases: Vec<String>,
    required_feature_gates: Vec<String>,
    disabled_by_default: bool,
}

impl Builder {
    /// Starts a descriptor for `name`. See also [`builder`].
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            aliases: Vec::new(),
            required_feature_gates: Vec::new(),
            disabled_by_default: false,
        }
    }

    /// Adds a name the controller can also be enabled by.
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }

    /// Requires a feature gate.
    pub fn with_feature_gate(mut self, gate: impl Into<String>) -> Self {
        self.required_feature_gates.push(gate.into());
        self
    }

    /// Excludes the controller from `*`.
    pub fn disabled_by_default(mut self) -> Self {
        self.disabled_by_default = true;
        self
    }

    /// Builds the descriptor with the given constructor.
    pub fn build<C>(self, constructor: ControllerConstructor<C>) -> ControllerDescriptor<C> {
        ControllerDescriptor {
            name: self.name,
            aliases: self.aliases,
            required_feature_gates: self.required_feature_gates,
            disabled_by_default: self.disabled_by_default,
            constructor,
        }
    }
}

/// Registry of all known controllers of a manager.
pub struct ControllerRegistry<C> {
    controllers: HashMap<String, ControllerDescriptor<C>>,

    /// Map of aliases to canonical names.
    alias_map: HashMap<String, String>,
}

impl<C> Default for ControllerRegistry<C> {
    fn default() -> Self {
        Self {
            controllers: HashMap::new(),
            alias_map: HashMap::new(),
        }
    }
}

impl<C: ClusterClient> ControllerRegistry<C> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a controller descriptor.
    ///
    /// Fails if the name is empty, already registered, or an alias conflicts
    /// with another controller name or alias.
    pub fn register(&mut self, descriptor: ControllerDescriptor<C>) -> Result<&mut Self> {
        let name = descriptor.name().to_string();
        let invalid = |reason: String| ControllerError::InvalidConfig {
            name: name.clone(),
            reason,
        };

        if name.is_empty() {
            return Err(invalid("controller name cannot be empty".to_string()));
        }
        if self.controllers.contains_key(&name) || self.alias_map.contains_key(&name) {
            return Err(ControllerError::AlreadyRegistered(name));
        }
        for alias in descriptor.aliases() {
            if self.controllers.contains_key(alias) {
                return Err(invalid(format!(
                    "alias {alias:?} conflicts with an existing controller name"
                )));
            }
            if let Some(existing) = self.alias_map.get(alias) {
                return Err(invalid(format!(
                    "alias {alias:?} is already used by controller {existing:?}"
                )));
            }
        }

        for alias in descriptor.aliases() {
            self.alias_map.insert(alias.clone(), name.clone());
        }
        self.controllers.insert(name, descriptor);
        Ok(self)
    }

    /// Returns the descriptor for the given name or alias.
    pub fn get(&self, name: &str) -> Option<&ControllerDescriptor<C>> {
        self.controllers.get(name).or_else(|| {
            self.alias_map
                .get(name)
                .and_then(|canonical| self.controllers.get(canonical))
        })
    }

    /// Returns all canonical controller names, sorted.
    pub fn controller_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.controllers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Registered descriptors, in no particular order.
    pub fn controllers(&self) -> impl Iterator<Item = &ControllerDescriptor<C>> {
        self.controllers.values()
    }

    /// Resolves an alias to its canonical name.
    pub fn resolve_alias(&self, name: &str) -> Option<&str> {
        self.alias_map.get(name).map(String::as_str)
    }
}

impl<C> fmt::Debug for ControllerRegistry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerRegistry")
            .field("controllers", &self.controllers.keys().collect::<Vec<_>>())
            .field("alias_map", &self.alias_map)
            .finish()
    }
}
