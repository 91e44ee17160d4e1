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

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{AdmissionResult, Attributes};

/// The operation of an admission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    /// Object creation.
    Create,
    /// Object update.
    Update,
    /// Object or collection deletion.
    Delete,
    /// Connect to a subresource, e.g. `exec`.
    Connect,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operation::Create => "CREATE",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
            Operation::Connect => "CONNECT",
        };
        f.write_str(s)
    }
}

/// An admission plugin.
pub trait Interface: Send + Sync {
    /// Whether the plugin wants to see requests of this operation.
    fn handles(&self, operation: Operation) -> bool;
}

/// A plugin that may reject requests but never changes objects.
#[async_trait]
pub trait ValidationInterface: Interface {
    /// Rejects the request with an error.
    async fn validate(&self, attrs: &Attributes) -> AdmissionResult<()>;

    /// Reports missing dependencies after the plugin was set up.
    fn validate_initialization(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Runs validation plugins in order, stopping at the first rejection.
#[derive(Clone, Default)]
pub struct ValidationChain {
    plugins: Vec<(String, Arc<dyn ValidationInterface>)>,
}

impl ValidationChain {
    /// Creates a chain of named plugins.
    pub fn new(plugins: Vec<(String, Arc<dyn ValidationInterface>)>) -> Self {
        Self { plugins }
    }

    /// Plugin names in order.
    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Runs the plugins that handle the request's operation.
    pub async fn validate(&self, attrs: &Attributes) -> AdmissionResult<()> {
        for (name, plugin) in &self.plugins {
            if !plugin.handles(attrs.operation) {
                continue;
            }
            if let Err(err) = plugin.validate(attrs).await {
                tracing::debug!(plugin = %name, resource = %attrs.qualified_resource(), name = %attrs.name, error = %err, "Request rejected");
                return Err(err);
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ValidationChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidationChain")
            .field("plugins", &self.names())
            .finish()
    }
}
