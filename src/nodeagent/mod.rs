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

//! The node agent provisions files and systemd units on shoot worker nodes.

use std::path::PathBuf;

use thiserror::Error;

use crate::client::{ClientError, ClusterClient};
use crate::config::NodeAgentConfiguration;
use crate::controller::ControllerError;
use crate::controller_manager::ControllerManager;

pub mod operatingsystemconfig;

/// Name of the node agent, also used as leader election lease name prefix.
pub const NAME: &str = "gardener-node-agent";

/// Errors of the node agent.
#[derive(Debug, Error)]
pub enum Error {
    /// A request to the cluster failed.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// The secret lacks the given data key.
    #[error("secret has no {0:?} data key")]
    MissingData(String),

    /// The config is no valid YAML.
    #[error("failed to parse operating system config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// File content is no valid base64.
    #[error("failed to decode file content: {0}")]
    Decode(#[from] base64::DecodeError),

    /// A file system operation failed.
    #[error("{path}: {source}")]
    Io {
        /// The affected path.
        path: PathBuf,
        /// Cause.
        #[source]
        source: std::io::Error,
    },

    /// A systemd command failed.
    #[error("unit {unit}: {message}")]
    Unit {
        /// Unit name.
        unit: String,
        /// Output of the failed command.
        message: String,
    },
}

/// Result type of the node agent.
pub type Result<T> = std::result::Result<T, Error>;

/// Adds all node agent controllers to the given manager.
pub fn add_to_manager<C: ClusterClient>(
    manager: &mut ControllerManager<C>,
    cfg: &NodeAgentConfiguration,
) -> std::result::Result<(), ControllerError> {
    if cfg.node_name.is_empty() {
        tracing::warn!("No node name configured, reconciliations will not be delayed");
    }
    operatingsystemconfig::add_to_manager(
        manager,
        cfg.controllers.operating_system_config.clone(),
        cfg.node_name.clone(),
    )
    .map_err(|e| ControllerError::AddFailed {
        name: "OperatingSystemConfig".to_string(),
        source: e.into(),
    })
}
