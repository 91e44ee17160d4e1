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

//! Node exporter defaults.

use super::{images, Botanist, Result};
use crate::client::ClusterClient;
use crate::component::nodeexporter::{NodeExporter, Values};
use crate::component::Deployer;

impl<C: ClusterClient> Botanist<C> {
    /// Returns a deployer for the node-exporter.
    pub fn default_node_exporter(&self) -> Result<NodeExporter<C>> {
        let values = Values {
            image: self.image(images::NODE_EXPORTER)?,
            vpa_enabled: self.options.vpa_enabled,
        };
        Ok(NodeExporter::new(
            self.seed_client.clone(),
            self.seed_namespace.clone(),
            values,
        ))
    }

    /// Deploys the node-exporter, or removes it from workerless shoots.
    pub async fn deploy_node_exporter(&self) -> Result<()> {
        let node_exporter = &self.components()?.node_exporter;
        if self.shoot.is_workerless() {
            node_exporter.destroy().await?;
        } else {
            node_exporter.deploy().await?;
        }
        Ok(())
    }
}
