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

use std::time::Duration;

use k8s_openapi::api::core::v1::Node;

use crate::client::ClusterClient;

/// Spreads reconciliations of all node agents evenly over the jitter period.
///
/// Each node gets the slot matching the index of its name in the sorted list
/// of all nodes.
pub struct Delayer<C> {
    client: C,
    min: Duration,
    max: Duration,
    nodes: Vec<String>,
}

impl<C: ClusterClient> Delayer<C> {
    /// Creates a delayer spreading nodes over `[min, max)`.
    pub fn new(client: C, min: Duration, max: Duration) -> Self {
        Self {
            client,
            min,
            max,
            nodes: Vec::new(),
        }
    }

    /// Returns the delay of `node_name`. Unknown nodes and an empty name are
    /// not delayed.
    pub async fn compute(&mut self, node_name: &str) -> Duration {
        if node_name.is_empty() {
            return Duration::ZERO;
        }

        match self.client.list::<Node>(None, None).await {
            Ok(nodes) => {
                let mut names: Vec<String> = nodes.into_iter().filter_map(|n| n.metadata.name).collect();
                names.sort();
                self.nodes = names;
            }
            // fall back to the previously listed nodes
            Err(err) => tracing::error!(
                node = %node_name,
                error = %err,
                "Failed to list nodes when computing reconciliation delay"
            ),
        }

        let Some(index) = self.nodes.iter().position(|n| n == node_name) else {
            return Duration::ZERO;
        };
        let range = self.max.saturating_sub(self.min).as_secs_f64() / self.nodes.len() as f64;
        self.min + Duration::from_secs_f64(index as f64 * range)
    }
}
