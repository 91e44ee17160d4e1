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

//! Registration of the gardenlet controllers.

use anyhow::anyhow;
use k8s_openapi::api::core::v1::ConfigMap;

use crate::apis::constants::{CLUSTER_IDENTITY, NAMESPACE_SYSTEM};
use crate::client::ClusterClient;
use crate::config::GardenletConfiguration;
use crate::controller::ControllerError;
use crate::controller_manager::ControllerManager;

use super::shoot;

/// Adds all gardenlet controllers to the given manager.
pub async fn add_to_manager<C: ClusterClient>(
    manager: &mut ControllerManager<C>,
    cfg: &GardenletConfiguration,
) -> anyhow::Result<()> {
    let garden_client = manager
        .context()
        .garden_client
        .clone()
        .ok_or_else(|| anyhow!("gardenlet controllers require a garden cluster client"))?;
    tracing::info!(identity = %manager.context().identity, seed = %cfg.seed_config.name, "Adding gardenlet controllers");

    let config_map: ConfigMap = garden_client
        .get(Some(NAMESPACE_SYSTEM), CLUSTER_IDENTITY)
        .await
        .map_err(|e| anyhow!("failed getting cluster-identity ConfigMap in garden cluster: {e}"))?;
    let garden_cluster_identity = config_map
        .data
        .as_ref()
        .and_then(|d| d.get(CLUSTER_IDENTITY))
        .cloned()
        .ok_or_else(|| anyhow!("cluster-identity ConfigMap data does not have {CLUSTER_IDENTITY:?} key"))?;

    shoot::add_to_manager(
        manager,
        cfg.controllers.shoot.clone(),
        cfg.seed_config.clone(),
        cfg.images.clone(),
        garden_cluster_identity,
    )
    .map_err(|e| ControllerError::AddFailed {
        name: "Shoot".to_string(),
        source: e.into(),
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fake::{FakeClusterClient, Verb};
    use crate::config::{ManagerConfig, SeedConfig};
    use crate::controller_context::ControllerContext;
    use crate::feature::MemoryFeatureGate;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn config() -> GardenletConfiguration {
        serde_yaml::from_str("seedConfig:\n  name: local\n  internalDomain: internal.example.com\n").unwrap()
    }

    fn manager(garden: &FakeClusterClient) -> ControllerManager<FakeClusterClient> {
        ControllerManager::new(ControllerContext::new(
            FakeClusterClient::new(),
            Some(garden.clone()),
            Arc::new(ManagerConfig::default()),
            Arc::new(MemoryFeatureGate::gardener()),
            "gardenlet-0",
        ))
    }

    fn cluster_identity(data: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(CLUSTER_IDENTITY.to_string()),
                namespace: Some(NAMESPACE_SYSTEM.to_string()),
                ..Default::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<BTreeMap<_, _>>(),
            ),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_add_to_manager() {
        let garden = FakeClusterClient::new();
        garden.create(&cluster_identity(&[(CLUSTER_IDENTITY, "garden")])).await.unwrap();
        let mut mgr = manager(&garden);

        add_to_manager(&mut mgr, &config()).await.unwrap();
        assert_eq!(mgr.registry().controller_names(), vec![shoot::CONTROLLER_NAME]);
    }

    #[tokio::test]
    async fn test_add_to_manager_cluster_identity_errors() {
        let garden = FakeClusterClient::new();
        garden.fail_on::<ConfigMap>(Verb::Get).await;
        let err = add_to_manager(&mut manager(&garden), &config()).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "failed getting cluster-identity ConfigMap in garden cluster: fake err"
        );

        let garden = FakeClusterClient::new();
        garden.create(&cluster_identity(&[("foo", "bar")])).await.unwrap();
        let err = add_to_manager(&mut manager(&garden), &config()).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"cluster-identity ConfigMap data does not have "cluster-identity" key"#
        );
    }

    #[tokio::test]
    async fn test_add_to_manager_twice_fails() {
        let garden = FakeClusterClient::new();
        garden.create(&cluster_identity(&[(CLUSTER_IDENTITY, "garden")])).await.unwrap();
        let mut mgr = manager(&garden);
        add_to_manager(&mut mgr, &config()).await.unwrap();

        let err = add_to_manager(&mut mgr, &config()).await.unwrap_err();
        assert!(err.to_string().starts_with("failed adding Shoot controller: "));
    }

    #[test]
    fn test_seed_config_defaults() {
        let seed: SeedConfig = config().seed_config;
        assert!(seed.reversed_vpn_enabled);
        assert!(seed.backup.is_none());
    }
}
