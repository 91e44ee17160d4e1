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

//! Per-shoot orchestration of the control plane components.
//!
//! A [`Botanist`] bundles everything known about one shoot during a flow run:
//! the garden and seed clients, the shoot object, seed settings and the
//! component deployers computed from them.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use thiserror::Error;

use crate::apis::core::Shoot;
use crate::client::{ClientError, ClusterClient};
use crate::component::etcd::{self as etcd_component, BackupConfig, Etcd};
use crate::component::kubeapiserver::KubeApiServer;
use crate::component::nodeexporter::NodeExporter;
use crate::feature::{FeatureGate, MemoryFeatureGate};

pub mod etcd;
pub mod kubeapiserver;
pub mod nodeexporter;

pub use kubeapiserver::{
    compute_kube_apiserver_admission_plugins, default_admission_plugins,
    resources_requirements_for_kube_apiserver,
};

/// Errors returned by botanist operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A component deployer failed.
    #[error(transparent)]
    Component(#[from] crate::component::Error),

    /// A request to the cluster failed.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// The image vector lacks an image.
    #[error("could not find image {0:?}")]
    ImageNotFound(String),

    /// The shoot or its environment is invalid.
    #[error("{0}")]
    Invalid(String),
}

/// Result type for botanist operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Container images by name.
pub type ImageVector = BTreeMap<String, String>;

/// Image names looked up in the [`ImageVector`].
pub mod images {
    /// iptables init container of the kube-apiserver.
    pub const ALPINE_IPTABLES: &str = "alpine-iptables";
    /// Webhook injecting the apiserver proxy into pods.
    pub const APISERVER_PROXY_POD_WEBHOOK: &str = "apiserver-proxy-pod-webhook";
    /// The kube-apiserver.
    pub const KUBE_APISERVER: &str = "kube-apiserver";
    /// The node exporter daemon set.
    pub const NODE_EXPORTER: &str = "node-exporter";
    /// VPN sidecar of the kube-apiserver.
    pub const VPN_SEED: &str = "vpn-seed";
}

/// API server settings of a managed seed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ManagedSeedApiServer {
    /// Desired replicas.
    pub replicas: Option<i32>,
    /// Lower replica bound.
    pub min_replicas: i32,
    /// Upper replica bound.
    pub max_replicas: i32,
}

/// Set when the shoot is registered as a seed itself.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ManagedSeed {
    /// API server settings of the seed.
    pub api_server: Option<ManagedSeedApiServer>,
}

/// Environment of a shoot's control plane that is not part of the shoot
/// object.
#[derive(Clone)]
pub struct Options {
    /// Feature gates of the gardenlet.
    pub features: Arc<dyn FeatureGate>,
    /// Whether the seed manages DNS records for shoots.
    pub seed_shoot_dns_enabled: bool,
    /// Backup bucket of the seed, `None` disables etcd backups.
    pub backup: Option<BackupConfig>,
    /// Set when the shoot is a managed seed.
    pub managed_seed: Option<ManagedSeed>,
    /// Address under which the kube-apiserver is reachable from outside.
    pub api_server_address: String,
    /// Cluster IP of the kube-apiserver service.
    pub api_server_cluster_ip: String,
    /// Exposes the kube-apiserver through the seed's SNI ingress.
    pub sni_enabled: bool,
    /// Injects the apiserver proxy into shoot pods.
    pub sni_pod_mutator_enabled: bool,
    /// Cluster domain used inside the seed.
    pub internal_cluster_domain: String,
    /// Cluster domain published to users.
    pub external_cluster_domain: Option<String>,
    /// Uses the reversed VPN.
    pub reversed_vpn_enabled: bool,
    /// Deploys VPAs for the control plane.
    pub vpa_enabled: bool,
    /// Container images by name.
    pub images: ImageVector,
    /// Checksums of the control plane secrets by name.
    pub checksums: BTreeMap<String, String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            features: Arc::new(MemoryFeatureGate::gardener()),
            seed_shoot_dns_enabled: true,
            backup: None,
            managed_seed: None,
            api_server_address: String::new(),
            api_server_cluster_ip: String::new(),
            sni_enabled: false,
            sni_pod_mutator_enabled: false,
            internal_cluster_domain: String::new(),
            external_cluster_domain: None,
            reversed_vpn_enabled: true,
            vpa_enabled: true,
            images: ImageVector::new(),
            checksums: BTreeMap::new(),
        }
    }
}

/// Deployers of the shoot's control plane.
pub struct Components<C> {
    /// Deployer of the main etcd.
    pub etcd_main: Etcd<C>,
    /// Deployer of the events etcd.
    pub etcd_events: Etcd<C>,
    /// Deployer of the kube-apiserver.
    pub kube_apiserver: KubeApiServer<C>,
    /// Deployer of the node exporter.
    pub node_exporter: NodeExporter<C>,
}

/// Orchestrates the control plane of a single shoot.
pub struct Botanist<C> {
    /// Client of the garden cluster.
    pub garden_client: C,
    /// Client of the seed cluster.
    pub seed_client: C,
    /// The shoot being processed.
    pub shoot: Shoot,
    /// Namespace in the seed hosting the control plane.
    pub seed_namespace: String,
    /// Seed environment.
    pub options: Options,
    components: Option<Components<C>>,
}

impl<C: ClusterClient> Botanist<C> {
    /// Creates a botanist for `shoot`. Components are computed by [`Botanist::init_components`].
    pub fn new(garden_client: C, seed_client: C, shoot: Shoot, options: Options) -> Self {
        let seed_namespace = shoot.technical_id();
        Self {
            garden_client,
            seed_client,
            shoot,
            seed_namespace,
            options,
            components: None,
        }
    }

    /// Computes the component deployers from the current shoot.
    pub async fn init_components(&mut self) -> Result<()> {
        let components = Components {
            etcd_main: self.default_etcd(etcd_component::ROLE_MAIN, etcd_component::Class::Important),
            etcd_events: self.default_etcd(etcd_component::ROLE_EVENTS, etcd_component::Class::Normal),
            kube_apiserver: self.default_kube_apiserver().await?,
            node_exporter: self.default_node_exporter()?,
        };
        self.components = Some(components);
        Ok(())
    }

    /// The component deployers, failing if they were not yet initialized.
    pub fn components(&self) -> Result<&Components<C>> {
        self.components
            .as_ref()
            .ok_or_else(|| Error::Invalid("components have not been initialized".to_string()))
    }

    fn components_mut(&mut self) -> Result<&mut Components<C>> {
        self.components
            .as_mut()
            .ok_or_else(|| Error::Invalid("components have not been initialized".to_string()))
    }

    fn image(&self, name: &str) -> Result<String> {
        self.options
            .images
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ImageNotFound(name.to_string()))
    }

    fn load_checksum(&self, name: &str) -> String {
        self.options.checksums.get(name).cloned().unwrap_or_default()
    }

    /// Kubernetes version of the shoot.
    pub fn kubernetes_version(&self) -> &str {
        &self.shoot.spec.kubernetes.version
    }

    /// True if the shoot requests a highly available control plane.
    pub fn high_availability_enabled(&self) -> bool {
        self.shoot
            .spec
            .control_plane
            .as_ref()
            .and_then(|c| c.high_availability.as_ref())
            .is_some()
    }

    fn has_annotation(&self, key: &str) -> bool {
        self.shoot
            .metadata
            .annotations
            .as_ref()
            .is_some_and(|a| a.contains_key(key))
    }

    fn annotation(&self, key: &str) -> Option<&str> {
        self.shoot
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    /// Cluster IP of the `kubernetes` service in the shoot: the first address
    /// of the service network.
    pub fn api_server_service_ip(&self) -> Option<IpAddr> {
        let services = self.shoot.spec.networking.as_ref()?.services.as_deref()?;
        let (network, _) = services.split_once('/')?;
        match network.parse::<IpAddr>().ok()? {
            IpAddr::V4(ip) => Some(IpAddr::V4((u32::from(ip) + 1).into())),
            IpAddr::V6(ip) => Some(IpAddr::V6((u128::from(ip) + 1).into())),
        }
    }

    /// Address of the kube-apiserver from outside the cluster. The internal
    /// domain is used for clients running within gardener.
    pub fn compute_out_of_cluster_api_server_address(&self, use_internal: bool) -> String {
        if use_internal || self.options.external_cluster_domain.is_none() {
            if !self.options.internal_cluster_domain.is_empty() {
                return api_server_domain(&self.options.internal_cluster_domain);
            }
            return self.options.api_server_address.clone();
        }
        self.options
            .external_cluster_domain
            .as_deref()
            .map(api_server_domain)
            .unwrap_or_default()
    }
}

/// The kube-apiserver domain below a cluster domain.
pub fn api_server_domain(domain: &str) -> String {
    format!("api.{domain}")
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::apis::core::{Kubernetes, Networking, Provider, ShootSpec, ShootStatus, Worker};
    use crate::client::fake::FakeClusterClient;
    use kube::api::ObjectMeta;

    pub const PROJECT_NAMESPACE: &str = "garden-foo";
    pub const SEED_NAMESPACE: &str = "shoot--foo--bar";

    pub fn shoot() -> Shoot {
        Shoot {
            metadata: ObjectMeta {
                name: Some("bar".to_string()),
                namespace: Some(PROJECT_NAMESPACE.to_string()),
                ..Default::default()
            },
            spec: ShootSpec {
                kubernetes: Kubernetes {
                    version: "1.27.3".to_string(),
                    ..Default::default()
                },
                networking: Some(Networking {
                    pods: Some("100.96.0.0/11".to_string()),
                    services: Some("100.64.0.0/13".to_string()),
                    nodes: Some("10.250.0.0/16".to_string()),
                    ..Default::default()
                }),
                provider: Provider {
                    type_: "local".to_string(),
                    workers: vec![Worker {
                        name: "worker".to_string(),
                        minimum: 1,
                        maximum: 3,
                        ..Default::default()
                    }],
                },
                region: "local".to_string(),
                ..Default::default()
            },
            status: Some(ShootStatus {
                technical_id: Some(SEED_NAMESPACE.to_string()),
                ..Default::default()
            }),
        }
    }

    pub fn images() -> ImageVector {
        [
            images::ALPINE_IPTABLES,
            images::APISERVER_PROXY_POD_WEBHOOK,
            images::KUBE_APISERVER,
            images::NODE_EXPORTER,
            images::VPN_SEED,
        ]
        .into_iter()
        .map(|name| (name.to_string(), format!("{name}:latest")))
        .collect()
    }

    pub fn botanist(garden: &FakeClusterClient, seed: &FakeClusterClient) -> Botanist<FakeClusterClient> {
        botanist_for(garden, seed, shoot())
    }

    pub fn botanist_for(
        garden: &FakeClusterClient,
        seed: &FakeClusterClient,
        shoot: Shoot,
    ) -> Botanist<FakeClusterClient> {
        Botanist::new(
            garden.clone(),
            seed.clone(),
            shoot,
            Options {
                api_server_address: "api.bar.foo.internal.example.com".to_string(),
                internal_cluster_domain: "bar.foo.internal.example.com".to_string(),
                images: images(),
                ..Default::default()
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::client::fake::FakeClusterClient;

    #[test]
    fn test_seed_namespace_from_technical_id() {
        let client = FakeClusterClient::new();
        assert_eq!(botanist(&client, &client).seed_namespace, SEED_NAMESPACE);
    }

    #[test]
    fn test_api_server_service_ip() {
        let client = FakeClusterClient::new();
        assert_eq!(
            botanist(&client, &client).api_server_service_ip(),
            Some("100.64.0.1".parse().unwrap())
        );
    }

    #[test]
    fn test_out_of_cluster_address() {
        let client = FakeClusterClient::new();
        let mut b = botanist(&client, &client);
        assert_eq!(
            b.compute_out_of_cluster_api_server_address(false),
            "api.bar.foo.internal.example.com"
        );

        b.options.external_cluster_domain = Some("bar.example.com".to_string());
        assert_eq!(b.compute_out_of_cluster_api_server_address(false), "api.bar.example.com");
        assert_eq!(
            b.compute_out_of_cluster_api_server_address(true),
            "api.bar.foo.internal.example.com"
        );
    }

    #[tokio::test]
    async fn test_init_components_requires_images() {
        let client = FakeClusterClient::new();
        let mut b = botanist(&client, &client);
        b.options.images.remove(images::KUBE_APISERVER);

        let err = b.init_components().await.err().unwrap();
        assert_eq!(err.to_string(), r#"could not find image "kube-apiserver""#);
        assert!(b.components().is_err());
    }
}
