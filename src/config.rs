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

//! Configuration documents of the gardenlet, the node agent and the admission
//! webhook.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::apis::constants::NAMESPACE_SYSTEM;

/// Reads a YAML configuration document. Missing fields take their defaults.
pub fn load<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    use anyhow::Context;

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {path:?}"))?;
    serde_yaml::from_str(&content).with_context(|| format!("failed to parse config file: {path:?}"))
}

/// Settings of the controller manager shared by all components.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerConfig {
    /// Comma-separated list of controllers to enable.
    /// '*' enables all controllers, 'foo' enables the controller named 'foo',
    /// '-foo' disables the controller named 'foo'.
    #[serde(default = "default_controllers")]
    pub controllers: String,

    /// Controllers enabled explicitly, filled from `controllers`.
    #[serde(default, skip_serializing_if = "HashSet::is_empty")]
    pub controllers_enabled: HashSet<String>,

    /// Controllers disabled explicitly, filled from `controllers`.
    #[serde(default, skip_serializing_if = "HashSet::is_empty")]
    pub controllers_disabled: HashSet<String>,

    /// Base of the jittered delay before each controller starts.
    #[serde(default = "default_controller_start_interval", with = "humantime_serde")]
    pub controller_start_interval: Duration,

    /// The maximum time to wait for controllers to stop.
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            controllers: default_controllers(),
            controllers_enabled: HashSet::new(),
            controllers_disabled: HashSet::new(),
            controller_start_interval: default_controller_start_interval(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

impl ManagerConfig {
    /// Sets the controllers string and splits it into the enabled and
    /// disabled sets.
    pub fn set_controllers(&mut self, controllers: &str) {
        self.controllers = controllers.to_string();
        self.controllers_enabled.clear();
        self.controllers_disabled.clear();

        for part in controllers.split(',').map(str::trim) {
            if part.is_empty() || part == "*" {
                continue;
            }
            match part.strip_prefix('-') {
                Some(name) => self.controllers_disabled.insert(name.to_string()),
                None => self.controllers_enabled.insert(part.to_string()),
            };
        }
    }

    /// Checks if a controller with the given name is enabled.
    pub fn is_controller_enabled(&self, name: &str) -> bool {
        if self.controllers_disabled.contains(name) {
            return false;
        }
        self.controllers.split(',').any(|c| c.trim() == "*") || self.controllers_enabled.contains(name)
    }
}

fn default_controllers() -> String {
    "*".to_string()
}

fn default_controller_start_interval() -> Duration {
    Duration::ZERO
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Connection to a cluster. Without a kubeconfig the in-cluster or default
/// configuration is used.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConnection {
    /// Path to a kubeconfig file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<PathBuf>,
}

/// Leader election configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderElectionConfig {
    /// Runs leader election before starting the controllers.
    #[serde(default)]
    pub leader_elect: bool,

    /// Namespace of the lease.
    #[serde(default = "default_resource_namespace")]
    pub resource_namespace: String,

    /// Name of the lease.
    #[serde(default)]
    pub resource_name: String,

    /// How long a lease is valid without renewal.
    #[serde(default = "default_lease_duration", with = "humantime_serde")]
    pub lease_duration: Duration,

    /// Deadline for renewing a held lease.
    #[serde(default = "default_renew_deadline", with = "humantime_serde")]
    pub renew_deadline: Duration,

    /// Interval between acquire and renew attempts.
    #[serde(default = "default_retry_period", with = "humantime_serde")]
    pub retry_period: Duration,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            leader_elect: false,
            resource_namespace: default_resource_namespace(),
            resource_name: String::new(),
            lease_duration: default_lease_duration(),
            renew_deadline: default_renew_deadline(),
            retry_period: default_retry_period(),
        }
    }
}

fn default_resource_namespace() -> String {
    NAMESPACE_SYSTEM.to_string()
}

fn default_lease_duration() -> Duration {
    Duration::from_secs(15)
}

fn default_renew_deadline() -> Duration {
    Duration::from_secs(10)
}

fn default_retry_period() -> Duration {
    Duration::from_secs(2)
}

/// Address of an HTTP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Address to bind to.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Port to listen on.
    pub port: u16,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

// ---------------------------------------------------------------------------
// gardenlet

/// Configuration of the gardenlet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GardenletConfiguration {
    /// Connection to the garden cluster.
    #[serde(default)]
    pub garden_client_connection: ClientConnection,

    /// Connection to the seed cluster.
    #[serde(default)]
    pub seed_client_connection: ClientConnection,

    /// Controller manager settings.
    #[serde(default)]
    pub manager: ManagerConfig,

    /// Per-controller settings.
    #[serde(default)]
    pub controllers: GardenletControllerConfiguration,

    /// Leader election among gardenlet replicas.
    #[serde(default = "default_gardenlet_leader_election")]
    pub leader_election: LeaderElectionConfig,

    /// Health check server.
    #[serde(default = "default_gardenlet_health_server")]
    pub health_server: ServerConfig,

    /// Feature gates by name.
    #[serde(default)]
    pub feature_gates: BTreeMap<String, bool>,

    /// The seed served by this gardenlet.
    pub seed_config: SeedConfig,

    /// Container images by name.
    #[serde(default)]
    pub images: BTreeMap<String, String>,
}

fn default_gardenlet_leader_election() -> LeaderElectionConfig {
    LeaderElectionConfig {
        leader_elect: true,
        resource_namespace: "garden".to_string(),
        resource_name: "gardenlet-leader-election".to_string(),
        ..Default::default()
    }
}

fn default_gardenlet_health_server() -> ServerConfig {
    ServerConfig {
        bind_address: default_bind_address(),
        port: 2728,
    }
}

/// Per-controller settings of the gardenlet.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GardenletControllerConfiguration {
    /// Shoot controller.
    #[serde(default)]
    pub shoot: ShootControllerConfiguration,
}

/// Configuration of the shoot controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShootControllerConfiguration {
    /// Number of shoots reconciled in parallel.
    #[serde(default = "default_shoot_concurrent_syncs")]
    pub concurrent_syncs: usize,

    /// Base period after which shoots are reconciled again.
    #[serde(default = "default_shoot_sync_period", with = "humantime_serde")]
    pub sync_period: Duration,

    /// Delay before a failed shoot is retried, or a shoot waiting for
    /// another seed is checked again.
    #[serde(default = "default_shoot_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
}

impl Default for ShootControllerConfiguration {
    fn default() -> Self {
        Self {
            concurrent_syncs: default_shoot_concurrent_syncs(),
            sync_period: default_shoot_sync_period(),
            poll_interval: default_shoot_poll_interval(),
        }
    }
}

fn default_shoot_concurrent_syncs() -> usize {
    20
}

fn default_shoot_sync_period() -> Duration {
    Duration::from_secs(3600)
}

fn default_shoot_poll_interval() -> Duration {
    Duration::from_secs(10)
}

/// The seed this gardenlet is responsible for.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedConfig {
    /// Name of the seed.
    pub name: String,

    /// Whether the seed manages DNS records of its shoots.
    #[serde(default = "default_true")]
    pub shoot_dns_enabled: bool,

    /// Domain below which internal kube-apiserver domains are created.
    #[serde(default)]
    pub internal_domain: String,

    /// Backup bucket for etcd snapshots. Backups are disabled when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<SeedBackup>,

    /// Exposes kube-apiservers through the seed's SNI ingress.
    #[serde(default)]
    pub sni_enabled: bool,

    /// Cluster IP of the seed's istio ingress gateway, required with SNI.
    #[serde(default)]
    pub ingress_cluster_ip: String,

    /// Uses the reversed VPN between control planes and shoots.
    #[serde(default = "default_true")]
    pub reversed_vpn_enabled: bool,

    /// Deploys VPAs for control plane components.
    #[serde(default = "default_true")]
    pub vpa_enabled: bool,
}

/// Backup bucket of a seed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedBackup {
    /// Storage provider type.
    pub provider: String,
    /// Secret holding the bucket credentials.
    pub secret_ref_name: String,
    /// Bucket name.
    pub bucket_name: String,
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// node agent

/// Configuration of the node agent running on every node of a shoot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeAgentConfiguration {
    /// Connection to the shoot cluster.
    #[serde(default)]
    pub client_connection: ClientConnection,

    /// Name of the node the agent runs on. Usually set via `NODE_NAME`.
    #[serde(default)]
    pub node_name: String,

    /// Per-controller settings.
    #[serde(default)]
    pub controllers: NodeAgentControllerConfiguration,

    /// Health check server.
    #[serde(default = "default_node_agent_health_server")]
    pub health_server: ServerConfig,

    /// Feature gates by name.
    #[serde(default)]
    pub feature_gates: BTreeMap<String, bool>,
}

fn default_node_agent_health_server() -> ServerConfig {
    ServerConfig {
        bind_address: default_bind_address(),
        port: 2751,
    }
}

/// Per-controller settings of the node agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeAgentControllerConfiguration {
    /// Operating system config controller.
    #[serde(default)]
    pub operating_system_config: OperatingSystemConfigControllerConfig,
}

/// Configuration of the operating system config controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatingSystemConfigControllerConfig {
    /// Name of the secret in `kube-system` holding the config.
    pub secret_name: String,

    /// Upper bound of the delay before a changed config is applied.
    #[serde(default = "default_sync_jitter_period", with = "humantime_serde")]
    pub sync_jitter_period: Duration,

    /// Delay before a failed apply is retried.
    #[serde(default = "default_osc_retry_interval", with = "humantime_serde")]
    pub retry_interval: Duration,

    /// Root of the node's file system, `/` outside of tests.
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,
}

impl Default for OperatingSystemConfigControllerConfig {
    fn default() -> Self {
        Self {
            secret_name: String::new(),
            sync_jitter_period: default_sync_jitter_period(),
            retry_interval: default_osc_retry_interval(),
            root_dir: default_root_dir(),
        }
    }
}

fn default_sync_jitter_period() -> Duration {
    Duration::from_secs(300)
}

fn default_osc_retry_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_root_dir() -> PathBuf {
    PathBuf::from("/")
}

// ---------------------------------------------------------------------------
// admission

/// Configuration of the admission webhook server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionConfiguration {
    /// Connection to the garden cluster.
    #[serde(default)]
    pub client_connection: ClientConnection,

    /// Webhook server.
    #[serde(default = "default_admission_server")]
    pub server: ServerConfig,

    /// Names of the enabled plugins.
    #[serde(default = "default_admission_plugins")]
    pub plugins: Vec<String>,

    /// Maximum time a request waits for the plugins to become ready.
    #[serde(default = "default_ready_timeout", with = "humantime_serde")]
    pub ready_timeout: Duration,
}

impl Default for AdmissionConfiguration {
    fn default() -> Self {
        Self {
            client_connection: ClientConnection::default(),
            server: default_admission_server(),
            plugins: default_admission_plugins(),
            ready_timeout: default_ready_timeout(),
        }
    }
}

fn default_admission_server() -> ServerConfig {
    ServerConfig {
        bind_address: default_bind_address(),
        port: 9443,
    }
}

fn default_admission_plugins() -> Vec<String> {
    vec!["DeletionConfirmation".to_string()]
}

fn default_ready_timeout() -> Duration {
    Duration::from_secs(10)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manager_controllers() {
        let mut config = ManagerConfig::default();
        assert!(config.is_controller_enabled("shoot"));

        config.set_controllers("*,-shoot");
        assert!(!config.is_controller_enabled("shoot"));
        assert!(config.is_controller_enabled("other"));

        config.set_controllers("shoot");
        assert!(config.is_controller_enabled("shoot"));
        assert!(!config.is_controller_enabled("other"));
    }

    #[test]
    fn test_deserialize_gardenlet_config() {
        let yaml = r#"
seedConfig:
  name: local
  internalDomain: internal.local.gardener.cloud
controllers:
  shoot:
    concurrentSyncs: 5
    syncPeriod: 10m
featureGates:
  HVPA: true
"#;

        let config: GardenletConfiguration = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.seed_config.name, "local");
        assert!(config.seed_config.shoot_dns_enabled);
        assert!(config.seed_config.reversed_vpn_enabled);
        assert_eq!(config.controllers.shoot.concurrent_syncs, 5);
        assert_eq!(config.controllers.shoot.sync_period, Duration::from_secs(600));
        assert_eq!(config.feature_gates.get("HVPA"), Some(&true));
        assert!(config.leader_election.leader_elect);
        assert_eq!(config.health_server.port, 2728);
        assert_eq!(config.manager.controllers, "*");
    }

    #[test]
    fn test_deserialize_node_agent_config() {
        let yaml = r#"
nodeName: node-1
controllers:
  operatingSystemConfig:
    secretName: osc-secret
    syncJitterPeriod: 30s
"#;

        let config: NodeAgentConfiguration = serde_yaml::from_str(yaml).unwrap();
        let osc = &config.controllers.operating_system_config;
        assert_eq!(config.node_name, "node-1");
        assert_eq!(osc.secret_name, "osc-secret");
        assert_eq!(osc.sync_jitter_period, Duration::from_secs(30));
        assert_eq!(osc.root_dir, PathBuf::from("/"));
    }

    #[test]
    fn test_durations_in_human_readable_format() {
        let yaml = "leaseDuration: 1m30s\nrenewDeadline: 500ms\n";
        let config: LeaderElectionConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.lease_duration, Duration::from_secs(90));
        assert_eq!(config.renew_deadline, Duration::from_millis(500));
        assert_eq!(config.retry_period, Duration::from_secs(2));

        let out = serde_yaml::to_string(&config).unwrap();
        assert!(out.contains("leaseDuration: 1m 30s"), "{out}");

        assert!(serde_yaml::from_str::<LeaderElectionConfig>("leaseDuration: soon").is_err());
    }

    #[test]
    fn test_admission_config_defaults() {
        let config: AdmissionConfiguration = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.plugins, vec!["DeletionConfirmation"]);
        assert_eq!(config.server.port, 9443);
        assert_eq!(config.ready_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "plugins: []\nreadyTimeout: 1s\n").unwrap();

        let config: AdmissionConfiguration = load(&path).unwrap();
        assert!(config.plugins.is_empty());
        assert_eq!(config.ready_timeout, Duration::from_secs(1));

        assert!(load::<AdmissionConfiguration>(&dir.path().join("missing.yaml")).is_err());
    }
}
