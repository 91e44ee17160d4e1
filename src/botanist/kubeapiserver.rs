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

//! Defaults and deployment of the shoot's kube-apiserver.

use std::collections::BTreeMap;
use std::net::IpAddr;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, ResourceRequirements, Secret};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde_json::json;
use tracing::{debug, info};

use super::{images, Botanist, Error, Result};
use crate::apis::constants::{
    DEPLOYMENT_NAME_KUBE_APISERVER, GARDENER_AUDIENCE, SECRET_NAME_CA_CLUSTER,
    SECRET_NAME_CA_FRONT_PROXY, SHOOT_ALPHA_CONTROL_PLANE_SCALE_DOWN_DISABLED,
    SHOOT_ALPHA_SCALING_APISERVER_CLASS, SHOOT_PURPOSE_PRODUCTION,
};
use crate::apis::core::{AdmissionPlugin, KubeApiServerConfig, ShootState};
use crate::client::{self, ClusterClient};
use crate::component::etcd::SecretNames;
use crate::component::kubeapiserver::{
    self, AuditConfig, AutoscalingConfig, Images, KubeApiServer, Secret as ComponentSecret,
    Secrets, ServerCertificateConfig, ServiceAccountConfig, SniConfig, Values, VpnConfig,
    SECRET_NAME_VPN_SEED, SECRET_NAME_VPN_SEED_TLS_AUTH,
    SECRET_SERVICE_ACCOUNT_SIGNING_KEY_DATA_KEY,
};
use crate::component::{Deployer, Waiter};
use crate::feature::gardener::{HVPA, HVPA_FOR_SHOOTED_SEED};
use crate::feature::FeatureGate;

const SECRET_NAME_VPN_SEED_SERVER_TLS_AUTH: &str = "vpn-seed-server-tlsauth";

/// Objects replaced by content addressed variants, removed after deployment.
const LEGACY_CONFIG_MAPS: [&str; 3] = [
    "audit-policy-config",
    "kube-apiserver-admission-config",
    "kube-apiserver-egress-selector-configuration",
];
const LEGACY_SECRETS: [&str; 3] = [
    "kube-apiserver-oidc-cabundle",
    "kube-apiserver-service-account-signing-key",
    "etcd-encryption-secret",
];
/// Gardener resource data no longer persisted in the shoot state.
const LEGACY_SHOOT_STATE_DATA: [&str; 4] = [
    "static-token",
    "kube-apiserver-basic-auth",
    "etcdEncryptionConfiguration",
    "service-account-key",
];

const SCALING_CLASSES: [&str; 5] = ["small", "medium", "large", "xlarge", "2xlarge"];

/// Parses `major.minor[.patch]`.
fn minor_version(version: &str) -> Option<(u64, u64)> {
    let mut parts = version.trim_start_matches('v').split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

/// Admission plugins enabled by default for a Kubernetes version.
pub fn default_admission_plugins(version: &str) -> Vec<AdmissionPlugin> {
    let (major, minor) = minor_version(version).unwrap_or((1, u64::MAX));
    let at_least = |m: u64| major > 1 || minor >= m;

    let mut names = vec![
        "Priority",
        "NamespaceLifecycle",
        "LimitRanger",
        "ServiceAccount",
        "NodeRestriction",
        "DefaultStorageClass",
        "DefaultTolerationSeconds",
        "ResourceQuota",
        "StorageObjectInUseProtection",
        "MutatingAdmissionWebhook",
        "ValidatingAdmissionWebhook",
    ];
    if !at_least(25) {
        names.insert(3, "PodSecurityPolicy");
    }
    if at_least(23) {
        names.push("PodSecurity");
    }
    names.into_iter().map(AdmissionPlugin::named).collect()
}

/// Merges configured plugins into the defaults: a configured plugin replaces
/// the default of the same name, unknown plugins are appended.
pub fn compute_kube_apiserver_admission_plugins(
    mut defaults: Vec<AdmissionPlugin>,
    configured: &[AdmissionPlugin],
) -> Vec<AdmissionPlugin> {
    for plugin in configured {
        match defaults.iter_mut().find(|d| d.name == plugin.name) {
            Some(default) => *default = plugin.clone(),
            None => defaults.push(plugin.clone()),
        }
    }
    defaults
}

/// Resource requests of the kube-apiserver for a scaling class. Without a
/// valid class, it is derived from the node count.
pub fn resources_requirements_for_kube_apiserver(
    node_count: i32,
    scaling_class: &str,
) -> ResourceRequirements {
    let class = if SCALING_CLASSES.contains(&scaling_class) {
        scaling_class
    } else {
        match node_count {
            n if n <= 2 => "small",
            n if n <= 10 => "medium",
            n if n <= 50 => "large",
            n if n <= 100 => "xlarge",
            _ => "2xlarge",
        }
    };

    let (cpu, memory) = match class {
        "small" => ("800m", "800Mi"),
        "medium" => ("1000m", "1100Mi"),
        "large" => ("1200m", "1600Mi"),
        "xlarge" => ("2500m", "5200Mi"),
        _ => ("3000m", "5200Mi"),
    };
    requests(cpu, memory)
}

fn requests(cpu: &str, memory: &str) -> ResourceRequirements {
    ResourceRequirements {
        requests: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity(cpu.to_string())),
            ("memory".to_string(), Quantity(memory.to_string())),
        ])),
        ..Default::default()
    }
}

impl<C: ClusterClient> Botanist<C> {
    fn kube_apiserver_config(&self) -> Option<&KubeApiServerConfig> {
        self.shoot.spec.kubernetes.kube_api_server.as_ref()
    }

    /// Returns a deployer for the kube-apiserver.
    pub async fn default_kube_apiserver(&self) -> Result<KubeApiServer<C>> {
        let images = self.compute_kube_apiserver_images()?;

        let mut admission_plugins = default_admission_plugins(self.kubernetes_version());
        let mut api_audiences = vec!["kubernetes".to_string(), GARDENER_AUDIENCE.to_string()];
        let mut values = Values::default();

        if let Some(config) = self.kube_apiserver_config() {
            admission_plugins =
                compute_kube_apiserver_admission_plugins(admission_plugins, &config.admission_plugins);

            if let Some(audiences) = &config.api_audiences {
                api_audiences = audiences.clone();
                if !api_audiences.iter().any(|a| a == GARDENER_AUDIENCE) {
                    api_audiences.push(GARDENER_AUDIENCE.to_string());
                }
            }

            values.audit = self.compute_kube_apiserver_audit_config().await?;
            values.anonymous_authentication_enabled =
                config.enable_anonymous_authentication.unwrap_or(false);
            values.event_ttl = config
                .event_ttl
                .as_deref()
                .map(humantime::parse_duration)
                .transpose()
                .map_err(|err| Error::Invalid(format!("invalid event TTL: {err}")))?;
            values.feature_gates = config.feature_gates.clone();
            values.requests = config.requests.clone();
            values.runtime_config = config.runtime_config.clone();
        }

        let networking = self.shoot.spec.networking.clone().unwrap_or_default();
        let values = Values {
            admission_plugins,
            api_audiences,
            autoscaling: self.compute_kube_apiserver_autoscaling_config(),
            images,
            maintenance_time_window: self
                .shoot
                .spec
                .maintenance
                .as_ref()
                .and_then(|m| m.time_window.clone())
                .unwrap_or_default(),
            version: self.kubernetes_version().to_string(),
            vpn: VpnConfig {
                reversed_vpn_enabled: self.options.reversed_vpn_enabled,
                pod_network_cidr: networking.pods.unwrap_or_default(),
                service_network_cidr: networking.services.unwrap_or_default(),
                node_network_cidr: networking.nodes,
            },
            ..values
        };

        Ok(KubeApiServer::new(
            self.seed_client.clone(),
            self.seed_namespace.clone(),
            values,
        ))
    }

    /// Reads the audit policy referenced by the shoot from the garden
    /// cluster.
    ///
    /// A missing config map is tolerated while the shoot is being deleted so
    /// that users can delete it together with the shoot.
    pub async fn compute_kube_apiserver_audit_config(&self) -> Result<Option<AuditConfig>> {
        let Some(name) = self
            .kube_apiserver_config()
            .and_then(|c| c.audit_config.as_ref())
            .and_then(|a| a.audit_policy.as_ref())
            .and_then(|p| p.config_map_ref.as_ref())
            .map(|r| r.name.clone())
        else {
            return Ok(None);
        };
        let namespace = self.shoot.metadata.namespace.clone().unwrap_or_default();

        let mut out = AuditConfig::default();
        match self.garden_client.get::<ConfigMap>(Some(&namespace), &name).await {
            Ok(config_map) => {
                let policy = config_map
                    .data
                    .and_then(|mut d| d.remove("policy"))
                    .ok_or_else(|| {
                        Error::Invalid(format!(
                            "missing '.data.policy' in audit policy configmap {namespace}/{name}"
                        ))
                    })?;
                out.policy = Some(policy);
            }
            Err(err) if err.is_not_found() && self.shoot.metadata.deletion_timestamp.is_some() => {
                debug!(configmap = %name, "Ignoring missing audit policy of shoot in deletion");
            }
            Err(err) => {
                return Err(Error::Invalid(format!(
                    "retrieving audit policy from the ConfigMap '{name}' failed with reason '{err}'"
                )))
            }
        }
        Ok(Some(out))
    }

    /// Replica range, resources and HVPA usage of the kube-apiserver.
    pub fn compute_kube_apiserver_autoscaling_config(&self) -> AutoscalingConfig {
        let features = &self.options.features;
        let mut hvpa_enabled = features.enabled(HVPA);
        let mut use_memory_metric_for_hvpa_hpa = false;
        let mut scale_down_disabled_for_hvpa = false;
        let mut replicas = None;
        let mut min_replicas = 1;
        let mut max_replicas = 4;

        if self.shoot.purpose() == SHOOT_PURPOSE_PRODUCTION {
            min_replicas = 2;
        }
        if self.has_annotation(SHOOT_ALPHA_CONTROL_PLANE_SCALE_DOWN_DISABLED) {
            min_replicas = 4;
            scale_down_disabled_for_hvpa = true;
        }

        let node_count = if hvpa_enabled {
            self.shoot.max_node_count()
        } else {
            self.shoot.min_node_count()
        };
        let mut api_server_resources = resources_requirements_for_kube_apiserver(
            node_count,
            self.annotation(SHOOT_ALPHA_SCALING_APISERVER_CLASS)
                .unwrap_or_default(),
        );

        if let Some(managed_seed) = &self.options.managed_seed {
            hvpa_enabled = features.enabled(HVPA_FOR_SHOOTED_SEED);
            use_memory_metric_for_hvpa_hpa = true;

            if let Some(api_server) = &managed_seed.api_server {
                min_replicas = api_server.min_replicas;
                max_replicas = api_server.max_replicas;

                if !hvpa_enabled {
                    replicas = api_server.replicas;
                    api_server_resources = requests("1750m", "2Gi");
                }
            }
        }

        AutoscalingConfig {
            api_server_resources,
            hvpa_enabled,
            replicas,
            min_replicas,
            max_replicas,
            use_memory_metric_for_hvpa_hpa,
            scale_down_disabled_for_hvpa,
        }
    }

    fn compute_kube_apiserver_images(&self) -> Result<Images> {
        Ok(Images {
            alpine_iptables: self.image(images::ALPINE_IPTABLES)?,
            apiserver_proxy_pod_webhook: self.image(images::APISERVER_PROXY_POD_WEBHOOK)?,
            kube_apiserver: self.image(images::KUBE_APISERVER)?,
            vpn_seed: self.image(images::VPN_SEED)?,
        })
    }

    /// Additional names and addresses of the serving certificate.
    pub fn compute_kube_apiserver_server_certificate_config(&self) -> ServerCertificateConfig {
        let mut extra_ip_addresses: Vec<IpAddr> = self.api_server_service_ip().into_iter().collect();
        let mut extra_dns_names = vec![super::api_server_domain(
            &self.options.internal_cluster_domain,
        )];
        if let Some(id) = self.shoot.status.as_ref().and_then(|s| s.technical_id.clone()) {
            extra_dns_names.push(id);
        }

        if !self.options.seed_shoot_dns_enabled {
            match self.options.api_server_address.parse::<IpAddr>() {
                Ok(ip) => extra_ip_addresses.push(ip),
                Err(_) => extra_dns_names.push(self.options.api_server_address.clone()),
            }
        }

        if let Some(external) = &self.options.external_cluster_domain {
            if let Some(domain) = self.shoot.spec.dns.as_ref().and_then(|d| d.domain.clone()) {
                extra_dns_names.push(domain);
            }
            extra_dns_names.push(super::api_server_domain(external));
        }

        ServerCertificateConfig {
            extra_ip_addresses,
            extra_dns_names,
        }
    }

    /// Service account token settings, reading a user provided signing key
    /// from the garden cluster.
    pub async fn compute_kube_apiserver_service_account_config(
        &self,
        external_hostname: &str,
    ) -> Result<ServiceAccountConfig> {
        let mut out = ServiceAccountConfig {
            issuer: format!("https://{external_hostname}"),
            ..Default::default()
        };
        let Some(config) = self
            .kube_apiserver_config()
            .and_then(|c| c.service_account_config.as_ref())
        else {
            return Ok(out);
        };

        out.extend_token_expiration = config.extend_token_expiration;
        out.max_token_expiration = config
            .max_token_expiration
            .as_deref()
            .map(humantime::parse_duration)
            .transpose()
            .map_err(|err| Error::Invalid(format!("invalid max token expiration: {err}")))?;
        if let Some(issuer) = &config.issuer {
            out.issuer = issuer.clone();
        }
        out.accepted_issuers = config.accepted_issuers.clone();

        if let Some(secret_ref) = &config.signing_key_secret_name {
            let namespace = self.shoot.metadata.namespace.clone().unwrap_or_default();
            let secret: Secret = self
                .garden_client
                .get(Some(&namespace), &secret_ref.name)
                .await?;
            let key = secret
                .data
                .and_then(|mut d| d.remove(SECRET_SERVICE_ACCOUNT_SIGNING_KEY_DATA_KEY))
                .ok_or_else(|| {
                    Error::Invalid(format!(
                        "no signing key in secret {namespace}/{} at .data.{SECRET_SERVICE_ACCOUNT_SIGNING_KEY_DATA_KEY}",
                        secret_ref.name
                    ))
                })?;
            out.signing_key = Some(key.0);
        }
        Ok(out)
    }

    /// SNI settings from the seed options.
    pub fn compute_kube_apiserver_sni_config(&self) -> SniConfig {
        let mut config = SniConfig::default();
        if self.options.sni_enabled {
            config.enabled = true;
            config.advertise_address = Some(self.options.api_server_cluster_ip.clone());
            if self.options.sni_pod_mutator_enabled {
                config.pod_mutator_enabled = true;
                config.api_server_fqdn = self.compute_out_of_cluster_api_server_address(true);
            }
        }
        config
    }

    /// Desired replicas of the kube-apiserver deployment.
    pub fn compute_kube_apiserver_replicas(
        &self,
        autoscaling: &AutoscalingConfig,
        deployment: Option<&Deployment>,
    ) -> Option<i32> {
        let hibernated = self.shoot.hibernation_enabled();
        let current = deployment.and_then(|d| d.spec.as_ref()).and_then(|s| s.replicas);

        match (autoscaling.replicas, deployment, current) {
            // Replicas set explicitly are never changed.
            (Some(replicas), _, _) => Some(replicas),
            (None, None, _) if !hibernated => Some(autoscaling.min_replicas),
            // The autoscaler owns the replicas of a running deployment.
            (None, Some(_), Some(replicas)) if replicas > 0 => Some(replicas),
            // Stay scaled down while hibernated; scaling down a running
            // deployment happens later in the flow.
            _ if hibernated => Some(0),
            _ => Some(1),
        }
    }

    fn kube_apiserver_secrets(&self, reversed_vpn_enabled: bool) -> Secrets {
        let etcd_secrets = SecretNames::for_role(crate::component::etcd::ROLE_MAIN);
        let secret = |name: &str| ComponentSecret {
            name: name.to_string(),
            checksum: self.load_checksum(name),
        };
        let mut secrets = Secrets {
            ca: secret(SECRET_NAME_CA_CLUSTER),
            ca_etcd: secret(&etcd_secrets.ca),
            ca_front_proxy: secret(SECRET_NAME_CA_FRONT_PROXY),
            etcd: secret(&etcd_secrets.client),
            ..Default::default()
        };
        if reversed_vpn_enabled {
            secrets.vpn_seed_server_tls_auth = Some(secret(SECRET_NAME_VPN_SEED_SERVER_TLS_AUTH));
        } else {
            secrets.vpn_seed = Some(secret(SECRET_NAME_VPN_SEED));
            secrets.vpn_seed_tls_auth = Some(secret(SECRET_NAME_VPN_SEED_TLS_AUTH));
        }
        secrets
    }

    /// Deploys the kube-apiserver and removes objects of former versions.
    pub async fn deploy_kube_apiserver(&mut self) -> Result<()> {
        let deployment: Option<Deployment> = client::get_opt(
            &self.seed_client,
            Some(&self.seed_namespace),
            DEPLOYMENT_NAME_KUBE_APISERVER,
        )
        .await?;

        let external_hostname = self.compute_out_of_cluster_api_server_address(true);
        let external_server = self.compute_out_of_cluster_api_server_address(false);
        let service_account = self
            .compute_kube_apiserver_service_account_config(&external_hostname)
            .await?;
        let server_certificate = self.compute_kube_apiserver_server_certificate_config();
        let sni = self.compute_kube_apiserver_sni_config();

        let values = self.components()?.kube_apiserver.values().clone();
        let replicas = self.compute_kube_apiserver_replicas(&values.autoscaling, deployment.as_ref());
        let secrets = self.kube_apiserver_secrets(values.vpn.reversed_vpn_enabled);

        let kube_apiserver = &mut self.components_mut()?.kube_apiserver;
        kube_apiserver.set_autoscaling_replicas(replicas);
        if values.autoscaling.hvpa_enabled {
            let resources = deployment
                .as_ref()
                .and_then(|d| d.spec.as_ref())
                .and_then(|s| s.template.spec.as_ref())
                .and_then(|p| {
                    p.containers
                        .iter()
                        .find(|c| c.name == kubeapiserver::CONTAINER_NAME_KUBE_APISERVER)
                })
                .and_then(|c| c.resources.clone());
            if let Some(resources) = resources {
                kube_apiserver.set_autoscaling_apiserver_resources(resources);
            }
        }
        kube_apiserver.set_secrets(secrets);
        kube_apiserver.set_server_certificate_config(server_certificate);
        kube_apiserver.set_sni_config(sni);
        kube_apiserver.set_external_hostname(external_hostname);
        kube_apiserver.set_external_server(external_server);
        kube_apiserver.set_service_account_config(service_account);
        kube_apiserver.deploy().await?;

        self.cleanup_legacy_shoot_state_data().await?;

        let namespace = Some(self.seed_namespace.as_str());
        for name in LEGACY_CONFIG_MAPS {
            client::delete_ignore_not_found::<ConfigMap, _>(&self.seed_client, namespace, name)
                .await?;
        }
        for name in LEGACY_SECRETS {
            client::delete_ignore_not_found::<Secret, _>(&self.seed_client, namespace, name)
                .await?;
        }
        Ok(())
    }

    async fn cleanup_legacy_shoot_state_data(&self) -> Result<()> {
        let namespace = self.shoot.metadata.namespace.clone().unwrap_or_default();
        let name = self.shoot.metadata.name.clone().unwrap_or_default();
        let Some(state) =
            client::get_opt::<ShootState, _>(&self.garden_client, Some(&namespace), &name).await?
        else {
            return Ok(());
        };

        let before = state.spec.gardener.len();
        let remaining: Vec<_> = state
            .spec
            .gardener
            .into_iter()
            .filter(|d| !LEGACY_SHOOT_STATE_DATA.contains(&d.name.as_str()))
            .collect();
        if remaining.len() == before {
            return Ok(());
        }
        let patch = json!({ "spec": { "gardener": remaining } });
        self.garden_client
            .patch_merge::<ShootState>(Some(&namespace), &name, &patch)
            .await?;
        Ok(())
    }

    /// Deletes the kube-apiserver.
    pub async fn delete_kube_apiserver(&self) -> Result<()> {
        self.components()?.kube_apiserver.destroy().await?;
        Ok(())
    }

    /// Deploys the kube-apiserver of a hibernated shoot and scales it up.
    pub async fn wake_up_kube_apiserver(&mut self) -> Result<()> {
        self.deploy_kube_apiserver().await?;
        self.scale_kube_apiserver_to_one().await?;
        self.components()?.kube_apiserver.wait().await?;
        info!(namespace = %self.seed_namespace, "Woke up kube-apiserver");
        Ok(())
    }

    /// Scales the kube-apiserver deployment to one replica.
    pub async fn scale_kube_apiserver_to_one(&self) -> Result<()> {
        self.scale_kube_apiserver(1).await
    }

    pub(crate) async fn scale_kube_apiserver(&self, replicas: i32) -> Result<()> {
        self.seed_client
            .patch_merge::<Deployment>(
                Some(&self.seed_namespace),
                DEPLOYMENT_NAME_KUBE_APISERVER,
                &json!({ "spec": { "replicas": replicas } }),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::{ManagedSeed, ManagedSeedApiServer};
    use super::*;
    use crate::apis::core::{
        AuditConfig as ShootAuditConfig, AuditPolicy, GardenerResourceData, NameRef,
        ServiceAccountConfig as ShootServiceAccountConfig, ShootStateSpec,
    };
    use crate::client::fake::FakeClusterClient;
    use crate::feature::MemoryFeatureGate;
    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;
    use std::sync::Arc;
    use std::time::Duration;

    fn names(plugins: &[AdmissionPlugin]) -> Vec<&str> {
        plugins.iter().map(|p| p.name.as_str()).collect()
    }

    fn with_kube_apiserver_config(config: KubeApiServerConfig) -> crate::apis::core::Shoot {
        let mut shoot = shoot();
        shoot.spec.kubernetes.kube_api_server = Some(config);
        shoot
    }

    fn with_audit_policy(name: &str) -> crate::apis::core::Shoot {
        with_kube_apiserver_config(KubeApiServerConfig {
            audit_config: Some(ShootAuditConfig {
                audit_policy: Some(AuditPolicy {
                    config_map_ref: Some(NameRef {
                        name: name.to_string(),
                    }),
                }),
            }),
            ..Default::default()
        })
    }

    fn deployment(replicas: Option<i32>) -> Deployment {
        Deployment {
            spec: Some(DeploymentSpec {
                replicas,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_admission_plugins_depend_on_version() {
        let old = default_admission_plugins("1.22.0");
        assert!(names(&old).contains(&"PodSecurityPolicy"));
        assert!(!names(&old).contains(&"PodSecurity"));

        let new = default_admission_plugins("1.27.3");
        assert!(!names(&new).contains(&"PodSecurityPolicy"));
        assert!(names(&new).contains(&"PodSecurity"));
        assert_eq!(new[0].name, "Priority");
    }

    #[test]
    fn test_compute_admission_plugins() {
        let defaults = vec![
            AdmissionPlugin::named("Priority"),
            AdmissionPlugin::named("NamespaceLifecycle"),
        ];
        let overwrite = AdmissionPlugin {
            name: "Priority".to_string(),
            config: Some(json!({"foo": "bar"})),
            disabled: None,
        };
        let configured = vec![overwrite.clone(), AdmissionPlugin::named("Foo")];

        let plugins = compute_kube_apiserver_admission_plugins(defaults, &configured);
        assert_eq!(names(&plugins), vec!["Priority", "NamespaceLifecycle", "Foo"]);
        assert_eq!(plugins[0], overwrite);
    }

    #[test]
    fn test_resources_requirements_by_node_count() {
        let cpu = |nodes: i32, class: &str| {
            resources_requirements_for_kube_apiserver(nodes, class).requests.unwrap()["cpu"]
                .0
                .clone()
        };
        assert_eq!(cpu(2, ""), "800m");
        assert_eq!(cpu(10, ""), "1000m");
        assert_eq!(cpu(50, ""), "1200m");
        assert_eq!(cpu(100, ""), "2500m");
        assert_eq!(cpu(101, ""), "3000m");
        assert_eq!(cpu(1, "xlarge"), "2500m");
        assert_eq!(cpu(1, "huge"), "800m");
    }

    #[tokio::test]
    async fn test_audit_config_without_reference() {
        let client = FakeClusterClient::new();
        let b = botanist(&client, &client);
        assert_eq!(b.compute_kube_apiserver_audit_config().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_audit_config_reads_policy() {
        let garden = FakeClusterClient::new();
        garden
            .create(&ConfigMap {
                metadata: ObjectMeta {
                    name: Some("audit".to_string()),
                    namespace: Some(PROJECT_NAMESPACE.to_string()),
                    ..Default::default()
                },
                data: Some(BTreeMap::from([("policy".to_string(), "rules: []".to_string())])),
                ..Default::default()
            })
            .await
            .unwrap();
        let b = botanist_for(&garden, &FakeClusterClient::new(), with_audit_policy("audit"));

        let config = b.compute_kube_apiserver_audit_config().await.unwrap();
        assert_eq!(config.unwrap().policy.as_deref(), Some("rules: []"));
    }

    #[tokio::test]
    async fn test_audit_config_missing_policy_key() {
        let garden = FakeClusterClient::new();
        garden
            .create(&ConfigMap {
                metadata: ObjectMeta {
                    name: Some("audit".to_string()),
                    namespace: Some(PROJECT_NAMESPACE.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            })
            .await
            .unwrap();
        let b = botanist_for(&garden, &FakeClusterClient::new(), with_audit_policy("audit"));

        let err = b.compute_kube_apiserver_audit_config().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "missing '.data.policy' in audit policy configmap garden-foo/audit"
        );
    }

    #[tokio::test]
    async fn test_audit_config_missing_config_map() {
        let garden = FakeClusterClient::new();
        let seed = FakeClusterClient::new();

        let b = botanist_for(&garden, &seed, with_audit_policy("audit"));
        let err = b.compute_kube_apiserver_audit_config().await.unwrap_err();
        assert!(err
            .to_string()
            .starts_with("retrieving audit policy from the ConfigMap 'audit' failed"));

        let mut shoot = with_audit_policy("audit");
        shoot.metadata.deletion_timestamp = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
            chrono::Utc::now(),
        ));
        let b = botanist_for(&garden, &seed, shoot);
        let config = b.compute_kube_apiserver_audit_config().await.unwrap();
        assert_eq!(config, Some(AuditConfig::default()));
    }

    #[test]
    fn test_autoscaling_config() {
        let client = FakeClusterClient::new();
        let b = botanist(&client, &client);
        let config = b.compute_kube_apiserver_autoscaling_config();
        assert_eq!(config.min_replicas, 1);
        assert_eq!(config.max_replicas, 4);
        assert!(!config.hvpa_enabled);
        assert_eq!(config.replicas, None);
        assert_eq!(config.api_server_resources.requests.unwrap()["cpu"].0, "800m");

        let mut shoot = shoot();
        shoot.spec.purpose = Some("production".to_string());
        let b = botanist_for(&client, &client, shoot.clone());
        assert_eq!(b.compute_kube_apiserver_autoscaling_config().min_replicas, 2);

        shoot.metadata.annotations = Some(BTreeMap::from([(
            SHOOT_ALPHA_CONTROL_PLANE_SCALE_DOWN_DISABLED.to_string(),
            "true".to_string(),
        )]));
        let b = botanist_for(&client, &client, shoot);
        let config = b.compute_kube_apiserver_autoscaling_config();
        assert_eq!(config.min_replicas, 4);
        assert!(config.scale_down_disabled_for_hvpa);
    }

    #[test]
    fn test_autoscaling_config_uses_max_nodes_with_hvpa() {
        let client = FakeClusterClient::new();
        let mut shoot = shoot();
        shoot.spec.provider.workers[0].minimum = 1;
        shoot.spec.provider.workers[0].maximum = 20;
        let mut b = botanist_for(&client, &client, shoot);
        let features = MemoryFeatureGate::gardener();
        features.set(HVPA, true).unwrap();
        b.options.features = Arc::new(features);

        let config = b.compute_kube_apiserver_autoscaling_config();
        assert!(config.hvpa_enabled);
        assert_eq!(config.api_server_resources.requests.unwrap()["cpu"].0, "1200m");
    }

    #[test]
    fn test_autoscaling_config_for_managed_seed() {
        let client = FakeClusterClient::new();
        let mut b = botanist(&client, &client);
        b.options.managed_seed = Some(ManagedSeed {
            api_server: Some(ManagedSeedApiServer {
                replicas: Some(3),
                min_replicas: 3,
                max_replicas: 6,
            }),
        });

        let config = b.compute_kube_apiserver_autoscaling_config();
        assert!(!config.hvpa_enabled);
        assert!(config.use_memory_metric_for_hvpa_hpa);
        assert_eq!(config.replicas, Some(3));
        assert_eq!((config.min_replicas, config.max_replicas), (3, 6));
        assert_eq!(config.api_server_resources.requests.unwrap()["memory"].0, "2Gi");
    }

    #[test]
    fn test_compute_replicas() {
        let client = FakeClusterClient::new();
        let b = botanist(&client, &client);
        let autoscaling = AutoscalingConfig {
            min_replicas: 2,
            ..Default::default()
        };

        let explicit = AutoscalingConfig {
            replicas: Some(5),
            ..autoscaling.clone()
        };
        assert_eq!(b.compute_kube_apiserver_replicas(&explicit, None), Some(5));
        assert_eq!(b.compute_kube_apiserver_replicas(&autoscaling, None), Some(2));
        assert_eq!(
            b.compute_kube_apiserver_replicas(&autoscaling, Some(&deployment(Some(3)))),
            Some(3)
        );
        assert_eq!(
            b.compute_kube_apiserver_replicas(&autoscaling, Some(&deployment(Some(0)))),
            Some(1)
        );

        let mut shoot = shoot();
        shoot.spec.hibernation = Some(crate::apis::core::Hibernation { enabled: Some(true) });
        let b = botanist_for(&client, &client, shoot);
        assert_eq!(b.compute_kube_apiserver_replicas(&autoscaling, None), Some(0));
        assert_eq!(
            b.compute_kube_apiserver_replicas(&autoscaling, Some(&deployment(Some(0)))),
            Some(0)
        );
        assert_eq!(
            b.compute_kube_apiserver_replicas(&autoscaling, Some(&deployment(Some(2)))),
            Some(2)
        );
    }

    #[test]
    fn test_server_certificate_config() {
        let client = FakeClusterClient::new();
        let mut b = botanist(&client, &client);
        let config = b.compute_kube_apiserver_server_certificate_config();
        assert_eq!(config.extra_ip_addresses, vec!["100.64.0.1".parse::<IpAddr>().unwrap()]);
        assert_eq!(
            config.extra_dns_names,
            vec!["api.bar.foo.internal.example.com", SEED_NAMESPACE]
        );

        b.options.seed_shoot_dns_enabled = false;
        b.options.api_server_address = "10.0.0.1".to_string();
        b.options.external_cluster_domain = Some("bar.example.com".to_string());
        b.shoot.spec.dns = Some(crate::apis::core::Dns {
            domain: Some("bar.example.com".to_string()),
        });
        let config = b.compute_kube_apiserver_server_certificate_config();
        assert_eq!(config.extra_ip_addresses.len(), 2);
        assert_eq!(
            &config.extra_dns_names[2..],
            &["bar.example.com".to_string(), "api.bar.example.com".to_string()]
        );
    }

    #[tokio::test]
    async fn test_service_account_config() {
        let garden = FakeClusterClient::new();
        let b = botanist(&garden, &garden);
        let config = b
            .compute_kube_apiserver_service_account_config("api.example.com")
            .await
            .unwrap();
        assert_eq!(config.issuer, "https://api.example.com");

        let shoot = with_kube_apiserver_config(KubeApiServerConfig {
            service_account_config: Some(ShootServiceAccountConfig {
                issuer: Some("issuer".to_string()),
                accepted_issuers: vec!["old".to_string()],
                max_token_expiration: Some("24h".to_string()),
                signing_key_secret_name: Some(NameRef {
                    name: "sa-key".to_string(),
                }),
                ..Default::default()
            }),
            ..Default::default()
        });
        let b = botanist_for(&garden, &garden, shoot);
        let err = b
            .compute_kube_apiserver_service_account_config("api.example.com")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));

        garden
            .create(&Secret {
                metadata: ObjectMeta {
                    name: Some("sa-key".to_string()),
                    namespace: Some(PROJECT_NAMESPACE.to_string()),
                    ..Default::default()
                },
                data: Some(BTreeMap::from([(
                    "signing-key".to_string(),
                    ByteString(b"key".to_vec()),
                )])),
                ..Default::default()
            })
            .await
            .unwrap();
        let config = b
            .compute_kube_apiserver_service_account_config("api.example.com")
            .await
            .unwrap();
        assert_eq!(config.issuer, "issuer");
        assert_eq!(config.accepted_issuers, vec!["old"]);
        assert_eq!(config.max_token_expiration, Some(Duration::from_secs(24 * 3600)));
        assert_eq!(config.signing_key, Some(b"key".to_vec()));
    }

    #[test]
    fn test_sni_config() {
        let client = FakeClusterClient::new();
        let mut b = botanist(&client, &client);
        assert_eq!(b.compute_kube_apiserver_sni_config(), SniConfig::default());

        b.options.sni_enabled = true;
        b.options.sni_pod_mutator_enabled = true;
        b.options.api_server_cluster_ip = "10.1.2.3".to_string();
        let config = b.compute_kube_apiserver_sni_config();
        assert!(config.enabled && config.pod_mutator_enabled);
        assert_eq!(config.advertise_address.as_deref(), Some("10.1.2.3"));
        assert_eq!(config.api_server_fqdn, "api.bar.foo.internal.example.com");
    }

    #[tokio::test]
    async fn test_default_kube_apiserver_audiences() {
        let client = FakeClusterClient::new();
        let shoot = with_kube_apiserver_config(KubeApiServerConfig {
            api_audiences: Some(vec!["foo".to_string()]),
            event_ttl: Some("1h".to_string()),
            ..Default::default()
        });
        let b = botanist_for(&client, &client, shoot);

        let kas = b.default_kube_apiserver().await.unwrap();
        assert_eq!(kas.values().api_audiences, vec!["foo", "gardener"]);
        assert_eq!(kas.values().event_ttl, Some(Duration::from_secs(3600)));
        assert_eq!(kas.values().vpn.service_network_cidr, "100.64.0.0/13");
    }

    #[tokio::test]
    async fn test_deploy_kube_apiserver_cleans_up_legacy_objects() {
        let garden = FakeClusterClient::new();
        let seed = FakeClusterClient::new();
        for name in LEGACY_CONFIG_MAPS {
            seed.create(&ConfigMap {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    namespace: Some(SEED_NAMESPACE.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            })
            .await
            .unwrap();
        }
        let data = |name: &str| GardenerResourceData {
            name: name.to_string(),
            type_: "secret".to_string(),
            data: json!({}),
        };
        garden
            .create(&ShootState {
                metadata: ObjectMeta {
                    name: Some("bar".to_string()),
                    namespace: Some(PROJECT_NAMESPACE.to_string()),
                    ..Default::default()
                },
                spec: ShootStateSpec {
                    gardener: vec![data("static-token"), data("ca")],
                },
            })
            .await
            .unwrap();

        let mut b = botanist(&garden, &seed);
        b.init_components().await.unwrap();
        b.deploy_kube_apiserver().await.unwrap();

        for name in LEGACY_CONFIG_MAPS {
            assert!(!seed.contains::<ConfigMap>(Some(SEED_NAMESPACE), name).await);
        }
        let state: ShootState = garden.get(Some(PROJECT_NAMESPACE), "bar").await.unwrap();
        assert_eq!(state.spec.gardener, vec![data("ca")]);

        let deployment: Deployment = seed
            .get(Some(SEED_NAMESPACE), DEPLOYMENT_NAME_KUBE_APISERVER)
            .await
            .unwrap();
        assert_eq!(deployment.spec.unwrap().replicas, Some(1));
    }

    #[tokio::test]
    async fn test_scale_kube_apiserver_to_one() {
        let client = FakeClusterClient::new();
        let mut b = botanist(&client, &client);
        b.init_components().await.unwrap();
        b.deploy_kube_apiserver().await.unwrap();
        b.scale_kube_apiserver(0).await.unwrap();

        b.scale_kube_apiserver_to_one().await.unwrap();
        let deployment: Deployment = client
            .get(Some(SEED_NAMESPACE), DEPLOYMENT_NAME_KUBE_APISERVER)
            .await
            .unwrap();
        assert_eq!(deployment.spec.unwrap().replicas, Some(1));
    }

    #[tokio::test]
    async fn test_delete_kube_apiserver() {
        let client = FakeClusterClient::new();
        let mut b = botanist(&client, &client);
        b.init_components().await.unwrap();
        b.deploy_kube_apiserver().await.unwrap();

        b.delete_kube_apiserver().await.unwrap();
        assert!(
            !client
                .contains::<Deployment>(Some(SEED_NAMESPACE), DEPLOYMENT_NAME_KUBE_APISERVER)
                .await
        );
    }
}
