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

//! The shoot's kube-apiserver running in the seed.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::autoscaling::v2::{
    HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec, MetricSpec, MetricTarget,
    ResourceMetricSource, CrossVersionObjectReference as ScaleTargetRef,
};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, PodSpec, PodTemplateSpec,
    ResourceRequirements, Secret as CoreSecret, SecretVolumeSource, Service, ServicePort,
    ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use tracing::debug;

use super::{etcd, Deployer, Error, Result, Waiter};
use crate::apis::autoscaling::{
    ChangeParams, ContainerResourcePolicy, HpaMetric, HpaSpec, HpaTemplate, HpaTemplateSpec, Hvpa,
    HvpaSpec, PodResourcePolicy, ScaleParams, ScaleType, UpdatePolicy, VpaSpec, VpaTemplate,
    VpaTemplateSpec, WeightBasedScalingInterval, CONTAINER_SCALING_MODE_OFF,
    CONTROLLED_VALUES_REQUESTS_ONLY, UPDATE_MODE_AUTO, UPDATE_MODE_OFF, VPA_ONLY,
};
use crate::apis::constants::{
    DEPLOYMENT_NAME_KUBE_APISERVER, GARBAGE_COLLECTABLE_REFERENCE, GARDEN_ROLE,
    GARDEN_ROLE_CONTROL_PLANE, LABEL_APP, LABEL_ROLE,
};
use crate::apis::core::{AdmissionPlugin, KubeApiServerRequests, MaintenanceTimeWindow};
use crate::apis::druid::CrossVersionObjectReference;
use crate::client::{self, ClusterClient};
use crate::utils::retry::{Outcome, RetryOps};
use crate::utils::{compute_checksum, go_duration_string, string_map};

/// Name of the kube-apiserver container.
pub const CONTAINER_NAME_KUBE_APISERVER: &str = "kube-apiserver";
/// Name of the VPN sidecar container used without reversed VPN.
pub const CONTAINER_NAME_VPN_SEED: &str = "vpn-seed";

/// Name of the VPN seed client secret.
pub const SECRET_NAME_VPN_SEED: &str = "vpn-seed";
/// Name of the VPN seed TLS auth secret.
pub const SECRET_NAME_VPN_SEED_TLS_AUTH: &str = "vpn-seed-tlsauth";
/// Name of the kubeconfig handed out to shoot owners.
pub const SECRET_NAME_USER_KUBECONFIG: &str = "user-kubeconfig";
/// Data key of the service account signing key in user provided secrets.
pub const SECRET_SERVICE_ACCOUNT_SIGNING_KEY_DATA_KEY: &str = "signing-key";

/// Port the kube-apiserver serves on.
pub const PORT: i32 = 443;

const HPA_ONLY: i32 = 0;

const LABEL_APP_VALUE: &str = "kubernetes";
const LABEL_ROLE_VALUE: &str = "apiserver";

const CONFIG_MAP_NAME_PREFIX_ADMISSION: &str = "kube-apiserver-admission-config";
const CONFIG_MAP_NAME_PREFIX_AUDIT_POLICY: &str = "audit-policy-config";
const SECRET_NAME_PREFIX_SERVICE_ACCOUNT_KEY: &str = "kube-apiserver-sa-signing-key";

const VOLUME_MOUNT_PATH_ADMISSION: &str = "/etc/kubernetes/admission";
const VOLUME_MOUNT_PATH_AUDIT_POLICY: &str = "/etc/kubernetes/audit";
const VOLUME_MOUNT_PATH_SERVICE_ACCOUNT_KEY: &str = "/srv/kubernetes/service-account-key";

/// Container images of the deployment.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Images {
    /// iptables init container image.
    pub alpine_iptables: String,
    /// Webhook image injecting the apiserver proxy into pods.
    pub apiserver_proxy_pod_webhook: String,
    /// kube-apiserver image.
    pub kube_apiserver: String,
    /// VPN sidecar image.
    pub vpn_seed: String,
}

/// Horizontal and vertical scaling of the deployment.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AutoscalingConfig {
    /// Resources of the kube-apiserver container.
    pub api_server_resources: ResourceRequirements,
    /// Scales through an HVPA instead of an HPA.
    pub hvpa_enabled: bool,
    /// Desired replicas; the current replicas are kept when unset.
    pub replicas: Option<i32>,
    /// Lower replica bound.
    pub min_replicas: i32,
    /// Upper replica bound.
    pub max_replicas: i32,
    /// Adds a memory metric to the HVPA's HPA.
    pub use_memory_metric_for_hvpa_hpa: bool,
    /// Disables scale down through the HVPA's VPA.
    pub scale_down_disabled_for_hvpa: bool,
}

/// Audit logging of the kube-apiserver.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuditConfig {
    /// Audit policy document, the default policy is used when unset.
    pub policy: Option<String>,
}

/// VPN connectivity between control plane and shoot networks.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VpnConfig {
    /// Uses the reversed VPN, which drops the VPN sidecar.
    pub reversed_vpn_enabled: bool,
    /// Pod network of the shoot.
    pub pod_network_cidr: String,
    /// Service network of the shoot.
    pub service_network_cidr: String,
    /// Node network of the shoot.
    pub node_network_cidr: Option<String>,
}

/// Configuration of the kube-apiserver.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Values {
    /// Admission plugins on top of the defaults.
    pub admission_plugins: Vec<AdmissionPlugin>,
    /// Allows anonymous requests.
    pub anonymous_authentication_enabled: bool,
    /// Audiences accepted in service account tokens.
    pub api_audiences: Vec<String>,
    /// Audit logging.
    pub audit: Option<AuditConfig>,
    /// Scaling of the deployment.
    pub autoscaling: AutoscalingConfig,
    /// Retention of events.
    pub event_ttl: Option<Duration>,
    /// Feature gates.
    pub feature_gates: BTreeMap<String, bool>,
    /// Container images.
    pub images: Images,
    /// Window in which the HVPA may scale down.
    pub maintenance_time_window: MaintenanceTimeWindow,
    /// Inflight request limits.
    pub requests: Option<KubeApiServerRequests>,
    /// API groups and versions switched on or off.
    pub runtime_config: BTreeMap<String, bool>,
    /// Kubernetes version.
    pub version: String,
    /// VPN settings.
    pub vpn: VpnConfig,
}

/// A secret the deployment depends on, rolled out when its checksum changes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Secret {
    /// Secret name.
    pub name: String,
    /// Checksum of the secret data.
    pub checksum: String,
}

impl Secret {
    /// Creates a reference to `name` with the checksum of `data`.
    pub fn new(name: impl Into<String>, data: impl AsRef<[u8]>) -> Self {
        Self {
            name: name.into(),
            checksum: compute_checksum(data),
        }
    }
}

/// Secrets mounted into the kube-apiserver pods.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Secrets {
    /// Cluster CA.
    pub ca: Secret,
    /// etcd CA.
    pub ca_etcd: Secret,
    /// Front proxy CA.
    pub ca_front_proxy: Secret,
    /// etcd client certificate.
    pub etcd: Secret,
    /// VPN seed client secret, used without reversed VPN.
    pub vpn_seed: Option<Secret>,
    /// VPN seed TLS auth secret, used without reversed VPN.
    pub vpn_seed_tls_auth: Option<Secret>,
    /// VPN seed server TLS auth secret, used with reversed VPN.
    pub vpn_seed_server_tls_auth: Option<Secret>,
}

impl Secrets {
    fn all(&self) -> impl Iterator<Item = &Secret> {
        [&self.ca, &self.ca_etcd, &self.ca_front_proxy, &self.etcd]
            .into_iter()
            .chain(self.vpn_seed.iter())
            .chain(self.vpn_seed_tls_auth.iter())
            .chain(self.vpn_seed_server_tls_auth.iter())
    }
}

/// Extra subject alternative names of the serving certificate.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServerCertificateConfig {
    /// Additional IP addresses.
    pub extra_ip_addresses: Vec<IpAddr>,
    /// Additional DNS names.
    pub extra_dns_names: Vec<String>,
}

/// Exposure of the kube-apiserver through the seed's SNI ingress.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SniConfig {
    /// Exposes the kube-apiserver through SNI.
    pub enabled: bool,
    /// Address advertised to clients.
    pub advertise_address: Option<String>,
    /// Injects the apiserver proxy into shoot pods.
    pub pod_mutator_enabled: bool,
    /// Fully qualified domain name of the kube-apiserver.
    pub api_server_fqdn: String,
}

/// Issuing and validation of service account tokens.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceAccountConfig {
    /// Token issuer.
    pub issuer: String,
    /// Additional issuers accepted.
    pub accepted_issuers: Vec<String>,
    /// Extends the expiration of projected tokens.
    pub extend_token_expiration: Option<bool>,
    /// Maximum validity of issued tokens.
    pub max_token_expiration: Option<Duration>,
    /// User provided signing key, a generated key is used when unset.
    pub signing_key: Option<Vec<u8>>,
}

/// Deploys the kube-apiserver of a shoot into its seed namespace.
pub struct KubeApiServer<C> {
    client: C,
    namespace: String,
    values: Values,
    secrets: Secrets,
    server_certificate: ServerCertificateConfig,
    sni: SniConfig,
    external_hostname: String,
    external_server: String,
    service_account: ServiceAccountConfig,
    wait_ops: RetryOps,
}

impl<C: ClusterClient> KubeApiServer<C> {
    /// Creates a deployer for `namespace`.
    pub fn new(client: C, namespace: impl Into<String>, values: Values) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            values,
            secrets: Secrets::default(),
            server_certificate: ServerCertificateConfig::default(),
            sni: SniConfig::default(),
            external_hostname: String::new(),
            external_server: String::new(),
            service_account: ServiceAccountConfig::default(),
            wait_ops: RetryOps::new(Duration::from_secs(5), Duration::from_secs(300)),
        }
    }

    /// Replaces the interval and timeout of the readiness waits.
    pub fn with_wait_ops(mut self, ops: RetryOps) -> Self {
        self.wait_ops = ops;
        self
    }

    /// The configured values.
    pub fn values(&self) -> &Values {
        &self.values
    }

    /// Desired replicas. `None` keeps the current replicas.
    pub fn set_autoscaling_replicas(&mut self, replicas: Option<i32>) {
        self.values.autoscaling.replicas = replicas;
    }

    /// Resources of the kube-apiserver container.
    pub fn set_autoscaling_apiserver_resources(&mut self, resources: ResourceRequirements) {
        self.values.autoscaling.api_server_resources = resources;
    }

    /// Secrets mounted into the pods.
    pub fn set_secrets(&mut self, secrets: Secrets) {
        self.secrets = secrets;
    }

    /// Extra subject alternative names of the serving certificate.
    pub fn set_server_certificate_config(&mut self, config: ServerCertificateConfig) {
        self.server_certificate = config;
    }

    /// SNI exposure.
    pub fn set_sni_config(&mut self, config: SniConfig) {
        self.sni = config;
    }

    /// External hostname of the kube-apiserver.
    pub fn set_external_hostname(&mut self, hostname: impl Into<String>) {
        self.external_hostname = hostname.into();
    }

    /// External server address written into kubeconfigs.
    pub fn set_external_server(&mut self, server: impl Into<String>) {
        self.external_server = server.into();
    }

    /// Service account token settings.
    pub fn set_service_account_config(&mut self, config: ServiceAccountConfig) {
        self.service_account = config;
    }

    /// The configured secrets.
    pub fn secrets(&self) -> &Secrets {
        &self.secrets
    }

    /// The configured external server address.
    pub fn external_server(&self) -> &str {
        &self.external_server
    }

    fn labels(&self) -> BTreeMap<String, String> {
        string_map([(LABEL_APP, LABEL_APP_VALUE), (LABEL_ROLE, LABEL_ROLE_VALUE)])
    }

    fn meta(&self, name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(self.namespace.clone()),
            labels: Some(self.labels()),
            ..Default::default()
        }
    }

    /// Content addressed, immutable config object metadata.
    fn hashed_meta(&self, prefix: &str, content: &[u8]) -> ObjectMeta {
        let checksum = compute_checksum(content);
        let mut meta = self.meta(&format!("{prefix}-{}", &checksum[..8]));
        if let Some(labels) = meta.labels.as_mut() {
            labels.insert(GARBAGE_COLLECTABLE_REFERENCE.to_string(), "true".to_string());
        }
        meta
    }

    fn admission_config_map(&self) -> Result<ConfigMap> {
        let mut data = BTreeMap::new();
        let mut plugins = Vec::new();
        for plugin in &self.values.admission_plugins {
            let Some(config) = &plugin.config else {
                continue;
            };
            let file = format!("{}.yaml", plugin.name.to_lowercase());
            let rendered = serde_yaml::to_string(config).map_err(|source| Error::Render {
                kind: "configmap".to_string(),
                name: file.clone(),
                source,
            })?;
            plugins.push(serde_json::json!({
                "name": plugin.name,
                "path": format!("{VOLUME_MOUNT_PATH_ADMISSION}/{file}"),
            }));
            data.insert(file, rendered);
        }
        let configuration = serde_json::json!({
            "apiVersion": "apiserver.k8s.io/v1alpha1",
            "kind": "AdmissionConfiguration",
            "plugins": plugins,
        });
        let rendered = serde_yaml::to_string(&configuration).map_err(|source| Error::Render {
            kind: "configmap".to_string(),
            name: CONFIG_MAP_NAME_PREFIX_ADMISSION.to_string(),
            source,
        })?;
        data.insert("admission-configuration.yaml".to_string(), rendered);

        let content = serde_json::to_vec(&data)?;
        Ok(ConfigMap {
            metadata: self.hashed_meta(CONFIG_MAP_NAME_PREFIX_ADMISSION, &content),
            data: Some(data),
            immutable: Some(true),
            ..Default::default()
        })
    }

    fn audit_policy_config_map(&self) -> ConfigMap {
        let policy = self
            .values
            .audit
            .as_ref()
            .and_then(|a| a.policy.clone())
            .unwrap_or_else(|| {
                "apiVersion: audit.k8s.io/v1\nkind: Policy\nrules:\n- level: None\n".to_string()
            });
        ConfigMap {
            metadata: self.hashed_meta(CONFIG_MAP_NAME_PREFIX_AUDIT_POLICY, policy.as_bytes()),
            data: Some(BTreeMap::from([("audit-policy.yaml".to_string(), policy)])),
            immutable: Some(true),
            ..Default::default()
        }
    }

    fn service_account_key_secret(&self) -> Option<CoreSecret> {
        let key = self.service_account.signing_key.as_ref()?;
        Some(CoreSecret {
            metadata: self.hashed_meta(SECRET_NAME_PREFIX_SERVICE_ACCOUNT_KEY, key),
            data: Some(BTreeMap::from([(
                "id_rsa".to_string(),
                ByteString(key.clone()),
            )])),
            immutable: Some(true),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        })
    }

    fn service(&self) -> Service {
        Service {
            metadata: self.meta(DEPLOYMENT_NAME_KUBE_APISERVER),
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                selector: Some(self.labels()),
                ports: Some(vec![ServicePort {
                    name: Some("kube-apiserver".to_string()),
                    protocol: Some("TCP".to_string()),
                    port: PORT,
                    target_port: Some(IntOrString::Int(PORT)),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Command line of the kube-apiserver container.
    pub fn command(&self) -> Vec<String> {
        let values = &self.values;
        let mut args = vec![
            "/usr/local/bin/kube-apiserver".to_string(),
            format!("--admission-control-config-file={VOLUME_MOUNT_PATH_ADMISSION}/admission-configuration.yaml"),
            "--allow-privileged=true".to_string(),
            format!("--anonymous-auth={}", values.anonymous_authentication_enabled),
            format!("--audit-policy-file={VOLUME_MOUNT_PATH_AUDIT_POLICY}/audit-policy.yaml"),
            "--authorization-mode=Node,RBAC".to_string(),
            format!(
                "--etcd-servers=https://{}:{}",
                etcd::service_name(etcd::ROLE_MAIN),
                2379
            ),
            format!(
                "--etcd-servers-overrides=/events#https://{}:{}",
                etcd::service_name(etcd::ROLE_EVENTS),
                2379
            ),
            format!("--secure-port={PORT}"),
            format!("--service-cluster-ip-range={}", values.vpn.service_network_cidr),
        ];

        let (enabled, disabled): (Vec<_>, Vec<_>) = values
            .admission_plugins
            .iter()
            .partition(|p| !p.disabled.unwrap_or(false));
        if !enabled.is_empty() {
            args.push(format!(
                "--enable-admission-plugins={}",
                enabled.iter().map(|p| p.name.as_str()).collect::<Vec<_>>().join(",")
            ));
        }
        if !disabled.is_empty() {
            args.push(format!(
                "--disable-admission-plugins={}",
                disabled.iter().map(|p| p.name.as_str()).collect::<Vec<_>>().join(",")
            ));
        }
        if !values.api_audiences.is_empty() {
            args.push(format!("--api-audiences={}", values.api_audiences.join(",")));
        }
        if let Some(ttl) = values.event_ttl {
            args.push(format!("--event-ttl={}", go_duration_string(ttl)));
        }
        if !values.feature_gates.is_empty() {
            args.push(format!("--feature-gates={}", join_bool_map(&values.feature_gates)));
        }
        if !values.runtime_config.is_empty() {
            args.push(format!("--runtime-config={}", join_bool_map(&values.runtime_config)));
        }
        if let Some(requests) = &values.requests {
            if let Some(n) = requests.max_non_mutating_inflight {
                args.push(format!("--max-requests-inflight={n}"));
            }
            if let Some(n) = requests.max_mutating_inflight {
                args.push(format!("--max-mutating-requests-inflight={n}"));
            }
        }

        let sa = &self.service_account;
        if !sa.issuer.is_empty() {
            args.push(format!("--service-account-issuer={}", sa.issuer));
        }
        for issuer in &sa.accepted_issuers {
            args.push(format!("--service-account-issuer={issuer}"));
        }
        if let Some(extend) = sa.extend_token_expiration {
            args.push(format!("--service-account-extend-token-expiration={extend}"));
        }
        if let Some(max) = sa.max_token_expiration {
            args.push(format!("--service-account-max-token-expiration={}", go_duration_string(max)));
        }
        args.push(format!(
            "--service-account-signing-key-file={VOLUME_MOUNT_PATH_SERVICE_ACCOUNT_KEY}/id_rsa"
        ));

        if !self.external_hostname.is_empty() {
            args.push(format!("--external-hostname={}", self.external_hostname));
        }
        if self.sni.enabled {
            if let Some(address) = &self.sni.advertise_address {
                args.push(format!("--advertise-address={address}"));
            }
        }
        if !self.server_certificate.extra_dns_names.is_empty()
            || !self.server_certificate.extra_ip_addresses.is_empty()
        {
            let sans: Vec<String> = self
                .server_certificate
                .extra_dns_names
                .iter()
                .cloned()
                .chain(self.server_certificate.extra_ip_addresses.iter().map(IpAddr::to_string))
                .collect();
            args.push(format!("--tls-sni-cert-key-sans={}", sans.join(",")));
        }
        args
    }

    fn deployment(
        &self,
        replicas: Option<i32>,
        admission: &ConfigMap,
        audit: &ConfigMap,
        sa_key: Option<&CoreSecret>,
    ) -> Deployment {
        let name_of = |meta: &ObjectMeta| meta.name.clone().unwrap_or_default();
        let admission_name = name_of(&admission.metadata);
        let audit_name = name_of(&audit.metadata);

        let mut annotations: BTreeMap<String, String> = self
            .secrets
            .all()
            .filter(|s| !s.name.is_empty())
            .map(|s| (format!("checksum/secret-{}", s.name), s.checksum.clone()))
            .collect();
        if !self.values.vpn.reversed_vpn_enabled {
            annotations.insert(
                "networking.gardener.cloud/seed-vpn".to_string(),
                "true".to_string(),
            );
        }

        let mut volumes = vec![
            Volume {
                name: "admission-config".to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: admission_name.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            },
            Volume {
                name: "audit-policy-config".to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: audit_name.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ];
        let mut mounts = vec![
            VolumeMount {
                name: "admission-config".to_string(),
                mount_path: VOLUME_MOUNT_PATH_ADMISSION.to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: "audit-policy-config".to_string(),
                mount_path: VOLUME_MOUNT_PATH_AUDIT_POLICY.to_string(),
                ..Default::default()
            },
        ];
        if let Some(secret) = sa_key {
            volumes.push(Volume {
                name: "service-account-key".to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: secret.metadata.name.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            });
            mounts.push(VolumeMount {
                name: "service-account-key".to_string(),
                mount_path: VOLUME_MOUNT_PATH_SERVICE_ACCOUNT_KEY.to_string(),
                ..Default::default()
            });
        }
        for secret in [&self.secrets.ca, &self.secrets.ca_etcd, &self.secrets.etcd] {
            if secret.name.is_empty() {
                continue;
            }
            volumes.push(Volume {
                name: secret.name.clone(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(secret.name.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            });
            mounts.push(VolumeMount {
                name: secret.name.clone(),
                mount_path: format!("/srv/kubernetes/{}", secret.name),
                ..Default::default()
            });
        }

        let mut containers = vec![Container {
            name: CONTAINER_NAME_KUBE_APISERVER.to_string(),
            image: Some(self.values.images.kube_apiserver.clone()),
            image_pull_policy: Some("IfNotPresent".to_string()),
            command: Some(self.command()),
            ports: Some(vec![ContainerPort {
                name: Some("https".to_string()),
                container_port: PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            resources: Some(self.values.autoscaling.api_server_resources.clone()),
            volume_mounts: Some(mounts),
            ..Default::default()
        }];
        if self.sni.pod_mutator_enabled {
            containers.push(Container {
                name: "apiserver-proxy-pod-mutator".to_string(),
                image: Some(self.values.images.apiserver_proxy_pod_webhook.clone()),
                image_pull_policy: Some("IfNotPresent".to_string()),
                args: Some(vec![
                    format!("--apiserver-fqdn={}", self.sni.api_server_fqdn),
                    "--host=localhost".to_string(),
                    "--port=9443".to_string(),
                ]),
                ..Default::default()
            });
        }
        let mut init_containers = Vec::new();
        if !self.values.vpn.reversed_vpn_enabled {
            init_containers.push(Container {
                name: "set-iptable-rules".to_string(),
                image: Some(self.values.images.alpine_iptables.clone()),
                command: Some(vec![
                    "/bin/sh".to_string(),
                    "-c".to_string(),
                    "iptables -A INPUT -i tun0 -p icmp -j ACCEPT && iptables -A INPUT -i tun0 -m state ! --state ESTABLISHED,RELATED -j DROP".to_string(),
                ]),
                ..Default::default()
            });
            let mut env = vec![
                env_var("SERVICE_NETWORK", &self.values.vpn.service_network_cidr),
                env_var("POD_NETWORK", &self.values.vpn.pod_network_cidr),
            ];
            if let Some(nodes) = &self.values.vpn.node_network_cidr {
                env.push(env_var("NODE_NETWORK", nodes));
            }
            containers.push(Container {
                name: CONTAINER_NAME_VPN_SEED.to_string(),
                image: Some(self.values.images.vpn_seed.clone()),
                image_pull_policy: Some("IfNotPresent".to_string()),
                env: Some(env),
                ..Default::default()
            });
        }

        let mut pod_labels = self.labels();
        pod_labels.insert(GARDEN_ROLE.to_string(), GARDEN_ROLE_CONTROL_PLANE.to_string());

        Deployment {
            metadata: self.meta(DEPLOYMENT_NAME_KUBE_APISERVER),
            spec: Some(DeploymentSpec {
                replicas,
                revision_history_limit: Some(2),
                selector: LabelSelector {
                    match_labels: Some(self.labels()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        annotations: Some(annotations),
                        labels: Some(pod_labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        automount_service_account_token: Some(false),
                        priority_class_name: Some("gardener-system-500".to_string()),
                        containers,
                        init_containers: (!init_containers.is_empty()).then_some(init_containers),
                        volumes: Some(volumes),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn horizontal_pod_autoscaler(&self) -> HorizontalPodAutoscaler {
        let scaling = &self.values.autoscaling;
        let metric = |name: &str| MetricSpec {
            type_: "Resource".to_string(),
            resource: Some(ResourceMetricSource {
                name: name.to_string(),
                target: MetricTarget {
                    type_: "Utilization".to_string(),
                    average_utilization: Some(80),
                    ..Default::default()
                },
            }),
            ..Default::default()
        };
        HorizontalPodAutoscaler {
            metadata: self.meta(DEPLOYMENT_NAME_KUBE_APISERVER),
            spec: Some(HorizontalPodAutoscalerSpec {
                min_replicas: Some(scaling.min_replicas),
                max_replicas: scaling.max_replicas,
                scale_target_ref: ScaleTargetRef {
                    api_version: Some("apps/v1".to_string()),
                    kind: "Deployment".to_string(),
                    name: DEPLOYMENT_NAME_KUBE_APISERVER.to_string(),
                },
                metrics: Some(vec![metric("cpu"), metric("memory")]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn hvpa(&self) -> Hvpa {
        let scaling = &self.values.autoscaling;
        let hpa_labels = string_map([(LABEL_ROLE, "apiserver-hpa")]);
        let vpa_labels = string_map([(LABEL_ROLE, "apiserver-vpa")]);
        let mut metrics = vec![HpaMetric::resource("cpu", 80)];
        if scaling.use_memory_metric_for_hvpa_hpa {
            metrics.push(HpaMetric::resource("memory", 80));
        }
        let scale_down_mode = if scaling.scale_down_disabled_for_hvpa {
            UPDATE_MODE_OFF
        } else {
            UPDATE_MODE_AUTO
        };
        let min_change = ScaleParams {
            cpu: ChangeParams::new("300m", 80),
            memory: ChangeParams::new("200M", 80),
        };

        Hvpa {
            metadata: self.meta(DEPLOYMENT_NAME_KUBE_APISERVER),
            spec: HvpaSpec {
                replicas: Some(1),
                maintenance_time_window: Some(self.values.maintenance_time_window.clone()),
                hpa: HpaSpec {
                    selector: Some(LabelSelector {
                        match_labels: Some(hpa_labels.clone()),
                        ..Default::default()
                    }),
                    deploy: true,
                    template: HpaTemplate {
                        metadata: ObjectMeta {
                            labels: Some(hpa_labels),
                            ..Default::default()
                        },
                        spec: HpaTemplateSpec {
                            min_replicas: Some(scaling.min_replicas),
                            max_replicas: scaling.max_replicas,
                            metrics,
                        },
                    },
                },
                vpa: VpaSpec {
                    selector: Some(LabelSelector {
                        match_labels: Some(vpa_labels.clone()),
                        ..Default::default()
                    }),
                    deploy: true,
                    scale_up: ScaleType {
                        update_policy: UpdatePolicy {
                            update_mode: Some(UPDATE_MODE_AUTO.to_string()),
                        },
                        stabilization_duration: Some("3m".to_string()),
                        min_change: min_change.clone(),
                    },
                    scale_down: ScaleType {
                        update_policy: UpdatePolicy {
                            update_mode: Some(scale_down_mode.to_string()),
                        },
                        stabilization_duration: Some("15m".to_string()),
                        min_change,
                    },
                    limits_requests_gap_scale_params: ScaleParams {
                        cpu: ChangeParams::new("1", 40),
                        memory: ChangeParams::new("1G", 40),
                    },
                    template: VpaTemplate {
                        metadata: ObjectMeta {
                            labels: Some(vpa_labels),
                            ..Default::default()
                        },
                        spec: VpaTemplateSpec {
                            resource_policy: Some(PodResourcePolicy {
                                container_policies: vec![
                                    ContainerResourcePolicy {
                                        container_name: CONTAINER_NAME_KUBE_APISERVER.to_string(),
                                        controlled_values: Some(
                                            CONTROLLED_VALUES_REQUESTS_ONLY.to_string(),
                                        ),
                                        min_allowed: BTreeMap::from([
                                            ("cpu".to_string(), Quantity("300m".to_string())),
                                            ("memory".to_string(), Quantity("400M".to_string())),
                                        ]),
                                        max_allowed: BTreeMap::from([
                                            ("cpu".to_string(), Quantity("8".to_string())),
                                            ("memory".to_string(), Quantity("25G".to_string())),
                                        ]),
                                        mode: None,
                                    },
                                    ContainerResourcePolicy {
                                        container_name: CONTAINER_NAME_VPN_SEED.to_string(),
                                        mode: Some(CONTAINER_SCALING_MODE_OFF.to_string()),
                                        ..Default::default()
                                    },
                                ],
                            }),
                        },
                    },
                },
                weight_based_scaling_intervals: vec![
                    WeightBasedScalingInterval {
                        vpa_weight: VPA_ONLY,
                        start_replica_count: scaling.min_replicas,
                        last_replica_count: scaling.min_replicas,
                    },
                    WeightBasedScalingInterval {
                        vpa_weight: HPA_ONLY,
                        start_replica_count: scaling.min_replicas + 1,
                        last_replica_count: scaling.max_replicas,
                    },
                ],
                target_ref: Some(CrossVersionObjectReference {
                    api_version: Some("apps/v1".to_string()),
                    kind: "Deployment".to_string(),
                    name: DEPLOYMENT_NAME_KUBE_APISERVER.to_string(),
                }),
            },
        }
    }
}

fn join_bool_map(map: &BTreeMap<String, bool>) -> String {
    map.iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn env_var(name: &str, value: &str) -> k8s_openapi::api::core::v1::EnvVar {
    k8s_openapi::api::core::v1::EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

/// Returns an error message if the deployment has not been rolled out.
pub fn check_deployment(deployment: &Deployment) -> std::result::Result<(), String> {
    let generation = deployment.metadata.generation.unwrap_or_default();
    let status = deployment.status.clone().unwrap_or_default();
    let observed = status.observed_generation.unwrap_or_default();
    if observed < generation {
        return Err(format!("observed generation outdated ({observed}/{generation})"));
    }
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let updated = status.updated_replicas.unwrap_or_default();
    if updated < desired {
        return Err(format!("only {updated}/{desired} replicas are updated"));
    }
    let available = status.available_replicas.unwrap_or_default();
    if available < desired {
        return Err(format!("only {available}/{desired} replicas are available"));
    }
    Ok(())
}

#[async_trait]
impl<C: ClusterClient> Deployer for KubeApiServer<C> {
    async fn deploy(&self) -> Result<()> {
        let namespace = self.namespace.as_str();

        let replicas = match self.values.autoscaling.replicas {
            Some(replicas) => Some(replicas),
            None => client::get_opt::<Deployment, _>(
                &self.client,
                Some(namespace),
                DEPLOYMENT_NAME_KUBE_APISERVER,
            )
            .await?
            .and_then(|d| d.spec)
            .and_then(|s| s.replicas),
        };

        let admission = self.admission_config_map()?;
        let audit = self.audit_policy_config_map();
        let sa_key = self.service_account_key_secret();
        self.client.apply(&admission).await?;
        self.client.apply(&audit).await?;
        if let Some(secret) = &sa_key {
            self.client.apply(secret).await?;
        }

        self.client.apply(&self.service()).await?;
        self.client
            .apply(&self.deployment(replicas, &admission, &audit, sa_key.as_ref()))
            .await?;
        debug!(namespace, ?replicas, "Applied kube-apiserver deployment");

        let scaled_down = replicas == Some(0);
        if self.values.autoscaling.hvpa_enabled && !scaled_down {
            self.client.apply(&self.hvpa()).await?;
        } else {
            client::delete_ignore_not_found::<Hvpa, _>(
                &self.client,
                Some(namespace),
                DEPLOYMENT_NAME_KUBE_APISERVER,
            )
            .await?;
        }
        if !self.values.autoscaling.hvpa_enabled && !scaled_down {
            self.client.apply(&self.horizontal_pod_autoscaler()).await?;
        } else {
            client::delete_ignore_not_found::<HorizontalPodAutoscaler, _>(
                &self.client,
                Some(namespace),
                DEPLOYMENT_NAME_KUBE_APISERVER,
            )
            .await?;
        }
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        let namespace = Some(self.namespace.as_str());
        let name = DEPLOYMENT_NAME_KUBE_APISERVER;

        client::delete_ignore_not_found::<Hvpa, _>(&self.client, namespace, name).await?;
        client::delete_ignore_not_found::<HorizontalPodAutoscaler, _>(&self.client, namespace, name)
            .await?;
        client::delete_ignore_not_found::<Deployment, _>(&self.client, namespace, name).await?;
        client::delete_ignore_not_found::<Service, _>(&self.client, namespace, name).await?;

        let selector = format!("{LABEL_APP}={LABEL_APP_VALUE},{LABEL_ROLE}={LABEL_ROLE_VALUE}");
        for config_map in self
            .client
            .list::<ConfigMap>(namespace, Some(&selector))
            .await?
        {
            let name = config_map.metadata.name.unwrap_or_default();
            client::delete_ignore_not_found::<ConfigMap, _>(&self.client, namespace, &name).await?;
        }
        for secret in self
            .client
            .list::<CoreSecret>(namespace, Some(&selector))
            .await?
        {
            let name = secret.metadata.name.unwrap_or_default();
            client::delete_ignore_not_found::<CoreSecret, _>(&self.client, namespace, &name)
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<C: ClusterClient> Waiter for KubeApiServer<C> {
    async fn wait(&self) -> Result<()> {
        let namespace = self.namespace.as_str();
        let client = &self.client;

        self.wait_ops
            .until(|| async move {
                match client
                    .get::<Deployment>(Some(namespace), DEPLOYMENT_NAME_KUBE_APISERVER)
                    .await
                {
                    Err(err) => Outcome::Minor(err.to_string()),
                    Ok(deployment) => match check_deployment(&deployment) {
                        Ok(()) => Outcome::Done,
                        Err(reason) => Outcome::Minor(format!(
                            "deployment {namespace}/{DEPLOYMENT_NAME_KUBE_APISERVER} is not healthy: {reason}"
                        )),
                    },
                }
            })
            .await?;
        Ok(())
    }

    async fn wait_cleanup(&self) -> Result<()> {
        let namespace = self.namespace.as_str();
        let client = &self.client;

        self.wait_ops
            .until(|| async move {
                match client
                    .get::<Deployment>(Some(namespace), DEPLOYMENT_NAME_KUBE_APISERVER)
                    .await
                {
                    Err(err) if err.is_not_found() => Outcome::Done,
                    Err(err) => Outcome::Minor(err.to_string()),
                    Ok(_) => Outcome::Minor(format!(
                        "deployment {namespace}/{DEPLOYMENT_NAME_KUBE_APISERVER} still exists"
                    )),
                }
            })
            .await?;
        Ok(())
    }
}
