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

//! The etcd cluster of a shoot control plane.
//!
//! The component manages the `Etcd` resource reconciled by etcd-druid and,
//! optionally, an `Hvpa` scaling the resulting stateful set. Values of the
//! existing objects are retained where other actors own them: replicas when
//! none are requested, annotations, the defragmentation and full snapshot
//! schedules, and resource requests set by the autoscaler.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{format_timestamp, system_clock, Clock, Deployer, Error, Result, Waiter};
use crate::apis::autoscaling::{
    ChangeParams, ContainerResourcePolicy, HpaMetric, HpaSpec, HpaTemplate, HpaTemplateSpec,
    Hvpa, HvpaSpec, PodResourcePolicy, ScaleParams, ScaleType, UpdatePolicy, VpaSpec,
    VpaTemplate, VpaTemplateSpec, WeightBasedScalingInterval, CONTAINER_SCALING_MODE_OFF,
    CONTROLLED_VALUES_REQUESTS_ONLY, UPDATE_MODE_AUTO, VPA_ONLY,
};
use crate::apis::constants::{
    CONFIRMATION_DELETION, GARDENER_OPERATION, GARDENER_OPERATION_RECONCILE, GARDENER_TIMESTAMP,
    GARDEN_ROLE, GARDEN_ROLE_CONTROL_PLANE, LABEL_APP, LABEL_ROLE,
};
use crate::apis::core::MaintenanceTimeWindow;
use crate::apis::druid::{
    self, BackupSpec, ClientService, CompressionSpec, CrossVersionObjectReference, EtcdConfig,
    EtcdSpec, LeaderElectionSpec, SecretReference, StoreSpec, TlsConfig,
};
use crate::client::{self, ClusterClient};
use crate::utils::retry::{Outcome, RetryOps};
use crate::utils::{go_duration_string, merge_string_maps, string_map};

/// Role of the etcd storing the shoot's resources.
pub const ROLE_MAIN: &str = "main";
/// Role of the etcd storing the shoot's events.
pub const ROLE_EVENTS: &str = "events";

/// Data key of the CA bundle in CA secrets.
pub const DATA_KEY_CERTIFICATE_BUNDLE: &str = "bundle.crt";

const LABEL_APP_VALUE: &str = "etcd-statefulset";
const CONTAINER_NAME_ETCD: &str = "etcd";
const CONTAINER_NAME_BACKUP_RESTORE: &str = "backup-restore";

const PORT_ETCD_CLIENT: i32 = 2379;
const PORT_ETCD_SERVER: i32 = 2380;
const PORT_BACKUP_RESTORE: i32 = 8080;

const CA_ROTATION_PHASE_PREPARING: &str = "Preparing";

/// Name of the `Etcd` resource and stateful set for a role.
pub fn name(role: &str) -> String {
    format!("etcd-{role}")
}

/// Name of the client service for a role.
pub fn service_name(role: &str) -> String {
    format!("etcd-{role}-client")
}

/// Criticality of an etcd, driving metrics and autoscaling settings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Class {
    /// Default sizing.
    #[default]
    Normal,
    /// Stores the shoot's resources. Gets extensive metrics and larger scaling bounds.
    Important,
}

/// Backup store configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackupConfig {
    /// Storage provider type.
    pub provider: String,
    /// Secret holding the bucket credentials.
    pub secret_ref_name: String,
    /// Prefix of the snapshots in the bucket.
    pub prefix: String,
    /// Bucket name.
    pub container: String,
    /// Cron schedule of full snapshots.
    pub full_snapshot_schedule: String,
    /// How long delta snapshots are kept.
    pub delta_snapshot_retention_period: Option<Duration>,
    /// Leader election of the backup sidecars, used with multiple replicas.
    pub leader_election: Option<BackupLeaderElection>,
}

/// Leader election settings of the backup sidecar.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackupLeaderElection {
    /// Timeout of connections to the local etcd.
    pub etcd_connection_timeout: Option<Duration>,
    /// Interval between leader checks.
    pub reelection_period: Option<Duration>,
}

/// Autoscaling of the etcd stateful set via HVPA.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HvpaConfig {
    /// Deploys the HVPA when true.
    pub enabled: bool,
    /// Window in which the HVPA may scale down.
    pub maintenance_time_window: MaintenanceTimeWindow,
    /// Defaults to `Auto`.
    pub scale_down_update_mode: Option<String>,
}

/// Names of the TLS secrets mounted into the etcd pods.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecretNames {
    /// etcd CA.
    pub ca: String,
    /// Peer CA.
    pub peer_ca: String,
    /// Server certificate.
    pub server: String,
    /// Peer server certificate.
    pub peer_server: String,
    /// Client certificate.
    pub client: String,
}

impl SecretNames {
    /// The secret names used for the given role.
    pub fn for_role(role: &str) -> Self {
        Self {
            ca: "ca-etcd".to_string(),
            peer_ca: "ca-etcd-peer".to_string(),
            server: format!("etcd-server-{role}"),
            peer_server: format!("etcd-peer-server-{role}"),
            client: "etcd-client".to_string(),
        }
    }
}

/// Configuration of an etcd.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Values {
    /// `main` or `events`.
    pub role: String,
    /// Criticality.
    pub class: Class,
    /// Retains the current replicas when unset.
    pub replicas: Option<i32>,
    /// Size of the data volume.
    pub storage_capacity: String,
    /// Storage class of the data volume.
    pub storage_class_name: Option<String>,
    /// Cron schedule of defragmentations.
    pub defragmentation_schedule: Option<String>,
    /// Priority class of the pods.
    pub priority_class_name: String,
    /// Phase of the shoot's CA rotation, empty when none is in progress.
    pub ca_rotation_phase: String,
    /// Runs three members spread over failure domains.
    pub high_availability_enabled: bool,
    /// Routes clients to members in the same zone.
    pub topology_aware_routing_enabled: bool,
    /// TLS secrets.
    pub secret_names: SecretNames,
}

impl Values {
    /// Defaults for `role`.
    pub fn new(role: &str, class: Class) -> Self {
        Self {
            role: role.to_string(),
            class,
            replicas: None,
            storage_capacity: "10Gi".to_string(),
            storage_class_name: None,
            defragmentation_schedule: None,
            priority_class_name: String::new(),
            ca_rotation_phase: String::new(),
            high_availability_enabled: false,
            topology_aware_routing_enabled: false,
            secret_names: SecretNames::for_role(role),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    replicas: Option<i32>,
    timestamp: Option<String>,
}

/// Deploys an `Etcd` resource and its autoscaler into a seed namespace.
pub struct Etcd<C> {
    client: C,
    namespace: String,
    values: Values,
    backup: Option<BackupConfig>,
    hvpa: Option<HvpaConfig>,
    clock: Clock,
    wait_ops: RetryOps,
    state: Mutex<State>,
}

impl<C: ClusterClient> Etcd<C> {
    /// Creates a deployer for `namespace`.
    pub fn new(client: C, namespace: impl Into<String>, values: Values) -> Self {
        let replicas = values.replicas;
        Self {
            client,
            namespace: namespace.into(),
            values,
            backup: None,
            hvpa: None,
            clock: system_clock(),
            wait_ops: RetryOps::new(Duration::from_secs(5), Duration::from_secs(180)),
            state: Mutex::new(State {
                replicas,
                timestamp: None,
            }),
        }
    }

    /// Replaces the clock used for timestamps.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the interval and timeout of the readiness waits.
    pub fn with_wait_ops(mut self, ops: RetryOps) -> Self {
        self.wait_ops = ops;
        self
    }

    /// Backup store. No backup sidecar store is configured when `None`.
    pub fn set_backup_config(&mut self, backup: Option<BackupConfig>) {
        self.backup = backup;
    }

    /// HVPA settings.
    pub fn set_hvpa_config(&mut self, hvpa: Option<HvpaConfig>) {
        self.hvpa = hvpa;
    }

    /// The configured values.
    pub fn values(&self) -> &Values {
        &self.values
    }

    /// The replicas last requested by [`deploy`](Deployer::deploy) or
    /// [`scale`](Self::scale).
    pub async fn replicas(&self) -> Option<i32> {
        self.state.lock().await.replicas
    }

    fn name(&self) -> String {
        name(&self.values.role)
    }

    fn hvpa_enabled(&self) -> bool {
        self.hvpa.as_ref().is_some_and(|h| h.enabled)
    }

    fn role_labels(&self) -> BTreeMap<String, String> {
        string_map([
            (GARDEN_ROLE, GARDEN_ROLE_CONTROL_PLANE),
            (LABEL_ROLE, self.values.role.as_str()),
        ])
    }

    fn selector_labels(&self) -> BTreeMap<String, String> {
        let mut labels = self.role_labels();
        labels.insert(LABEL_APP.to_string(), LABEL_APP_VALUE.to_string());
        labels
    }

    fn secret_ref(&self, name: &str) -> SecretReference {
        SecretReference {
            name: name.to_string(),
            namespace: Some(self.namespace.clone()),
            data_key: None,
        }
    }

    fn ca_ref(&self, name: &str) -> SecretReference {
        SecretReference {
            data_key: Some(DATA_KEY_CERTIFICATE_BUNDLE.to_string()),
            ..self.secret_ref(name)
        }
    }

    fn client_tls(&self) -> TlsConfig {
        let secrets = &self.values.secret_names;
        TlsConfig {
            tls_ca_secret_ref: self.ca_ref(&secrets.ca),
            server_tls_secret_ref: self.secret_ref(&secrets.server),
            client_tls_secret_ref: Some(self.secret_ref(&secrets.client)),
        }
    }

    fn peer_tls(&self, existing: Option<&druid::Etcd>) -> TlsConfig {
        let secrets = &self.values.secret_names;
        let mut tls = TlsConfig {
            tls_ca_secret_ref: self.ca_ref(&secrets.peer_ca),
            server_tls_secret_ref: self.secret_ref(&secrets.peer_server),
            client_tls_secret_ref: None,
        };
        // The new peer CA is rolled out separately while a rotation is being
        // prepared.
        if self.values.ca_rotation_phase == CA_ROTATION_PHASE_PREPARING {
            if let Some(current) = existing.and_then(|e| e.spec.etcd.peer_url_tls.as_ref()) {
                if !current.tls_ca_secret_ref.name.is_empty() {
                    tls.tls_ca_secret_ref = current.tls_ca_secret_ref.clone();
                }
            }
        }
        tls
    }

    fn client_service(&self) -> ClientService {
        let mut annotations = string_map([
            (
                "networking.resources.gardener.cloud/from-all-scrape-targets-allowed-ports",
                r#"[{"protocol":"TCP","port":2379},{"protocol":"TCP","port":8080}]"#,
            ),
            (
                "networking.resources.gardener.cloud/namespace-selectors",
                r#"[{"matchLabels":{"kubernetes.io/metadata.name":"garden"}}]"#,
            ),
            (
                "networking.resources.gardener.cloud/pod-label-selector-namespace-alias",
                "all-shoots",
            ),
        ]);
        let mut labels = BTreeMap::new();
        if self.values.topology_aware_routing_enabled {
            annotations.insert(
                "service.kubernetes.io/topology-aware-hints".to_string(),
                "auto".to_string(),
            );
            labels.insert(
                "endpoint-slice-hints.resources.gardener.cloud/consider".to_string(),
                "true".to_string(),
            );
        }
        ClientService {
            annotations,
            labels,
        }
    }

    fn backup_store(&self, backup: &BackupConfig) -> StoreSpec {
        StoreSpec {
            container: Some(backup.container.clone()),
            prefix: format!("{}/etcd-{}", backup.prefix, self.values.role),
            provider: Some(backup.provider.clone()),
            secret_ref: Some(SecretReference {
                name: backup.secret_ref_name.clone(),
                namespace: None,
                data_key: None,
            }),
        }
    }

    fn desired_etcd(
        &self,
        existing: Option<&druid::Etcd>,
        existing_sts: Option<&StatefulSet>,
        replicas: i32,
        timestamp: &str,
    ) -> druid::Etcd {
        let name = self.name();
        let existing_spec = existing.map(|e| &e.spec);

        let mut annotations = existing
            .and_then(|e| e.metadata.annotations.clone())
            .unwrap_or_default();
        annotations.insert(
            GARDENER_OPERATION.to_string(),
            GARDENER_OPERATION_RECONCILE.to_string(),
        );
        annotations.insert(GARDENER_TIMESTAMP.to_string(), timestamp.to_string());

        let mut spec_labels = merge_string_maps([
            &self.selector_labels(),
            &string_map([
                ("networking.gardener.cloud/to-dns", "allowed"),
                ("networking.gardener.cloud/to-public-networks", "allowed"),
                ("networking.gardener.cloud/to-private-networks", "allowed"),
                ("networking.gardener.cloud/to-runtime-apiserver", "allowed"),
            ]),
        ]);

        let defragmentation_schedule = existing_spec
            .and_then(|s| s.etcd.defragmentation_schedule.clone())
            .or_else(|| self.values.defragmentation_schedule.clone());

        let (resources_etcd, resources_backup) = self.container_resources(existing_sts);

        let mut etcd = EtcdConfig {
            quota: Some(Quantity("8Gi".to_string())),
            metrics: Some("basic".to_string()),
            resources: Some(resources_etcd),
            client_url_tls: Some(self.client_tls()),
            peer_url_tls: None,
            server_port: Some(PORT_ETCD_SERVER),
            client_port: Some(PORT_ETCD_CLIENT),
            defragmentation_schedule,
            client_service: Some(self.client_service()),
        };

        if self.values.high_availability_enabled {
            for port in [PORT_ETCD_CLIENT, PORT_ETCD_SERVER, PORT_BACKUP_RESTORE] {
                spec_labels.insert(
                    format!("networking.resources.gardener.cloud/to-{name}-client-tcp-{port}"),
                    "allowed".to_string(),
                );
            }
            etcd.peer_url_tls = Some(self.peer_tls(existing));
        }

        let mut backup = BackupSpec {
            port: Some(PORT_BACKUP_RESTORE),
            tls: Some(self.client_tls()),
            resources: Some(resources_backup),
            garbage_collection_policy: Some("Exponential".to_string()),
            garbage_collection_period: Some(go_duration_string(Duration::from_secs(12 * 3600))),
            snapshot_compression: Some(CompressionSpec {
                enabled: Some(true),
                policy: Some("gzip".to_string()),
            }),
            ..Default::default()
        };
        if let Some(config) = &self.backup {
            backup.store = Some(self.backup_store(config));
            backup.full_snapshot_schedule = existing_spec
                .and_then(|s| s.backup.full_snapshot_schedule.clone())
                .or_else(|| Some(config.full_snapshot_schedule.clone()));
            backup.delta_snapshot_period = Some(go_duration_string(Duration::from_secs(300)));
            backup.delta_snapshot_retention_period = config
                .delta_snapshot_retention_period
                .map(go_duration_string);
            backup.delta_snapshot_memory_limit = Some(Quantity("100Mi".to_string()));
            backup.leader_election = config.leader_election.as_ref().map(|le| LeaderElectionSpec {
                etcd_connection_timeout: le.etcd_connection_timeout.map(go_duration_string),
                reelection_period: le.reelection_period.map(go_duration_string),
            });
        }

        let mut spec = EtcdSpec {
            selector: Some(LabelSelector {
                match_labels: Some(self.selector_labels()),
                ..Default::default()
            }),
            labels: spec_labels,
            annotations: BTreeMap::new(),
            etcd,
            backup,
            replicas,
            priority_class_name: Some(self.values.priority_class_name.clone()),
            storage_class: self.values.storage_class_name.clone(),
            storage_capacity: Some(Quantity(self.values.storage_capacity.clone())),
            volume_claim_template: Some(name.clone()),
        };

        if self.values.class == Class::Important {
            spec.annotations = string_map([("cluster-autoscaler.kubernetes.io/safe-to-evict", "false")]);
            spec.etcd.metrics = Some("extensive".to_string());
            spec.volume_claim_template = Some(format!("{}-etcd", self.values.role));
        }

        druid::Etcd {
            metadata: ObjectMeta {
                name: Some(name),
                namespace: Some(self.namespace.clone()),
                annotations: Some(annotations),
                labels: Some(self.role_labels()),
                ..Default::default()
            },
            spec,
            status: None,
        }
    }

    /// Resource requirements of the etcd and backup-restore containers.
    ///
    /// With HVPA the requests of the running stateful set are kept (limits are
    /// dropped) so that the autoscaler's recommendations are not reverted.
    fn container_resources(
        &self,
        existing_sts: Option<&StatefulSet>,
    ) -> (ResourceRequirements, ResourceRequirements) {
        let requests = |cpu: &str, memory: &str| ResourceRequirements {
            requests: Some(BTreeMap::from([
                ("cpu".to_string(), Quantity(cpu.to_string())),
                ("memory".to_string(), Quantity(memory.to_string())),
            ])),
            ..Default::default()
        };
        let mut etcd = requests("300m", "1G");
        let mut backup = requests("23m", "128Mi");

        if !self.hvpa_enabled() {
            return (etcd, backup);
        }
        let containers = existing_sts
            .and_then(|sts| sts.spec.as_ref())
            .and_then(|spec| spec.template.spec.as_ref())
            .map(|pod| pod.containers.as_slice())
            .unwrap_or_default();
        for container in containers {
            let Some(existing) = container.resources.as_ref().and_then(|r| r.requests.clone()) else {
                continue;
            };
            let retained = ResourceRequirements {
                requests: Some(existing),
                ..Default::default()
            };
            match container.name.as_str() {
                CONTAINER_NAME_ETCD => etcd = retained,
                CONTAINER_NAME_BACKUP_RESTORE => backup = retained,
                _ => {}
            }
        }
        (etcd, backup)
    }

    fn desired_hvpa(&self, config: &HvpaConfig, replicas: i32) -> Hvpa {
        let name = self.name();
        let role = &self.values.role;
        let hpa_labels = string_map([(LABEL_ROLE, format!("etcd-hpa-{role}").as_str())]);
        let vpa_labels = string_map([(LABEL_ROLE, format!("etcd-vpa-{role}").as_str())]);
        let min_change = ScaleParams {
            cpu: ChangeParams::new("1", 80),
            memory: ChangeParams::new("2G", 80),
        };
        let min_allowed_memory = match self.values.class {
            Class::Normal => "200M",
            Class::Important => "700M",
        };

        Hvpa {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(self.selector_labels()),
                ..Default::default()
            },
            spec: HvpaSpec {
                replicas: Some(1),
                maintenance_time_window: Some(config.maintenance_time_window.clone()),
                hpa: HpaSpec {
                    selector: Some(LabelSelector {
                        match_labels: Some(hpa_labels.clone()),
                        ..Default::default()
                    }),
                    deploy: false,
                    template: HpaTemplate {
                        metadata: ObjectMeta {
                            labels: Some(hpa_labels),
                            ..Default::default()
                        },
                        spec: HpaTemplateSpec {
                            min_replicas: Some(replicas),
                            max_replicas: replicas,
                            metrics: vec![
                                HpaMetric::resource("cpu", 80),
                                HpaMetric::resource("memory", 80),
                            ],
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
                        stabilization_duration: Some("5m".to_string()),
                        min_change: min_change.clone(),
                    },
                    scale_down: ScaleType {
                        update_policy: UpdatePolicy {
                            update_mode: Some(
                                config
                                    .scale_down_update_mode
                                    .clone()
                                    .unwrap_or_else(|| UPDATE_MODE_AUTO.to_string()),
                            ),
                        },
                        stabilization_duration: Some("15m".to_string()),
                        min_change,
                    },
                    limits_requests_gap_scale_params: ScaleParams {
                        cpu: ChangeParams::new("2", 40),
                        memory: ChangeParams::new("5G", 40),
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
                                        container_name: CONTAINER_NAME_ETCD.to_string(),
                                        controlled_values: Some(
                                            CONTROLLED_VALUES_REQUESTS_ONLY.to_string(),
                                        ),
                                        min_allowed: BTreeMap::from([(
                                            "memory".to_string(),
                                            Quantity(min_allowed_memory.to_string()),
                                        )]),
                                        max_allowed: BTreeMap::from([
                                            ("cpu".to_string(), Quantity("4".to_string())),
                                            ("memory".to_string(), Quantity("28G".to_string())),
                                        ]),
                                        mode: None,
                                    },
                                    ContainerResourcePolicy {
                                        container_name: CONTAINER_NAME_BACKUP_RESTORE.to_string(),
                                        controlled_values: Some(
                                            CONTROLLED_VALUES_REQUESTS_ONLY.to_string(),
                                        ),
                                        mode: Some(CONTAINER_SCALING_MODE_OFF.to_string()),
                                        ..Default::default()
                                    },
                                ],
                            }),
                        },
                    },
                },
                weight_based_scaling_intervals: vec![WeightBasedScalingInterval {
                    vpa_weight: VPA_ONLY,
                    start_replica_count: replicas,
                    last_replica_count: replicas,
                }],
                target_ref: Some(CrossVersionObjectReference {
                    api_version: Some("apps/v1".to_string()),
                    kind: "StatefulSet".to_string(),
                    name,
                }),
            },
        }
    }

    /// Scales the etcd to `replicas` and requests a reconciliation from
    /// etcd-druid.
    ///
    /// Refuses to act while a previously requested reconciliation has not been
    /// picked up yet.
    pub async fn scale(&self, replicas: i32) -> Result<()> {
        let name = self.name();
        let etcd: druid::Etcd = self.client.get(Some(&self.namespace), &name).await?;
        let annotations = etcd.metadata.annotations.clone().unwrap_or_default();

        let mut state = self.state.lock().await;
        if let Some(expected) = &state.timestamp {
            let actual = annotations.get(GARDENER_TIMESTAMP).cloned().unwrap_or_default();
            if &actual != expected {
                return Err(Error::Invalid(format!(
                    "object's {GARDENER_TIMESTAMP:?} annotation is not {expected:?} but {actual:?}"
                )));
            }
        }
        if annotations.contains_key(GARDENER_OPERATION) {
            return Err(Error::Invalid(
                "etcd object still has operation annotation set".to_string(),
            ));
        }

        let timestamp = format_timestamp((self.clock)());
        let mut patch = json!({
            "metadata": {
                "annotations": {
                    GARDENER_OPERATION: GARDENER_OPERATION_RECONCILE,
                    GARDENER_TIMESTAMP: timestamp,
                }
            }
        });
        if etcd.spec.replicas != replicas {
            patch["spec"] = json!({ "replicas": replicas });
        }
        self.client
            .patch_merge::<druid::Etcd>(Some(&self.namespace), &name, &patch)
            .await?;
        state.timestamp = Some(timestamp);
        state.replicas = Some(replicas);
        drop(state);

        info!(etcd = %name, replicas, "Scaled etcd");

        if self.hvpa_enabled() {
            let _: Hvpa = self.client.get(Some(&self.namespace), &name).await?;
            let patch = json!({
                "spec": {"hpa": {"template": {"spec": {
                    "maxReplicas": replicas,
                    "minReplicas": replicas,
                }}}}
            });
            self.client
                .patch_merge::<Hvpa>(Some(&self.namespace), &name, &patch)
                .await?;
        }
        Ok(())
    }
}

/// Returns an error message if the etcd is not ready.
pub fn check_etcd(etcd: &druid::Etcd) -> std::result::Result<(), String> {
    let status = etcd.status.clone().unwrap_or_default();
    if let Some(err) = status.last_error {
        return Err(format!("last error: {err}"));
    }
    let generation = etcd.metadata.generation.unwrap_or_default();
    match status.observed_generation {
        None => return Err("etcd has not yet been observed by etcd-druid".to_string()),
        Some(observed) if observed < generation => {
            return Err(format!("observed generation outdated ({observed}/{generation})"))
        }
        _ => {}
    }
    if let Some(op) = etcd
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(GARDENER_OPERATION))
    {
        return Err(format!("gardener operation {op:?} is not yet picked up by etcd-druid"));
    }
    if status.ready != Some(true) {
        return Err("etcd is not ready yet".to_string());
    }
    Ok(())
}

#[async_trait]
impl<C: ClusterClient> Deployer for Etcd<C> {
    async fn deploy(&self) -> Result<()> {
        let name = self.name();
        let namespace = self.namespace.as_str();

        let existing: Option<druid::Etcd> =
            client::get_opt(&self.client, Some(namespace), &name).await?;
        let sts_name = existing
            .as_ref()
            .and_then(|e| e.status.as_ref())
            .and_then(|s| s.etcd.as_ref())
            .map(|r| r.name.clone())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| name.clone());
        let existing_sts: Option<StatefulSet> =
            client::get_opt(&self.client, Some(namespace), &sts_name).await?;

        let mut state = self.state.lock().await;
        let replicas = state
            .replicas
            .or_else(|| existing.as_ref().map(|e| e.spec.replicas))
            .unwrap_or_default();

        let timestamp = format_timestamp((self.clock)());
        let desired =
            self.desired_etcd(existing.as_ref(), existing_sts.as_ref(), replicas, &timestamp);
        self.client.apply(&desired).await?;
        state.replicas = Some(replicas);
        state.timestamp = Some(timestamp);
        drop(state);
        debug!(etcd = %name, replicas, "Applied etcd");

        match &self.hvpa {
            Some(config) if config.enabled => {
                self.client.apply(&self.desired_hvpa(config, replicas)).await?;
            }
            _ => {
                client::delete_ignore_not_found::<Hvpa, _>(&self.client, Some(namespace), &name)
                    .await?;
            }
        }
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        let name = self.name();
        let namespace = self.namespace.as_str();

        let confirmation = json!({
            "metadata": {
                "annotations": {
                    CONFIRMATION_DELETION: "true",
                    GARDENER_TIMESTAMP: format_timestamp((self.clock)()),
                }
            }
        });
        match self
            .client
            .patch_merge::<druid::Etcd>(Some(namespace), &name, &confirmation)
            .await
        {
            Err(err) if err.is_not_found() => {}
            other => {
                other?;
            }
        }

        client::delete_ignore_not_found::<Hvpa, _>(&self.client, Some(namespace), &name).await?;
        client::delete_ignore_not_found::<druid::Etcd, _>(&self.client, Some(namespace), &name)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl<C: ClusterClient> Waiter for Etcd<C> {
    async fn wait(&self) -> Result<()> {
        let name = self.name();
        let namespace = self.namespace.as_str();
        let client = &self.client;
        let name_ref = name.as_str();

        self.wait_ops
            .until(|| async move {
                match client.get::<druid::Etcd>(Some(namespace), name_ref).await {
                    Err(err) => Outcome::Minor(err.to_string()),
                    Ok(etcd) => match check_etcd(&etcd) {
                        Ok(()) => Outcome::Done,
                        Err(reason) => Outcome::Minor(format!(
                            "etcd {namespace}/{name_ref} is not healthy: {reason}"
                        )),
                    },
                }
            })
            .await?;
        Ok(())
    }

    async fn wait_cleanup(&self) -> Result<()> {
        let name = self.name();
        let namespace = self.namespace.as_str();
        let client = &self.client;
        let name_ref = name.as_str();

        self.wait_ops
            .until(|| async move {
                match client.get::<druid::Etcd>(Some(namespace), name_ref).await {
                    Err(err) if err.is_not_found() => Outcome::Done,
                    Err(err) => Outcome::Minor(err.to_string()),
                    Ok(_) => Outcome::Minor(format!("etcd {namespace}/{name_ref} still exists")),
                }
            })
            .await?;
        Ok(())
    }
}
