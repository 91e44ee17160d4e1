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

//! `core.gardener.cloud/v1beta1` types.

use std::collections::BTreeMap;

use kube::CustomResource;
use serde::{Deserialize, Serialize};

/// API group of the core resources.
pub const GROUP: &str = "core.gardener.cloud";

/// Desired state of a shoot cluster.
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "core.gardener.cloud",
    version = "v1beta1",
    kind = "Shoot",
    namespaced,
    status = "ShootStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ShootSpec {
    /// Name of the cloud profile the shoot's machine types and images come from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_profile_name: Option<String>,
    /// Control plane settings such as high availability.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane: Option<ControlPlane>,
    /// DNS settings of the shoot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<Dns>,
    /// Hibernation settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hibernation: Option<Hibernation>,
    /// Kubernetes version and component configuration.
    pub kubernetes: Kubernetes,
    /// Maintenance settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintenance: Option<Maintenance>,
    /// Networking settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub networking: Option<Networking>,
    /// Infrastructure provider and worker pools.
    pub provider: Provider,
    /// Purpose of the shoot, e.g. `evaluation` or `production`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    /// Region of the infrastructure.
    pub region: String,
    /// Name of the secret binding holding the infrastructure credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_binding_name: Option<String>,
    /// Seed the control plane should run on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed_name: Option<String>,
}

/// Control plane settings of a shoot.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlane {
    /// Set when the control plane runs highly available.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high_availability: Option<HighAvailability>,
}

/// High availability settings.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HighAvailability {
    /// Failures the control plane tolerates.
    pub failure_tolerance: FailureTolerance,
}

/// Failure tolerance of a highly available control plane.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureTolerance {
    /// `node` or `zone`.
    #[serde(rename = "type")]
    pub type_: String,
}

/// DNS settings.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dns {
    /// Shoot domain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

/// Hibernation settings.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hibernation {
    /// Hibernates the shoot when true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

/// Kubernetes settings of a shoot.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Kubernetes {
    /// kube-apiserver configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_api_server: Option<KubeApiServerConfig>,
    /// Kubernetes version, e.g. `1.32.1`.
    pub version: String,
}

/// Configuration of the shoot's kube-apiserver.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeApiServerConfig {
    /// Admission plugins enabled on top of the defaults.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub admission_plugins: Vec<AdmissionPlugin>,
    /// Audiences accepted in service account tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_audiences: Option<Vec<String>>,
    /// Audit log configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_config: Option<AuditConfig>,
    /// Allows anonymous requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_anonymous_authentication: Option<bool>,
    /// Duration string, e.g. `1h`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_ttl: Option<String>,
    /// Feature gates passed to the kube-apiserver.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub feature_gates: BTreeMap<String, bool>,
    /// Inflight request limits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<KubeApiServerRequests>,
    /// API groups and versions switched on or off.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub runtime_config: BTreeMap<String, bool>,
    /// Service account token settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_config: Option<ServiceAccountConfig>,
}

/// An admission plugin of the kube-apiserver.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionPlugin {
    /// Plugin name.
    pub name: String,
    /// Plugin configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
    /// Disables a default plugin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled: Option<bool>,
}

impl AdmissionPlugin {
    /// Creates an enabled plugin without configuration.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Audit settings of the kube-apiserver.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditConfig {
    /// Audit policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_policy: Option<AuditPolicy>,
}

/// Audit policy reference.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditPolicy {
    /// ConfigMap holding the policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map_ref: Option<NameRef>,
}

/// Reference to an object in the same namespace.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NameRef {
    /// Name of the object.
    pub name: String,
}

/// Inflight request limits of the kube-apiserver.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeApiServerRequests {
    /// Maximum number of non-mutating requests in flight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_non_mutating_inflight: Option<i32>,
    /// Maximum number of mutating requests in flight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_mutating_inflight: Option<i32>,
}

/// Service account token settings.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccountConfig {
    /// Additional token issuers accepted by the kube-apiserver.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub accepted_issuers: Vec<String>,
    /// Extends the expiration of projected tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extend_token_expiration: Option<bool>,
    /// Token issuer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    /// Maximum validity of issued tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_token_expiration: Option<String>,
    /// Secret holding the signing key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signing_key_secret_name: Option<NameRef>,
}

/// Maintenance settings.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Maintenance {
    /// Daily time window for maintenance operations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_window: Option<MaintenanceTimeWindow>,
}

/// Daily maintenance time window, in `HHMMSS+ZONE` form.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceTimeWindow {
    /// Start of the window.
    pub begin: String,
    /// End of the window.
    pub end: String,
}

/// Networking settings of a shoot.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Networking {
    /// Network plugin type.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    /// Node CIDR.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<String>,
    /// Pod CIDR.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pods: Option<String>,
    /// Service CIDR.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<String>,
}

/// Infrastructure provider of a shoot.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provider {
    /// Provider type, e.g. `aws`.
    #[serde(rename = "type")]
    pub type_: String,
    /// Worker pools. Empty for a workerless shoot.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workers: Vec<Worker>,
}

/// A worker pool.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Worker {
    /// Pool name.
    pub name: String,
    /// Machine settings.
    pub machine: Machine,
    /// Minimum number of nodes.
    pub minimum: i32,
    /// Maximum number of nodes.
    pub maximum: i32,
}

/// Machine settings of a worker pool.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Machine {
    /// Machine type.
    #[serde(rename = "type")]
    pub type_: String,
}

/// Observed state of a shoot cluster.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShootStatus {
    /// Identity of the shoot across garden installations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_identity: Option<String>,
    /// Status conditions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// True once the shoot is hibernated.
    #[serde(default)]
    pub hibernated: bool,
    /// Last operation run on the shoot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_operation: Option<LastOperation>,
    /// Generation observed by the last reconcile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// Seed currently hosting the control plane.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed_name: Option<String>,
    /// Namespace of the control plane on the seed.
    #[serde(rename = "technicalID", default, skip_serializing_if = "Option::is_none")]
    pub technical_id: Option<String>,
}

/// Status of the last operation on an object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastOperation {
    /// Human readable progress.
    pub description: String,
    /// RFC 3339 timestamp of the last update.
    pub last_update_time: String,
    /// Progress in percent.
    pub progress: i32,
    /// `Processing`, `Succeeded`, `Error`, ...
    pub state: String,
    /// `Create`, `Reconcile`, `Delete`, `Migrate`, `Restore`.
    #[serde(rename = "type")]
    pub type_: String,
}

/// Types of [`LastOperation`]s.
pub mod operation {
    /// Initial creation.
    pub const CREATE: &str = "Create";
    /// Regular reconciliation.
    pub const RECONCILE: &str = "Reconcile";
    /// Deletion.
    pub const DELETE: &str = "Delete";
    /// Control plane migration away from a seed.
    pub const MIGRATE: &str = "Migrate";
    /// Control plane restoration on a new seed.
    pub const RESTORE: &str = "Restore";

    /// The operation is running.
    pub const STATE_PROCESSING: &str = "Processing";
    /// The operation finished.
    pub const STATE_SUCCEEDED: &str = "Succeeded";
    /// The operation failed.
    pub const STATE_ERROR: &str = "Error";
}

/// A status condition.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type.
    #[serde(rename = "type")]
    pub type_: String,
    /// `True`, `False` or `Unknown`.
    pub status: String,
    /// Time the status last changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
    /// Time the condition was last updated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<String>,
    /// Machine readable reason of the last change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Human readable message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Condition {
    /// Creates a condition with the given type and status.
    pub fn new(type_: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            type_: type_.into(),
            status: status.into(),
            ..Default::default()
        }
    }
}

/// Returns the condition of the given type, if present.
pub fn get_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// A project groups shoots of one team and owns a namespace.
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "core.gardener.cloud",
    version = "v1beta1",
    kind = "Project",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSpec {
    /// Project description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Namespace of the project in the garden cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Purpose of the project.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
}

/// Persisted state of a shoot's control plane, used for migration.
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "core.gardener.cloud",
    version = "v1beta1",
    kind = "ShootState",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ShootStateSpec {
    /// Data persisted by gardener components.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gardener: Vec<GardenerResourceData>,
}

/// A piece of persisted data.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GardenerResourceData {
    /// Name of the data.
    pub name: String,
    /// Type of the data, e.g. `secret`.
    #[serde(rename = "type")]
    pub type_: String,
    /// Opaque data.
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Shoot {
    /// `namespace/name` of the shoot.
    pub fn key(&self) -> String {
        format!(
            "{}/{}",
            self.metadata.namespace.as_deref().unwrap_or_default(),
            self.metadata.name.as_deref().unwrap_or_default()
        )
    }

    /// Last operation from the status, if any.
    pub fn last_operation(&self) -> Option<&LastOperation> {
        self.status.as_ref()?.last_operation.as_ref()
    }

    /// Seed currently hosting the control plane.
    pub fn status_seed_name(&self) -> Option<&str> {
        self.status.as_ref()?.seed_name.as_deref()
    }

    /// Returns true if the status reports the shoot as hibernated.
    pub fn is_hibernated(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.hibernated)
    }

    /// Returns true if hibernation is enabled in the spec.
    pub fn hibernation_enabled(&self) -> bool {
        self.spec
            .hibernation
            .as_ref()
            .and_then(|h| h.enabled)
            .unwrap_or(false)
    }

    /// Returns true if the shoot has no worker pools.
    pub fn is_workerless(&self) -> bool {
        self.spec.provider.workers.is_empty()
    }

    /// Sum of the minimum sizes of all worker pools.
    pub fn min_node_count(&self) -> i32 {
        self.spec.provider.workers.iter().map(|w| w.minimum).sum()
    }

    /// Sum of the maximum sizes of all worker pools.
    pub fn max_node_count(&self) -> i32 {
        self.spec.provider.workers.iter().map(|w| w.maximum).sum()
    }

    /// Returns the shoot's purpose, defaulting to `evaluation`.
    pub fn purpose(&self) -> &str {
        self.spec.purpose.as_deref().unwrap_or("evaluation")
    }

    /// Name of the namespace hosting the control plane in the seed.
    ///
    /// Uses the technical ID when already assigned, otherwise computes it from
    /// project namespace and shoot name.
    pub fn technical_id(&self) -> String {
        if let Some(id) = self.status.as_ref().and_then(|s| s.technical_id.clone()) {
            return id;
        }
        let namespace = self.metadata.namespace.as_deref().unwrap_or_default();
        let project = namespace.strip_prefix("garden-").unwrap_or(namespace);
        let name = self.metadata.name.as_deref().unwrap_or_default();
        format!("shoot--{project}--{name}")
    }
}
