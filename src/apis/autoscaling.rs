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

//! `autoscaling.k8s.io` types: HVPA (`v1alpha1`) and VPA (`v1`).

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::CustomResource;
use serde::{Deserialize, Serialize};

use super::druid::CrossVersionObjectReference;

/// Update mode applying recommendations automatically.
pub const UPDATE_MODE_AUTO: &str = "Auto";
/// Update mode applying recommendations only during the maintenance window.
pub const UPDATE_MODE_MAINTENANCE_WINDOW: &str = "MaintenanceWindow";
/// Update mode never applying recommendations.
pub const UPDATE_MODE_OFF: &str = "Off";

/// Container scaling mode disabling recommendations.
pub const CONTAINER_SCALING_MODE_OFF: &str = "Off";
/// Only requests are controlled, limits are left untouched.
pub const CONTROLLED_VALUES_REQUESTS_ONLY: &str = "RequestsOnly";

/// Weight for intervals where only the VPA acts.
pub const VPA_ONLY: i32 = 100;

/// Horizontal and vertical pod autoscaler combined.
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "autoscaling.k8s.io",
    version = "v1alpha1",
    kind = "Hvpa",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct HvpaSpec {
    /// Replicas of the target when no HPA is deployed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// Window in which the VPA may scale down.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintenance_time_window: Option<super::core::MaintenanceTimeWindow>,
    /// HPA settings.
    pub hpa: HpaSpec,
    /// VPA settings.
    pub vpa: VpaSpec,
    /// Weights of HPA and VPA per replica range.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub weight_based_scaling_intervals: Vec<WeightBasedScalingInterval>,
    /// Scaled workload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_ref: Option<CrossVersionObjectReference>,
}

/// HPA part of an HVPA.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HpaSpec {
    /// Selects the generated HPA.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
    /// Deploys the HPA when true.
    #[serde(default)]
    pub deploy: bool,
    /// Template of the generated HPA.
    pub template: HpaTemplate,
}

/// Template of the generated HPA.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HpaTemplate {
    /// Metadata of the HPA.
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Spec of the HPA.
    pub spec: HpaTemplateSpec,
}

/// Spec of the generated HPA.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HpaTemplateSpec {
    /// Lower replica bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<i32>,
    /// Upper replica bound.
    pub max_replicas: i32,
    /// Scaling metrics.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metrics: Vec<HpaMetric>,
}

/// Resource utilization metric of the HVPA's HPA.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HpaMetric {
    /// Metric type, `Resource` for utilization metrics.
    #[serde(rename = "type")]
    pub type_: String,
    /// Resource metric source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceMetricSource>,
}

impl HpaMetric {
    /// A `Resource` metric targeting the given average utilization.
    pub fn resource(name: &str, target_average_utilization: i32) -> Self {
        Self {
            type_: "Resource".to_string(),
            resource: Some(ResourceMetricSource {
                name: name.to_string(),
                target_average_utilization: Some(target_average_utilization),
            }),
        }
    }
}

/// Resource metric source of an HPA.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMetricSource {
    /// Resource name, `cpu` or `memory`.
    pub name: String,
    /// Target utilization in percent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_average_utilization: Option<i32>,
}

/// VPA part of an HVPA.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VpaSpec {
    /// Selects the generated VPA.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
    /// Deploys the VPA when true.
    #[serde(default)]
    pub deploy: bool,
    /// Scale up behaviour.
    pub scale_up: ScaleType,
    /// Scale down behaviour.
    pub scale_down: ScaleType,
    /// Minimum gap between limits and requests that triggers scaling.
    pub limits_requests_gap_scale_params: ScaleParams,
    /// Template of the generated VPA.
    pub template: VpaTemplate,
}

/// Scaling behaviour in one direction.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleType {
    /// When recommendations are applied.
    pub update_policy: UpdatePolicy,
    /// How long a recommendation must hold before it is applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stabilization_duration: Option<String>,
    /// Minimum change that triggers scaling.
    pub min_change: ScaleParams,
}

/// Update policy of a VPA.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePolicy {
    /// One of the `UPDATE_MODE_*` constants.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_mode: Option<String>,
}

/// Change thresholds per resource.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleParams {
    /// CPU threshold.
    pub cpu: ChangeParams,
    /// Memory threshold.
    pub memory: ChangeParams,
}

/// Change threshold given as an absolute value and a percentage.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeParams {
    /// Absolute change, e.g. `100m`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Relative change in percent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentage: Option<i32>,
}

impl ChangeParams {
    /// Creates change parameters from an absolute value and a percentage.
    pub fn new(value: &str, percentage: i32) -> Self {
        Self {
            value: Some(value.to_string()),
            percentage: Some(percentage),
        }
    }
}

/// Template of the generated VPA.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VpaTemplate {
    /// Metadata of the VPA.
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Spec of the VPA.
    pub spec: VpaTemplateSpec,
}

/// Spec of the generated VPA.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VpaTemplateSpec {
    /// Per-container resource policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_policy: Option<PodResourcePolicy>,
}

/// Weight of the VPA within a replica range.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightBasedScalingInterval {
    /// VPA weight in percent. The HPA gets the rest.
    pub vpa_weight: i32,
    /// First replica count of the range.
    pub start_replica_count: i32,
    /// Last replica count of the range.
    pub last_replica_count: i32,
}

/// Vertical pod autoscaler.
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "autoscaling.k8s.io",
    version = "v1",
    kind = "VerticalPodAutoscaler",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct VerticalPodAutoscalerSpec {
    /// Per-container resource policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_policy: Option<PodResourcePolicy>,
    /// Scaled workload.
    pub target_ref: CrossVersionObjectReference,
    /// When recommendations are applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_policy: Option<UpdatePolicy>,
}

/// Resource policy of a VPA.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodResourcePolicy {
    /// Policies per container.
    #[serde(default)]
    pub container_policies: Vec<ContainerResourcePolicy>,
}

/// Resource policy of one container.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerResourcePolicy {
    /// Container name, `*` for all containers.
    pub container_name: String,
    /// One of the `CONTROLLED_VALUES_*` constants.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controlled_values: Option<String>,
    /// Upper bounds of recommendations.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub max_allowed: BTreeMap<String, Quantity>,
    /// Lower bounds of recommendations.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub min_allowed: BTreeMap<String, Quantity>,
    /// `Auto` or `Off`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}
