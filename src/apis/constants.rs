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

//! Well-known names, labels and annotations.

/// Annotation confirming that an object may be deleted.
pub const CONFIRMATION_DELETION: &str = "confirmation.gardener.cloud/deletion";
/// Deprecated variant of [`CONFIRMATION_DELETION`].
pub const CONFIRMATION_DELETION_DEPRECATED: &str = "confirmation.garden.sapcloud.io/deletion";

/// Annotation requesting an operation from the responsible controller.
pub const GARDENER_OPERATION: &str = "gardener.cloud/operation";
/// Value of [`GARDENER_OPERATION`] requesting a reconciliation.
pub const GARDENER_OPERATION_RECONCILE: &str = "reconcile";
/// Value of [`GARDENER_OPERATION`] requesting a migration.
pub const GARDENER_OPERATION_MIGRATE: &str = "migrate";
/// Value of [`GARDENER_OPERATION`] requesting a restoration.
pub const GARDENER_OPERATION_RESTORE: &str = "restore";
/// Annotation carrying the time an operation was requested.
pub const GARDENER_TIMESTAMP: &str = "gardener.cloud/timestamp";

/// Label key describing the role of an object.
pub const GARDEN_ROLE: &str = "gardener.cloud/role";
/// Role of control plane components.
pub const GARDEN_ROLE_CONTROL_PLANE: &str = "controlplane";
/// Role of shoot namespaces in the seed.
pub const GARDEN_ROLE_SHOOT: &str = "shoot";
/// Role of monitoring components.
pub const GARDEN_ROLE_MONITORING: &str = "monitoring";

/// Label key for the origin of managed resources.
pub const LABEL_ORIGIN: &str = "origin";
/// Origin value used for resources managed by gardener.
pub const ORIGIN_GARDENER: &str = "gardener";
/// Label key for the role of a component.
pub const LABEL_ROLE: &str = "role";
/// Label key for the app of a component.
pub const LABEL_APP: &str = "app";

/// Label injected into objects of shoot managed resources.
pub const SHOOT_NO_CLEANUP: &str = "shoot.gardener.cloud/no-cleanup";
/// Label marking secrets referenced by managed resources as garbage-collectable.
pub const GARBAGE_COLLECTABLE_REFERENCE: &str =
    "resources.gardener.cloud/garbage-collectable-reference";

/// Name of the cluster identity config map and its data key.
pub const CLUSTER_IDENTITY: &str = "cluster-identity";
/// The `kube-system` namespace.
pub const NAMESPACE_SYSTEM: &str = "kube-system";

/// Finalizer added by the gardenlet to shoots.
pub const GARDENER_FINALIZER: &str = "gardener";

/// Name of the kube-apiserver deployment.
pub const DEPLOYMENT_NAME_KUBE_APISERVER: &str = "kube-apiserver";
/// Name of the cluster CA secret.
pub const SECRET_NAME_CA_CLUSTER: &str = "ca";
/// Name of the front proxy CA secret.
pub const SECRET_NAME_CA_FRONT_PROXY: &str = "ca-front-proxy";

/// Audience always accepted by shoot API servers.
pub const GARDENER_AUDIENCE: &str = "gardener";

/// Annotation disabling the scale-down of the control plane.
pub const SHOOT_ALPHA_CONTROL_PLANE_SCALE_DOWN_DISABLED: &str =
    "alpha.control-plane.scaling.shoot.gardener.cloud/scale-down-disabled";
/// Annotation selecting the kube-apiserver scaling class.
pub const SHOOT_ALPHA_SCALING_APISERVER_CLASS: &str =
    "alpha.kube-apiserver.scaling.shoot.gardener.cloud/class";

/// Shoot purpose for production clusters.
pub const SHOOT_PURPOSE_PRODUCTION: &str = "production";

/// Condition types of managed resources.
pub const RESOURCES_APPLIED: &str = "ResourcesApplied";
/// See [`RESOURCES_APPLIED`].
pub const RESOURCES_HEALTHY: &str = "ResourcesHealthy";

/// Status value of a satisfied condition.
pub const CONDITION_TRUE: &str = "True";
/// Status value of an unsatisfied condition.
pub const CONDITION_FALSE: &str = "False";
