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

//! The node-exporter daemon set running on every shoot worker node.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec, DaemonSetUpdateStrategy};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, HTTPGetAction, HostPathVolumeSource, PodSecurityContext, PodSpec,
    PodTemplateSpec, Probe, ResourceRequirements, SeccompProfile, Service, ServiceAccount,
    ServicePort, ServiceSpec, Toleration, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;

use super::managedresources::{self, Registry};
use super::{Deployer, Result, Waiter};
use crate::apis::autoscaling::{
    ContainerResourcePolicy, PodResourcePolicy, UpdatePolicy, VerticalPodAutoscaler,
    VerticalPodAutoscalerSpec, CONTROLLED_VALUES_REQUESTS_ONLY, UPDATE_MODE_AUTO,
};
use crate::apis::constants::{
    GARDEN_ROLE, GARDEN_ROLE_MONITORING, LABEL_ORIGIN, NAMESPACE_SYSTEM, ORIGIN_GARDENER,
};
use crate::apis::druid::CrossVersionObjectReference;
use crate::client::ClusterClient;
use crate::utils::retry::RetryOps;
use crate::utils::string_map;

/// Name of the managed resource containing the node-exporter objects.
pub const MANAGED_RESOURCE_NAME: &str = "shoot-core-node-exporter";

const NAME: &str = "node-exporter";
const LABEL_KEY_COMPONENT: &str = "component";
const PORT: i32 = 16909;
const PORT_NAME_METRICS: &str = "metrics";

const VOLUME_NAME_HOST: &str = "host";
const VOLUME_MOUNT_PATH_HOST: &str = "/host";
const VOLUME_NAME_TEXTFILE: &str = "textfile";
const VOLUME_MOUNT_PATH_TEXTFILE: &str = "/textfile-collector";
const HOST_PATH_TEXTFILE: &str = "/var/lib/node-exporter/textfile-collector";

/// Configuration of the node-exporter.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Values {
    /// Container image.
    pub image: String,
    /// Deploys a `VerticalPodAutoscaler` for the daemon set.
    pub vpa_enabled: bool,
}

/// Deploys the node-exporter into the shoot via a managed resource.
pub struct NodeExporter<C> {
    client: C,
    namespace: String,
    values: Values,
    wait_ops: RetryOps,
}

impl<C: ClusterClient> NodeExporter<C> {
    /// `client` talks to the seed and `namespace` is the shoot's control plane
    /// namespace.
    pub fn new(client: C, namespace: impl Into<String>, values: Values) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            values,
            wait_ops: RetryOps::default(),
        }
    }

    /// Overrides the polling used by [`Waiter`].
    pub fn with_wait_ops(mut self, ops: RetryOps) -> Self {
        self.wait_ops = ops;
        self
    }

    fn computed_resources(&self) -> Result<Registry> {
        let mut registry = Registry::new();
        registry.add(&service_account())?;
        registry.add(&service())?;
        registry.add(&daemon_set(&self.values.image))?;
        if self.values.vpa_enabled {
            registry.add(&vertical_pod_autoscaler())?;
        }
        Ok(registry)
    }
}

fn labels() -> BTreeMap<String, String> {
    string_map([(LABEL_KEY_COMPONENT, NAME)])
}

fn meta() -> ObjectMeta {
    ObjectMeta {
        name: Some(NAME.to_string()),
        namespace: Some(NAMESPACE_SYSTEM.to_string()),
        labels: Some(labels()),
        ..Default::default()
    }
}

fn service_account() -> ServiceAccount {
    ServiceAccount {
        metadata: meta(),
        automount_service_account_token: Some(false),
        ..Default::default()
    }
}

fn service() -> Service {
    Service {
        metadata: meta(),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            cluster_ip: Some("None".to_string()),
            ports: Some(vec![ServicePort {
                name: Some(PORT_NAME_METRICS.to_string()),
                port: PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            selector: Some(labels()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn http_health_check() -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some("/".to_string()),
            port: IntOrString::Int(PORT),
            ..Default::default()
        }),
        initial_delay_seconds: Some(5),
        timeout_seconds: Some(5),
        ..Default::default()
    }
}

fn command() -> Vec<String> {
    [
        "/bin/node_exporter".to_string(),
        format!("--web.listen-address=:{PORT}"),
        format!("--path.procfs={VOLUME_MOUNT_PATH_HOST}/proc"),
        format!("--path.sysfs={VOLUME_MOUNT_PATH_HOST}/sys"),
        format!("--path.rootfs={VOLUME_MOUNT_PATH_HOST}"),
        "--log.level=error".to_string(),
        "--collector.disable-defaults".to_string(),
        "--collector.conntrack".to_string(),
        "--collector.cpu".to_string(),
        "--collector.diskstats".to_string(),
        "--collector.filefd".to_string(),
        "--collector.filesystem".to_string(),
        "--collector.filesystem.mount-points-exclude=^/(run|var)/.+$|^/(boot|dev|sys|usr)($|/.+$)"
            .to_string(),
        "--collector.loadavg".to_string(),
        "--collector.meminfo".to_string(),
        "--collector.uname".to_string(),
        "--collector.stat".to_string(),
        "--collector.pressure".to_string(),
        "--collector.textfile".to_string(),
        format!("--collector.textfile.directory={VOLUME_MOUNT_PATH_TEXTFILE}"),
    ]
    .into()
}

fn quantities<const N: usize>(pairs: [(&str, &str); N]) -> BTreeMap<String, Quantity> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), Quantity(v.to_string())))
        .collect()
}

fn host_path_volume(name: &str, path: &str) -> Volume {
    Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            type_: None,
        }),
        ..Default::default()
    }
}

fn daemon_set(image: &str) -> DaemonSet {
    let mut daemon_set_labels = labels();
    daemon_set_labels.insert(GARDEN_ROLE.to_string(), GARDEN_ROLE_MONITORING.to_string());
    daemon_set_labels.insert(LABEL_ORIGIN.to_string(), ORIGIN_GARDENER.to_string());

    let mut pod_labels = daemon_set_labels.clone();
    pod_labels.insert(
        "networking.gardener.cloud/from-seed".to_string(),
        "allowed".to_string(),
    );
    pod_labels.insert(
        "networking.gardener.cloud/to-public-networks".to_string(),
        "allowed".to_string(),
    );

    let container = Container {
        name: NAME.to_string(),
        image: Some(image.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(command()),
        ports: Some(vec![ContainerPort {
            name: Some("scrape".to_string()),
            container_port: PORT,
            host_port: Some(PORT),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        liveness_probe: Some(http_health_check()),
        readiness_probe: Some(http_health_check()),
        resources: Some(ResourceRequirements {
            limits: Some(quantities([("memory", "250Mi")])),
            requests: Some(quantities([("cpu", "50m"), ("memory", "50Mi")])),
            ..Default::default()
        }),
        volume_mounts: Some(vec![
            VolumeMount {
                name: VOLUME_NAME_HOST.to_string(),
                mount_path: VOLUME_MOUNT_PATH_HOST.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: VOLUME_NAME_TEXTFILE.to_string(),
                mount_path: VOLUME_MOUNT_PATH_TEXTFILE.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    DaemonSet {
        metadata: ObjectMeta {
            labels: Some(daemon_set_labels),
            ..meta()
        },
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(labels()),
                ..Default::default()
            },
            update_strategy: Some(DaemonSetUpdateStrategy {
                type_: Some("RollingUpdate".to_string()),
                ..Default::default()
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    automount_service_account_token: Some(false),
                    containers: vec![container],
                    host_network: Some(true),
                    host_pid: Some(true),
                    priority_class_name: Some("system-cluster-critical".to_string()),
                    security_context: Some(PodSecurityContext {
                        run_as_non_root: Some(true),
                        run_as_user: Some(65534),
                        seccomp_profile: Some(SeccompProfile {
                            type_: "RuntimeDefault".to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    service_account_name: Some(NAME.to_string()),
                    tolerations: Some(vec![
                        Toleration {
                            effect: Some("NoSchedule".to_string()),
                            operator: Some("Exists".to_string()),
                            ..Default::default()
                        },
                        Toleration {
                            effect: Some("NoExecute".to_string()),
                            operator: Some("Exists".to_string()),
                            ..Default::default()
                        },
                    ]),
                    volumes: Some(vec![
                        host_path_volume(VOLUME_NAME_HOST, "/"),
                        host_path_volume(VOLUME_NAME_TEXTFILE, HOST_PATH_TEXTFILE),
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn vertical_pod_autoscaler() -> VerticalPodAutoscaler {
    VerticalPodAutoscaler {
        metadata: ObjectMeta {
            name: Some(NAME.to_string()),
            namespace: Some(NAMESPACE_SYSTEM.to_string()),
            ..Default::default()
        },
        spec: VerticalPodAutoscalerSpec {
            target_ref: CrossVersionObjectReference {
                api_version: Some("apps/v1".to_string()),
                kind: "DaemonSet".to_string(),
                name: NAME.to_string(),
            },
            update_policy: Some(UpdatePolicy {
                update_mode: Some(UPDATE_MODE_AUTO.to_string()),
            }),
            resource_policy: Some(PodResourcePolicy {
                container_policies: vec![ContainerResourcePolicy {
                    container_name: "*".to_string(),
                    controlled_values: Some(CONTROLLED_VALUES_REQUESTS_ONLY.to_string()),
                    min_allowed: quantities([("memory", "50Mi")]),
                    ..Default::default()
                }],
            }),
        },
    }
}

#[async_trait]
impl<C: ClusterClient> Deployer for NodeExporter<C> {
    async fn deploy(&self) -> Result<()> {
        let registry = self.computed_resources()?;
        managedresources::create_for_shoot(
            &self.client,
            &self.namespace,
            MANAGED_RESOURCE_NAME,
            false,
            registry.serialized_objects(),
        )
        .await
    }

    async fn destroy(&self) -> Result<()> {
        managedresources::delete(&self.client, &self.namespace, MANAGED_RESOURCE_NAME).await
    }
}

#[async_trait]
impl<C: ClusterClient> Waiter for NodeExporter<C> {
    async fn wait(&self) -> Result<()> {
        managedresources::wait_until_healthy(
            &self.client,
            &self.namespace,
            MANAGED_RESOURCE_NAME,
            &self.wait_ops,
        )
        .await
    }

    async fn wait_cleanup(&self) -> Result<()> {
        managedresources::wait_until_deleted(
            &self.client,
            &self.namespace,
            MANAGED_RESOURCE_NAME,
            &self.wait_ops,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::constants::{
        CONDITION_FALSE, CONDITION_TRUE, GARBAGE_COLLECTABLE_REFERENCE, RESOURCES_APPLIED,
        RESOURCES_HEALTHY,
    };
    use crate::apis::core::Condition;
    use crate::apis::resources::{ManagedResource, ManagedResourceSpec, ManagedResourceStatus};
    use crate::client::fake::FakeClusterClient;
    use k8s_openapi::api::core::v1::Secret;
    use std::time::Duration;

    const NAMESPACE: &str = "some-namespace";
    const IMAGE: &str = "some-image:some-tag";

    fn component(client: &FakeClusterClient, vpa_enabled: bool) -> NodeExporter<FakeClusterClient> {
        NodeExporter::new(
            client.clone(),
            NAMESPACE,
            Values {
                image: IMAGE.to_string(),
                vpa_enabled,
            },
        )
        .with_wait_ops(
            RetryOps::new(Duration::from_millis(1), Duration::from_secs(1)).with_max_attempts(2),
        )
    }

    async fn deployed_secret(client: &FakeClusterClient) -> Secret {
        let mr: ManagedResource = client.get(Some(NAMESPACE), MANAGED_RESOURCE_NAME).await.unwrap();
        assert_eq!(mr.metadata.resource_version.as_deref(), Some("1"));
        assert_eq!(
            mr.metadata.labels,
            Some(string_map([(LABEL_ORIGIN, ORIGIN_GARDENER)]))
        );
        client
            .get(Some(NAMESPACE), &mr.spec.secret_refs[0].name)
            .await
            .unwrap()
    }

    fn object<T: serde::de::DeserializeOwned>(secret: &Secret, key: &str) -> T {
        let data = secret.data.as_ref().unwrap();
        serde_yaml::from_slice(&data.get(key).unwrap().0).unwrap()
    }

    fn managed_resource(healthy: &str) -> ManagedResource {
        ManagedResource {
            metadata: ObjectMeta {
                name: Some(MANAGED_RESOURCE_NAME.to_string()),
                namespace: Some(NAMESPACE.to_string()),
                generation: Some(1),
                ..Default::default()
            },
            spec: ManagedResourceSpec::default(),
            status: Some(ManagedResourceStatus {
                observed_generation: 1,
                conditions: vec![
                    Condition::new(RESOURCES_APPLIED, healthy),
                    Condition::new(RESOURCES_HEALTHY, healthy),
                ],
            }),
        }
    }

    #[tokio::test]
    async fn test_deploy_without_vpa() {
        let client = FakeClusterClient::new();
        component(&client, false).deploy().await.unwrap();

        let secret = deployed_secret(&client).await;
        assert_eq!(secret.immutable, Some(true));
        assert_eq!(
            secret.metadata.labels.as_ref().unwrap()[GARBAGE_COLLECTABLE_REFERENCE],
            "true"
        );
        assert_eq!(secret.data.as_ref().unwrap().len(), 3);

        let sa: ServiceAccount = object(&secret, "serviceaccount__kube-system__node-exporter.yaml");
        assert_eq!(sa.automount_service_account_token, Some(false));

        let svc: Service = object(&secret, "service__kube-system__node-exporter.yaml");
        let spec = svc.spec.unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
        assert_eq!(spec.ports.unwrap()[0].port, 16909);

        let ds: DaemonSet = object(&secret, "daemonset__kube-system__node-exporter.yaml");
        let pod = ds.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.host_network, Some(true));
        assert_eq!(pod.host_pid, Some(true));
        assert_eq!(pod.containers[0].image.as_deref(), Some(IMAGE));
        let command = pod.containers[0].command.clone().unwrap();
        assert_eq!(command[0], "/bin/node_exporter");
        assert!(command.contains(&"--collector.textfile.directory=/textfile-collector".to_string()));
        assert_eq!(pod.volumes.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_deploy_with_vpa() {
        let client = FakeClusterClient::new();
        component(&client, true).deploy().await.unwrap();

        let secret = deployed_secret(&client).await;
        assert_eq!(secret.data.as_ref().unwrap().len(), 4);

        let vpa: VerticalPodAutoscaler =
            object(&secret, "verticalpodautoscaler__kube-system__node-exporter.yaml");
        assert_eq!(vpa.spec.target_ref.kind, "DaemonSet");
        let policy = &vpa.spec.resource_policy.unwrap().container_policies[0];
        assert_eq!(policy.container_name, "*");
        assert_eq!(policy.min_allowed["memory"], Quantity("50Mi".to_string()));
    }

    #[tokio::test]
    async fn test_destroy() {
        let client = FakeClusterClient::new();
        let component = component(&client, false);
        component.deploy().await.unwrap();
        client
            .create(&Secret {
                metadata: ObjectMeta {
                    name: Some(format!("managedresource-{MANAGED_RESOURCE_NAME}")),
                    namespace: Some(NAMESPACE.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            })
            .await
            .unwrap();

        component.destroy().await.unwrap();

        assert!(!client.contains::<ManagedResource>(Some(NAMESPACE), MANAGED_RESOURCE_NAME).await);
        let secrets: Vec<Secret> = client.list(Some(NAMESPACE), None).await.unwrap();
        assert!(secrets.is_empty());
    }

    #[tokio::test]
    async fn test_wait() {
        let client = FakeClusterClient::new();
        let component = component(&client, false);

        let err = component.wait().await.unwrap_err();
        assert!(err.to_string().contains("not found"));

        client.create(&managed_resource(CONDITION_FALSE)).await.unwrap();
        let err = component.wait().await.unwrap_err();
        assert!(err.to_string().contains("is not healthy"));

        client
            .patch_status_merge::<ManagedResource>(
                Some(NAMESPACE),
                MANAGED_RESOURCE_NAME,
                &serde_json::json!({"status": {"conditions": [
                    {"type": RESOURCES_APPLIED, "status": CONDITION_TRUE},
                    {"type": RESOURCES_HEALTHY, "status": CONDITION_TRUE},
                ]}}),
            )
            .await
            .unwrap();
        component.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_cleanup() {
        let client = FakeClusterClient::new();
        let component = component(&client, false);
        component.wait_cleanup().await.unwrap();

        client.create(&managed_resource(CONDITION_TRUE)).await.unwrap();
        let err = component.wait_cleanup().await.unwrap_err();
        assert!(err.to_string().contains("still exists"));
    }
}
