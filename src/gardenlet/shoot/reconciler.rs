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

//! Flows run for a single shoot.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::ObjectMeta;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

use crate::apis::constants::{
    DEPLOYMENT_NAME_KUBE_APISERVER, GARDENER_FINALIZER, GARDENER_OPERATION, GARDEN_ROLE,
    GARDEN_ROLE_SHOOT,
};
use crate::apis::core::{operation, LastOperation, Shoot};
use crate::botanist::{self, api_server_domain, Botanist, ImageVector, Options};
use crate::client::{self, ClientError, ClusterClient};
use crate::component::etcd::BackupConfig;
use crate::component::{self, destroy_and_wait, Clock, Waiter};
use crate::config::{SeedConfig, ShootControllerConfiguration};
use crate::feature::FeatureGate;

const FINALIZER_UPDATE_ATTEMPTS: usize = 5;

/// A flow task failed.
#[derive(Debug, Error)]
#[error("task {task:?} failed: {source}")]
pub struct FlowError {
    /// Name of the failed task.
    pub task: &'static str,
    /// Cause.
    #[source]
    pub source: botanist::Error,
}

/// Errors of a shoot reconcile.
#[derive(Debug, Error)]
pub enum Error {
    /// A flow task failed.
    #[error(transparent)]
    Flow(#[from] FlowError),

    /// Reading or updating the shoot failed.
    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Result type of shoot reconciles.
pub type Result<T> = std::result::Result<T, Error>;

async fn task<T, F>(name: &'static str, fut: F) -> std::result::Result<T, FlowError>
where
    F: Future<Output = botanist::Result<T>>,
{
    debug!(task = name, "Executing task");
    fut.await.map_err(|source| FlowError { task: name, source })
}

/// The operation a seed has to perform for a shoot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// The shoot has no control plane yet.
    Create,
    /// The control plane exists and is kept up to date.
    Reconcile,
    /// The shoot is being deleted.
    Delete,
    /// The control plane moves away from this seed.
    Migrate,
    /// The control plane moved to this seed.
    Restore,
}

impl Operation {
    /// Value used in [`LastOperation::type_`](crate::apis::core::LastOperation::type_).
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Create => operation::CREATE,
            Operation::Reconcile => operation::RECONCILE,
            Operation::Delete => operation::DELETE,
            Operation::Migrate => operation::MIGRATE,
            Operation::Restore => operation::RESTORE,
        }
    }

    /// The operation type reported after a successful reconcile flow.
    fn from_shoot(shoot: &Shoot) -> Operation {
        match shoot.last_operation().map(|o| o.type_.as_str()) {
            Some(operation::CREATE) => Operation::Create,
            Some(operation::RESTORE) => Operation::Restore,
            _ => Operation::Reconcile,
        }
    }
}

/// Decides what `seed` has to do for `shoot`, `None` if it is not
/// responsible.
///
/// The source seed of a migration is responsible as long as it still hosts
/// the control plane, the target seed once the shoot is assigned to it.
pub fn operation_for(shoot: &Shoot, seed: &str) -> Option<Operation> {
    let spec_seed = shoot.spec.seed_name.as_deref();
    let status_seed = shoot.status_seed_name();

    if status_seed == Some(seed) && spec_seed != Some(seed) {
        return Some(Operation::Migrate);
    }
    if spec_seed != Some(seed) {
        return None;
    }
    if shoot.metadata.deletion_timestamp.is_some() {
        return Some(Operation::Delete);
    }
    if status_seed.is_some_and(|s| s != seed) {
        return Some(Operation::Restore);
    }
    if shoot.last_operation().is_none() {
        return Some(Operation::Create);
    }
    Some(Operation::Reconcile)
}

fn last_operation_is(shoot: &Shoot, type_: &str, state: &str) -> bool {
    shoot
        .last_operation()
        .is_some_and(|op| op.type_ == type_ && op.state == state)
}

/// Cron schedule of full etcd snapshots, daily at the start of the
/// maintenance window.
fn full_snapshot_schedule(shoot: &Shoot) -> String {
    let begin = shoot
        .spec
        .maintenance
        .as_ref()
        .and_then(|m| m.time_window.as_ref())
        .map(|w| w.begin.as_str())
        .unwrap_or_default();
    let hour = begin.get(0..2).and_then(|h| h.parse::<u32>().ok());
    let minute = begin.get(2..4).and_then(|m| m.parse::<u32>().ok());
    match (hour, minute) {
        (Some(hour), Some(minute)) if hour < 24 && minute < 60 => format!("{minute} {hour} * * *"),
        _ => "0 0 * * *".to_string(),
    }
}

/// Runs the shoot flows of one seed.
pub struct Reconciler<C> {
    /// Client of the garden cluster.
    pub garden_client: C,
    /// Client of the seed cluster.
    pub seed_client: C,
    /// Shoot controller settings.
    pub config: ShootControllerConfiguration,
    /// The seed served.
    pub seed: SeedConfig,
    /// Feature gates of the gardenlet.
    pub features: Arc<dyn FeatureGate>,
    /// Container images by name.
    pub images: ImageVector,
    /// Identity of the garden cluster.
    pub garden_cluster_identity: String,
    /// Clock for operation timestamps.
    pub clock: Clock,
}

impl<C: ClusterClient> Reconciler<C> {
    /// Name of the served seed.
    pub fn seed_name(&self) -> &str {
        &self.seed.name
    }

    /// Runs the flow required for `shoot` and returns when it should be
    /// processed again.
    pub async fn reconcile(&self, shoot: &Shoot) -> Result<Duration> {
        let Some(op) = operation_for(shoot, self.seed_name()) else {
            return Ok(self.config.sync_period);
        };
        let key = shoot.key();

        match op {
            Operation::Migrate if last_operation_is(shoot, operation::MIGRATE, operation::STATE_SUCCEEDED) => {
                debug!(shoot = %key, "Control plane already migrated away");
                return Ok(self.config.sync_period);
            }
            Operation::Restore
                if !last_operation_is(shoot, operation::MIGRATE, operation::STATE_SUCCEEDED)
                    && shoot.last_operation().map(|o| o.type_.as_str()) != Some(operation::RESTORE) =>
            {
                info!(shoot = %key, "Waiting for the source seed to finish the migration");
                return Ok(self.config.poll_interval);
            }
            _ => {}
        }

        info!(shoot = %key, operation = op.as_str(), "Running shoot flow");
        let shoot = self
            .patch_last_operation(shoot, op, operation::STATE_PROCESSING, 0, format!("{} of Shoot cluster in progress.", op.as_str()))
            .await?;

        let result = match op {
            Operation::Delete => self.run_delete(&shoot).await,
            Operation::Migrate => self.run_migrate(&shoot).await,
            Operation::Create | Operation::Reconcile | Operation::Restore => self.run_reconcile(&shoot).await,
        };

        if let Err(err) = result {
            if let Err(patch_err) = self
                .patch_last_operation(&shoot, op, operation::STATE_ERROR, 50, err.to_string())
                .await
            {
                debug!(shoot = %key, error = %patch_err, "Failed to report flow error");
            }
            return Err(err);
        }

        info!(shoot = %key, operation = op.as_str(), "Shoot flow succeeded");
        Ok(self.config.sync_period)
    }

    fn options(&self, shoot: &Shoot) -> Options {
        let name = shoot.metadata.name.as_deref().unwrap_or_default();
        let namespace = shoot.metadata.namespace.as_deref().unwrap_or_default();
        let project = namespace.strip_prefix("garden-").unwrap_or(namespace);
        let internal_cluster_domain = format!("{name}.{project}.{}", self.seed.internal_domain);

        let backup = self.seed.backup.as_ref().map(|b| BackupConfig {
            provider: b.provider.clone(),
            secret_ref_name: b.secret_ref_name.clone(),
            prefix: format!(
                "{}--{}",
                shoot.technical_id(),
                shoot.metadata.uid.as_deref().unwrap_or_default()
            ),
            container: b.bucket_name.clone(),
            full_snapshot_schedule: full_snapshot_schedule(shoot),
            ..Default::default()
        });

        Options {
            features: self.features.clone(),
            seed_shoot_dns_enabled: self.seed.shoot_dns_enabled,
            backup,
            managed_seed: None,
            api_server_address: api_server_domain(&internal_cluster_domain),
            api_server_cluster_ip: self.seed.ingress_cluster_ip.clone(),
            sni_enabled: self.seed.sni_enabled,
            sni_pod_mutator_enabled: false,
            internal_cluster_domain,
            external_cluster_domain: shoot.spec.dns.as_ref().and_then(|d| d.domain.clone()),
            reversed_vpn_enabled: self.seed.reversed_vpn_enabled,
            vpa_enabled: self.seed.vpa_enabled,
            images: self.images.clone(),
            checksums: BTreeMap::new(),
        }
    }

    async fn botanist(&self, shoot: &Shoot) -> std::result::Result<Botanist<C>, FlowError> {
        let mut b = Botanist::new(
            self.garden_client.clone(),
            self.seed_client.clone(),
            shoot.clone(),
            self.options(shoot),
        );
        task("Initializing control plane components", b.init_components()).await?;
        Ok(b)
    }

    async fn run_reconcile(&self, shoot: &Shoot) -> Result<()> {
        self.ensure_finalizer(shoot).await?;

        let mut b = self.botanist(shoot).await?;
        task("Deploying Shoot namespace in Seed", self.deploy_seed_namespace(&b.seed_namespace)).await?;
        task("Deploying main and events etcd", b.deploy_etcd()).await?;

        let hibernation_enabled = shoot.hibernation_enabled();
        if hibernation_enabled {
            task("Scaling down Kubernetes API server", self.scale_down_kube_apiserver(&b)).await?;
            task("Scaling down main and events etcd", async {
                let components = b.components()?;
                let main = components.etcd_main.replicas().await.unwrap_or_default();
                let events = components.etcd_events.replicas().await.unwrap_or_default();
                if main > 0 || events > 0 {
                    b.wait_until_etcds_ready().await?;
                    b.scale_etcd(0).await?;
                }
                Ok(())
            })
            .await?;
        } else {
            task("Waiting until main and event etcd report readiness", b.wait_until_etcds_ready()).await?;
            if shoot.is_hibernated() {
                task("Waking up Kubernetes API server", b.wake_up_kube_apiserver()).await?;
            } else {
                task("Deploying Kubernetes API server", b.deploy_kube_apiserver()).await?;
                task("Waiting until Kubernetes API server rolled out", async {
                    b.components()?.kube_apiserver.wait().await?;
                    Ok(())
                })
                .await?;
            }
            task("Deploying node-exporter", b.deploy_node_exporter()).await?;
        }

        let uid = shoot.metadata.uid.as_deref().unwrap_or_default();
        let last_operation = self.last_operation(Operation::from_shoot(shoot), operation::STATE_SUCCEEDED, 100, "Shoot cluster has been successfully reconciled.");
        let status = json!({
            "status": {
                "lastOperation": last_operation,
                "seedName": self.seed_name(),
                "technicalID": b.seed_namespace,
                "clusterIdentity": format!("{}-{uid}-{}", b.seed_namespace, self.garden_cluster_identity),
                "hibernated": hibernation_enabled,
                "observedGeneration": shoot.metadata.generation,
            }
        });
        self.patch_status(shoot, &status).await?;

        if shoot
            .metadata
            .annotations
            .as_ref()
            .is_some_and(|a| a.contains_key(GARDENER_OPERATION))
        {
            let patch = json!({ "metadata": { "annotations": { GARDENER_OPERATION: null } } });
            self.garden_client
                .patch_merge::<Shoot>(shoot.metadata.namespace.as_deref(), shoot.metadata.name.as_deref().unwrap_or_default(), &patch)
                .await?;
        }
        Ok(())
    }

    async fn run_delete(&self, shoot: &Shoot) -> Result<()> {
        self.destroy_control_plane(shoot).await?;
        self.patch_last_operation(shoot, Operation::Delete, operation::STATE_SUCCEEDED, 100, "Shoot cluster has been successfully deleted.")
            .await?;
        self.remove_finalizer(shoot).await?;
        Ok(())
    }

    async fn run_migrate(&self, shoot: &Shoot) -> Result<()> {
        self.destroy_control_plane(shoot).await?;
        self.patch_last_operation(shoot, Operation::Migrate, operation::STATE_SUCCEEDED, 100, "Shoot cluster control plane has been migrated.")
            .await?;
        Ok(())
    }

    /// Removes all control plane components and the shoot namespace from the
    /// seed, in reverse order of their creation.
    async fn destroy_control_plane(&self, shoot: &Shoot) -> Result<()> {
        let b = self.botanist(shoot).await?;
        task("Destroying node-exporter", async {
            destroy_and_wait(&b.components()?.node_exporter).await?;
            Ok(())
        })
        .await?;
        task("Destroying Kubernetes API server", async {
            b.delete_kube_apiserver().await?;
            b.components()?.kube_apiserver.wait_cleanup().await?;
            Ok(())
        })
        .await?;
        task("Destroying main and events etcd", b.destroy_etcd()).await?;
        task("Deleting Shoot namespace in Seed", async {
            client::delete_ignore_not_found::<Namespace, _>(&self.seed_client, None, &b.seed_namespace).await?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn deploy_seed_namespace(&self, name: &str) -> botanist::Result<()> {
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(BTreeMap::from([(GARDEN_ROLE.to_string(), GARDEN_ROLE_SHOOT.to_string())])),
                ..Default::default()
            },
            ..Default::default()
        };
        self.seed_client.apply(&namespace).await?;
        Ok(())
    }

    async fn scale_down_kube_apiserver(&self, b: &Botanist<C>) -> botanist::Result<()> {
        let deployment: Option<Deployment> =
            client::get_opt(&self.seed_client, Some(&b.seed_namespace), DEPLOYMENT_NAME_KUBE_APISERVER).await?;
        if deployment.is_some() {
            b.scale_kube_apiserver(0).await?;
        }
        Ok(())
    }

    async fn ensure_finalizer(&self, shoot: &Shoot) -> std::result::Result<(), ClientError> {
        self.update_finalizers(shoot, |finalizers| {
            if finalizers.iter().any(|f| f == GARDENER_FINALIZER) {
                return false;
            }
            finalizers.push(GARDENER_FINALIZER.to_string());
            true
        })
        .await
    }

    async fn remove_finalizer(&self, shoot: &Shoot) -> std::result::Result<(), ClientError> {
        self.update_finalizers(shoot, |finalizers| {
            let before = finalizers.len();
            finalizers.retain(|f| f != GARDENER_FINALIZER);
            finalizers.len() != before
        })
        .await
    }

    /// Rewrites the finalizers of `shoot` guarded by its resource version.
    /// On conflicts the shoot is read again and `update` reapplied, so
    /// finalizers added by others in the meantime are kept. `update` returns
    /// false if nothing has to change.
    async fn update_finalizers(
        &self,
        shoot: &Shoot,
        update: impl Fn(&mut Vec<String>) -> bool,
    ) -> std::result::Result<(), ClientError> {
        let namespace = shoot.metadata.namespace.as_deref();
        let name = shoot.metadata.name.as_deref().unwrap_or_default();
        let mut current = shoot.clone();
        let mut attempt = 1;
        loop {
            let mut finalizers = current.metadata.finalizers.clone().unwrap_or_default();
            if !update(&mut finalizers) {
                return Ok(());
            }
            let finalizers = if finalizers.is_empty() { None } else { Some(finalizers) };
            let patch = json!({
                "metadata": {
                    "finalizers": finalizers,
                    "resourceVersion": current.metadata.resource_version,
                }
            });
            match self.garden_client.patch_merge::<Shoot>(namespace, name, &patch).await {
                Ok(_) => return Ok(()),
                Err(ClientError::Conflict { .. }) if attempt < FINALIZER_UPDATE_ATTEMPTS => {
                    debug!(shoot = %shoot.key(), attempt, "Conflict while updating finalizers, retrying");
                    current = self.garden_client.get(namespace, name).await?;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn last_operation(&self, op: Operation, state: &str, progress: i32, description: impl Into<String>) -> LastOperation {
        LastOperation {
            description: description.into(),
            last_update_time: component::format_timestamp((self.clock)()),
            progress,
            state: state.to_string(),
            type_: op.as_str().to_string(),
        }
    }

    async fn patch_last_operation(
        &self,
        shoot: &Shoot,
        op: Operation,
        state: &str,
        progress: i32,
        description: impl Into<String>,
    ) -> std::result::Result<Shoot, ClientError> {
        let status = json!({ "status": { "lastOperation": self.last_operation(op, state, progress, description) } });
        self.patch_status(shoot, &status).await
    }

    async fn patch_status(&self, shoot: &Shoot, status: &serde_json::Value) -> std::result::Result<Shoot, ClientError> {
        self.garden_client
            .patch_status_merge::<Shoot>(
                shoot.metadata.namespace.as_deref(),
                shoot.metadata.name.as_deref().unwrap_or_default(),
                status,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::core::{Kubernetes, Provider, ShootSpec, ShootStatus, Worker};
    use crate::apis::druid;
    use crate::apis::resources::ManagedResource;
    use crate::client::fake::{FakeClusterClient, Verb};
    use crate::component::nodeexporter::MANAGED_RESOURCE_NAME;
    use crate::component::system_clock;
    use crate::feature::MemoryFeatureGate;

    const SEED: &str = "local";
    const NAMESPACE: &str = "garden-foo";
    const SEED_NAMESPACE: &str = "shoot--foo--bar";

    fn shoot(seed: Option<&str>, status_seed: Option<&str>) -> Shoot {
        Shoot {
            metadata: ObjectMeta {
                name: Some("bar".to_string()),
                namespace: Some(NAMESPACE.to_string()),
                uid: Some("1234".to_string()),
                generation: Some(1),
                ..Default::default()
            },
            spec: ShootSpec {
                kubernetes: Kubernetes {
                    version: "1.27.3".to_string(),
                    ..Default::default()
                },
                provider: Provider {
                    type_: "local".to_string(),
                    workers: vec![Worker {
                        name: "worker".to_string(),
                        minimum: 1,
                        maximum: 2,
                        ..Default::default()
                    }],
                },
                region: "local".to_string(),
                seed_name: seed.map(str::to_string),
                ..Default::default()
            },
            status: status_seed.map(|s| ShootStatus {
                seed_name: Some(s.to_string()),
                ..Default::default()
            }),
        }
    }

    fn reconciler(garden: &FakeClusterClient, seed: &FakeClusterClient) -> Reconciler<FakeClusterClient> {
        Reconciler {
            garden_client: garden.clone(),
            seed_client: seed.clone(),
            config: ShootControllerConfiguration::default(),
            seed: SeedConfig {
                name: SEED.to_string(),
                shoot_dns_enabled: true,
                internal_domain: "internal.example.com".to_string(),
                backup: None,
                sni_enabled: false,
                ingress_cluster_ip: String::new(),
                reversed_vpn_enabled: true,
                vpa_enabled: true,
            },
            features: Arc::new(MemoryFeatureGate::gardener()),
            images: crate::botanist::test_support::images(),
            garden_cluster_identity: "garden".to_string(),
            clock: system_clock(),
        }
    }

    #[test]
    fn test_operation_for() {
        assert_eq!(operation_for(&shoot(None, None), SEED), None);
        assert_eq!(operation_for(&shoot(Some("other"), None), SEED), None);
        assert_eq!(operation_for(&shoot(Some(SEED), None), SEED), Some(Operation::Create));
        assert_eq!(
            operation_for(&shoot(Some("other"), Some(SEED)), SEED),
            Some(Operation::Migrate)
        );
        assert_eq!(
            operation_for(&shoot(Some(SEED), Some("other")), SEED),
            Some(Operation::Restore)
        );

        let mut reconciled = shoot(Some(SEED), Some(SEED));
        if let Some(status) = reconciled.status.as_mut() {
            status.last_operation = Some(LastOperation::default());
        }
        assert_eq!(operation_for(&reconciled, SEED), Some(Operation::Reconcile));

        reconciled.metadata.deletion_timestamp = Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(chrono::Utc::now()));
        assert_eq!(operation_for(&reconciled, SEED), Some(Operation::Delete));
    }

    #[test]
    fn test_full_snapshot_schedule() {
        let mut s = shoot(None, None);
        assert_eq!(full_snapshot_schedule(&s), "0 0 * * *");

        s.spec.maintenance = Some(crate::apis::core::Maintenance {
            time_window: Some(crate::apis::core::MaintenanceTimeWindow {
                begin: "220000+0000".to_string(),
                end: "230000+0000".to_string(),
            }),
        });
        assert_eq!(full_snapshot_schedule(&s), "0 22 * * *");
    }

    #[tokio::test]
    async fn test_not_responsible() {
        let garden = FakeClusterClient::new();
        let seed = FakeClusterClient::new();
        let s = shoot(Some("other"), None);
        garden.create(&s).await.unwrap();

        let requeue = reconciler(&garden, &seed).reconcile(&s).await.unwrap();
        assert_eq!(requeue, ShootControllerConfiguration::default().sync_period);
        assert!(seed.actions().await.is_empty());
    }

    #[tokio::test]
    async fn test_reconcile_failure_reports_last_operation() {
        let garden = FakeClusterClient::new();
        let seed = FakeClusterClient::new();
        let s = shoot(Some(SEED), None);
        garden.create(&s).await.unwrap();
        seed.fail_on::<druid::Etcd>(Verb::Apply).await;

        let err = reconciler(&garden, &seed).reconcile(&s).await.unwrap_err();
        assert!(matches!(&err, Error::Flow(f) if f.task == "Deploying main and events etcd"));

        let current: Shoot = garden.get(Some(NAMESPACE), "bar").await.unwrap();
        let op = current.last_operation().unwrap();
        assert_eq!(op.type_, operation::CREATE);
        assert_eq!(op.state, operation::STATE_ERROR);
        assert!(op.description.contains("Deploying main and events etcd"));
        assert_eq!(current.metadata.finalizers, Some(vec![GARDENER_FINALIZER.to_string()]));
        assert!(seed.contains::<Namespace>(None, SEED_NAMESPACE).await);
    }

    #[tokio::test]
    async fn test_reconcile_hibernated_shoot() {
        let garden = FakeClusterClient::new();
        let seed = FakeClusterClient::new();
        let mut s = shoot(Some(SEED), None);
        s.spec.hibernation = Some(crate::apis::core::Hibernation { enabled: Some(true) });
        garden.create(&s).await.unwrap();

        reconciler(&garden, &seed).reconcile(&s).await.unwrap();

        let current: Shoot = garden.get(Some(NAMESPACE), "bar").await.unwrap();
        let status = current.status.as_ref().unwrap();
        assert!(status.hibernated);
        assert_eq!(status.seed_name.as_deref(), Some(SEED));
        assert_eq!(status.technical_id.as_deref(), Some(SEED_NAMESPACE));
        assert_eq!(status.cluster_identity.as_deref(), Some("shoot--foo--bar-1234-garden"));
        assert_eq!(current.last_operation().unwrap().state, operation::STATE_SUCCEEDED);

        let etcd: druid::Etcd = seed.get(Some(SEED_NAMESPACE), "etcd-main").await.unwrap();
        assert_eq!(etcd.spec.replicas, 0);
    }

    #[tokio::test]
    async fn test_delete_removes_control_plane_and_finalizer() {
        let garden = FakeClusterClient::new();
        let seed = FakeClusterClient::new();
        let mut s = shoot(Some(SEED), Some(SEED));
        s.metadata.finalizers = Some(vec![GARDENER_FINALIZER.to_string()]);
        garden.create(&s).await.unwrap();
        garden.delete::<Shoot>(Some(NAMESPACE), "bar").await.unwrap();
        let s: Shoot = garden.get(Some(NAMESPACE), "bar").await.unwrap();

        let mut hibernated = s.clone();
        hibernated.spec.hibernation = Some(crate::apis::core::Hibernation { enabled: Some(true) });
        let r = reconciler(&garden, &seed);
        r.deploy_seed_namespace(SEED_NAMESPACE).await.unwrap();
        r.botanist(&hibernated).await.unwrap().deploy_etcd().await.unwrap();
        assert!(seed.contains::<druid::Etcd>(Some(SEED_NAMESPACE), "etcd-main").await);

        r.reconcile(&s).await.unwrap();

        assert!(!seed.contains::<druid::Etcd>(Some(SEED_NAMESPACE), "etcd-main").await);
        assert!(!seed.contains::<druid::Etcd>(Some(SEED_NAMESPACE), "etcd-events").await);
        assert!(!seed.contains::<ManagedResource>(Some(SEED_NAMESPACE), MANAGED_RESOURCE_NAME).await);
        assert!(!seed.contains::<Namespace>(None, SEED_NAMESPACE).await);
        assert!(!garden.contains::<Shoot>(Some(NAMESPACE), "bar").await);
    }

    #[tokio::test]
    async fn test_remove_finalizer_keeps_concurrently_added_finalizers() {
        let garden = FakeClusterClient::new();
        let mut s = shoot(Some(SEED), Some(SEED));
        s.metadata.finalizers = Some(vec![GARDENER_FINALIZER.to_string()]);
        let stale = garden.create(&s).await.unwrap();

        garden
            .patch_merge::<Shoot>(
                Some(NAMESPACE),
                "bar",
                &json!({"metadata": {"finalizers": [GARDENER_FINALIZER, "foreign"]}}),
            )
            .await
            .unwrap();

        reconciler(&garden, &FakeClusterClient::new())
            .remove_finalizer(&stale)
            .await
            .unwrap();

        let current: Shoot = garden.get(Some(NAMESPACE), "bar").await.unwrap();
        assert_eq!(current.metadata.finalizers, Some(vec!["foreign".to_string()]));
        let patches = garden
            .actions()
            .await
            .into_iter()
            .filter(|a| a.verb == Verb::Patch)
            .count();
        assert_eq!(patches, 3, "the stale patch must be retried once");
    }

    #[tokio::test]
    async fn test_finalizer_updates_refetch_on_conflict() {
        let garden = FakeClusterClient::new();
        let s = shoot(Some(SEED), None);
        garden.create(&s).await.unwrap();
        let mut stale = s.clone();
        stale.metadata.resource_version = Some("0".to_string());

        let r = reconciler(&garden, &FakeClusterClient::new());
        r.ensure_finalizer(&stale).await.unwrap();
        let current: Shoot = garden.get(Some(NAMESPACE), "bar").await.unwrap();
        assert_eq!(current.metadata.finalizers, Some(vec![GARDENER_FINALIZER.to_string()]));

        stale.metadata.finalizers = current.metadata.finalizers.clone();
        garden.fail_on::<Shoot>(Verb::Get).await;
        let err = r.remove_finalizer(&stale).await.unwrap_err();
        assert!(matches!(err, ClientError::Injected(_)), "{err}");
        assert!(garden.contains::<Shoot>(Some(NAMESPACE), "bar").await);
    }

    #[tokio::test]
    async fn test_migrate_and_restore_handshake() {
        let garden = FakeClusterClient::new();
        let source = FakeClusterClient::new();
        let s = shoot(Some("target"), Some(SEED));
        garden.create(&s).await.unwrap();

        let mut target = reconciler(&garden, &FakeClusterClient::new());
        target.seed.name = "target".to_string();
        assert_eq!(
            target.reconcile(&s).await.unwrap(),
            target.config.poll_interval,
            "restore must wait for the source seed"
        );

        reconciler(&garden, &source).reconcile(&s).await.unwrap();
        let migrated: Shoot = garden.get(Some(NAMESPACE), "bar").await.unwrap();
        assert!(last_operation_is(&migrated, operation::MIGRATE, operation::STATE_SUCCEEDED));
        assert!(!source.contains::<Namespace>(None, SEED_NAMESPACE).await);

        source.clear_actions().await;
        reconciler(&garden, &source).reconcile(&migrated).await.unwrap();
        assert!(source.actions().await.is_empty());
        assert_eq!(operation_for(&migrated, "target"), Some(Operation::Restore));
    }
}
