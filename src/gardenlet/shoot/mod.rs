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

//! The shoot controller of the gardenlet.
//!
//! Shoots are watched in the garden cluster. A shoot this seed is responsible
//! for is reconciled when its generation, its deletion state or the requested
//! operation changes, and again after its jittered sync period. Status
//! updates written by the flows themselves do not trigger it.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use kube::runtime::controller::{self, Action};
use kube::runtime::{reflector, Controller as RuntimeController, WatchStreamExt};
use tracing::{debug, error, info, warn};

use crate::apis::constants::GARDENER_OPERATION;
use crate::apis::core::{operation, Shoot};
use crate::botanist::ImageVector;
use crate::client::ClusterClient;
use crate::component::system_clock;
use crate::config::{SeedConfig, ShootControllerConfiguration};
use crate::controller::{graceful_shutdown, CancellationToken, Controller, ControllerError, Result};
use crate::controller_context::ControllerContext;
use crate::controller_descriptor;
use crate::controller_manager::ControllerManager;

pub mod reconciler;

pub use reconciler::{operation_for, FlowError, Operation, Reconciler};

/// Name of the shoot controller.
pub const CONTROLLER_NAME: &str = "shoot";

type Resync = Arc<dyn Fn(Duration) -> Duration + Send + Sync>;

/// Shared state of all reconciliations.
struct Context<C> {
    reconciler: Arc<Reconciler<C>>,
    resync: Resync,
}

/// Hashes the fields whose changes make a shoot due.
fn trigger_hash(shoot: &Shoot) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    shoot.metadata.generation.hash(&mut hasher);
    shoot.metadata.deletion_timestamp.is_some().hash(&mut hasher);
    shoot
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(GARDENER_OPERATION))
        .hash(&mut hasher);
    Some(hasher.finish())
}

/// Returns how long the last successful reconciliation of `shoot` stays
/// valid, `None` if it has to be reconciled now.
fn valid_for(shoot: &Shoot, sync_period: Duration, now: DateTime<Utc>) -> Option<Duration> {
    let status = shoot.status.as_ref()?;
    let last = status.last_operation.as_ref()?;
    let reconciled = matches!(
        last.type_.as_str(),
        operation::CREATE | operation::RECONCILE | operation::RESTORE
    ) && last.state == operation::STATE_SUCCEEDED;
    let operation_requested = shoot
        .metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(GARDENER_OPERATION));
    if !reconciled
        || operation_requested
        || shoot.metadata.deletion_timestamp.is_some()
        || status.observed_generation != shoot.metadata.generation
    {
        return None;
    }

    let updated = DateTime::parse_from_rfc3339(&last.last_update_time).ok()?;
    let elapsed = (now - updated.with_timezone(&Utc)).to_std().unwrap_or_default();
    sync_period.checked_sub(elapsed).filter(|d| !d.is_zero())
}

async fn reconcile<C: ClusterClient>(
    shoot: Arc<Shoot>,
    ctx: Arc<Context<C>>,
) -> std::result::Result<Action, reconciler::Error> {
    let r = &ctx.reconciler;
    if operation_for(&shoot, r.seed_name()).is_none() {
        return Ok(Action::await_change());
    }
    if let Some(remaining) = valid_for(&shoot, r.config.sync_period, (r.clock)()) {
        debug!(shoot = %shoot.key(), ?remaining, "Shoot is reconciled, not due yet");
        return Ok(Action::requeue(remaining));
    }

    let after = r.reconcile(&shoot).await?;
    Ok(Action::requeue((ctx.resync)(after)))
}

fn error_policy<C: ClusterClient>(shoot: Arc<Shoot>, err: &reconciler::Error, ctx: Arc<Context<C>>) -> Action {
    error!(shoot = %shoot.key(), error = %err, "Reconciling shoot failed");
    Action::requeue((ctx.resync)(ctx.reconciler.config.poll_interval))
}

/// Watches the shoots of the garden cluster and reconciles those scheduled to
/// this seed, at most `concurrentSyncs` at a time.
pub struct ShootController<C> {
    reconciler: Arc<Reconciler<C>>,
    config: ShootControllerConfiguration,
}

impl<C: ClusterClient> ShootController<C> {
    /// Wraps `reconciler`. Concurrency and retry delays come from its config.
    pub fn new(reconciler: Reconciler<C>) -> Self {
        Self {
            config: reconciler.config.clone(),
            reconciler: Arc::new(reconciler),
        }
    }
}

#[async_trait]
impl<C: ClusterClient> Controller<C> for ShootController<C> {
    fn name(&self) -> &str {
        CONTROLLER_NAME
    }

    async fn run(&self, ctx: ControllerContext<C>, cancel: CancellationToken) -> Result<()> {
        info!(seed = %self.reconciler.seed_name(), "Starting shoot controller");

        let (reader, writer) = reflector::store();
        let shoots = reflector(writer, self.reconciler.garden_client.watch::<Shoot>(None, None))
            .applied_objects()
            .predicate_filter(trigger_hash);
        let context = Arc::new(Context {
            reconciler: self.reconciler.clone(),
            resync: ctx.resync_period_fn.clone(),
        });
        let concurrency = u16::try_from(self.config.concurrent_syncs.max(1)).unwrap_or(u16::MAX);

        RuntimeController::for_stream(shoots, reader)
            .with_config(controller::Config::default().concurrency(concurrency))
            .graceful_shutdown_on(graceful_shutdown(&cancel))
            .run(reconcile::<C>, error_policy::<C>, context)
            .for_each(|result| async move {
                match result {
                    Ok((shoot, action)) => debug!(shoot = %shoot, ?action, "Reconciled shoot"),
                    Err(controller::Error::ReconcilerFailed(..)) => {}
                    Err(err) => warn!(error = %err, "Shoot controller error"),
                }
            })
            .await;
        Ok(())
    }

    fn worker_count(&self) -> usize {
        self.config.concurrent_syncs.max(1)
    }
}

/// Registers the shoot controller with the manager.
pub fn add_to_manager<C: ClusterClient>(
    manager: &mut ControllerManager<C>,
    config: ShootControllerConfiguration,
    seed: SeedConfig,
    images: ImageVector,
    garden_cluster_identity: String,
) -> Result<()> {
    let descriptor = controller_descriptor::builder(CONTROLLER_NAME)
        .with_alias("shoots")
        .build(Arc::new(move |ctx: ControllerContext<C>, _| {
            let config = config.clone();
            let seed = seed.clone();
            let images = images.clone();
            let garden_cluster_identity = garden_cluster_identity.clone();
            Box::pin(async move {
                let garden_client = ctx.garden_client.clone().ok_or_else(|| ControllerError::InvalidConfig {
                    name: CONTROLLER_NAME.to_string(),
                    reason: "a garden client is required".to_string(),
                })?;
                let reconciler = Reconciler {
                    garden_client,
                    seed_client: ctx.client.clone(),
                    config,
                    seed,
                    features: ctx.feature_gate.clone(),
                    images,
                    garden_cluster_identity,
                    clock: system_clock(),
                };
                Ok(Some(Arc::new(ShootController::new(reconciler)) as Arc<dyn Controller<C>>))
            })
        }));
    manager.add(descriptor)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::core::{Hibernation, Kubernetes, LastOperation, Provider, ShootSpec, ShootStatus, Worker};
    use crate::client::fake::FakeClusterClient;
    use crate::component::format_timestamp;
    use crate::feature::MemoryFeatureGate;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    const NAMESPACE: &str = "garden-foo";

    fn shoot(name: &str, seed: &str) -> Shoot {
        Shoot {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(NAMESPACE.to_string()),
                uid: Some(format!("uid-{name}")),
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
                seed_name: Some(seed.to_string()),
                ..Default::default()
            },
            status: None,
        }
    }

    fn hibernated(name: &str, seed: &str) -> Shoot {
        let mut s = shoot(name, seed);
        s.spec.hibernation = Some(Hibernation { enabled: Some(true) });
        s
    }

    fn reconciled(now: DateTime<Utc>) -> Shoot {
        let mut s = shoot("bar", "local");
        s.status = Some(ShootStatus {
            observed_generation: Some(1),
            last_operation: Some(LastOperation {
                type_: operation::RECONCILE.to_string(),
                state: operation::STATE_SUCCEEDED.to_string(),
                last_update_time: format_timestamp(now),
                ..Default::default()
            }),
            ..Default::default()
        });
        s
    }

    fn controller(garden: &FakeClusterClient, seed: &FakeClusterClient) -> ShootController<FakeClusterClient> {
        ShootController::new(Reconciler {
            garden_client: garden.clone(),
            seed_client: seed.clone(),
            config: ShootControllerConfiguration::default(),
            seed: SeedConfig {
                name: "local".to_string(),
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
        })
    }

    fn start(
        c: ShootController<FakeClusterClient>,
        garden: &FakeClusterClient,
    ) -> (CancellationToken, tokio::task::JoinHandle<Result<()>>) {
        let ctx = ControllerContext::new(
            FakeClusterClient::new(),
            Some(garden.clone()),
            Arc::new(Default::default()),
            Arc::new(MemoryFeatureGate::gardener()),
            "test",
        );
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        (cancel, tokio::spawn(async move { c.run(ctx, token).await }))
    }

    async fn wait_for_state(garden: &FakeClusterClient, name: &str, state: &str) -> Shoot {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let s: Shoot = garden.get(Some(NAMESPACE), name).await.unwrap();
                if s.last_operation().is_some_and(|op| op.state == state) {
                    return s;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("shoot {name} never reached state {state}"))
    }

    #[test]
    fn test_trigger_hash_ignores_status() {
        let mut s = shoot("bar", "local");
        let initial = trigger_hash(&s);

        s.status = Some(ShootStatus {
            hibernated: true,
            ..Default::default()
        });
        s.metadata.resource_version = Some("5".to_string());
        assert_eq!(trigger_hash(&s), initial);

        s.metadata.generation = Some(2);
        let changed = trigger_hash(&s);
        assert_ne!(changed, initial);

        s.metadata.annotations = Some(BTreeMap::from([(
            GARDENER_OPERATION.to_string(),
            "reconcile".to_string(),
        )]));
        assert_ne!(trigger_hash(&s), changed);
    }

    #[test]
    fn test_valid_for() {
        let now = Utc::now();
        let period = Duration::from_secs(3600);
        let s = reconciled(now - chrono::Duration::minutes(10));
        assert_eq!(valid_for(&s, period, now), Some(Duration::from_secs(3000)));

        assert_eq!(valid_for(&reconciled(now - chrono::Duration::hours(2)), period, now), None);
        assert_eq!(valid_for(&shoot("bar", "local"), period, now), None);

        let mut changed = s.clone();
        changed.metadata.generation = Some(2);
        assert_eq!(valid_for(&changed, period, now), None);

        let mut requested = s.clone();
        requested.metadata.annotations = Some(BTreeMap::from([(
            GARDENER_OPERATION.to_string(),
            "reconcile".to_string(),
        )]));
        assert_eq!(valid_for(&requested, period, now), None);

        let mut failed = s;
        if let Some(op) = failed.status.as_mut().and_then(|s| s.last_operation.as_mut()) {
            op.state = operation::STATE_ERROR.to_string();
        }
        assert_eq!(valid_for(&failed, period, now), None);
    }

    #[tokio::test]
    async fn test_reconciles_only_responsible_shoots() {
        let garden = FakeClusterClient::new();
        garden.create(&hibernated("mine", "local")).await.unwrap();
        garden.create(&hibernated("other", "remote")).await.unwrap();
        let (cancel, handle) = start(controller(&garden, &FakeClusterClient::new()), &garden);

        let mine = wait_for_state(&garden, "mine", operation::STATE_SUCCEEDED).await;
        assert_eq!(mine.last_operation().unwrap().type_, operation::CREATE);
        let other: Shoot = garden.get(Some(NAMESPACE), "other").await.unwrap();
        assert!(other.status.is_none());

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shoot_created_later_is_not_blocked_by_a_slow_flow() {
        let garden = FakeClusterClient::new();
        // waits for etcd readiness which never comes
        garden.create(&shoot("slow", "local")).await.unwrap();
        let (cancel, handle) = start(controller(&garden, &FakeClusterClient::new()), &garden);
        wait_for_state(&garden, "slow", operation::STATE_PROCESSING).await;

        garden.create(&hibernated("fast", "local")).await.unwrap();
        wait_for_state(&garden, "fast", operation::STATE_SUCCEEDED).await;

        let slow: Shoot = garden.get(Some(NAMESPACE), "slow").await.unwrap();
        assert_eq!(slow.last_operation().unwrap().state, operation::STATE_PROCESSING);

        cancel.cancel();
        handle.abort();
    }

    #[tokio::test]
    async fn test_operation_annotation_triggers_reconcile() {
        let garden = FakeClusterClient::new();
        garden.create(&hibernated("bar", "local")).await.unwrap();
        let (cancel, handle) = start(controller(&garden, &FakeClusterClient::new()), &garden);
        let first = wait_for_state(&garden, "bar", operation::STATE_SUCCEEDED).await;
        assert_eq!(first.last_operation().unwrap().type_, operation::CREATE);

        garden
            .patch_merge::<Shoot>(
                Some(NAMESPACE),
                "bar",
                &serde_json::json!({"metadata": {"annotations": {GARDENER_OPERATION: "reconcile"}}}),
            )
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let s: Shoot = garden.get(Some(NAMESPACE), "bar").await.unwrap();
                let annotated = s.metadata.annotations.as_ref().is_some_and(|a| a.contains_key(GARDENER_OPERATION));
                if !annotated && s.last_operation().is_some_and(|op| op.type_ == operation::RECONCILE) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
