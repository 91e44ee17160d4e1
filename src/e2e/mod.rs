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

//! Helpers for end-to-end tests against a local gardener landscape.

use std::time::Duration;

use anyhow::{bail, Context};
use kube::api::ObjectMeta;

use crate::apis::constants::CONFIRMATION_DELETION;
use crate::apis::core::{
    operation, ControlPlane, FailureTolerance, HighAvailability, Hibernation, Kubernetes, Machine,
    Networking, Provider, Shoot, ShootSpec, Worker,
};
use crate::client::{self, ClusterClient};
use crate::utils::retry::{Outcome, RetryOps};

/// Namespace of the project the e2e shoots are created in.
pub const PROJECT_NAMESPACE: &str = "garden-local";

/// Environment variable selecting the failure tolerance of the shoots.
pub const FAILURE_TOLERANCE_ENV: &str = "SHOOT_FAILURE_TOLERANCE_TYPE";

const KUBERNETES_VERSION: &str = "1.31.1";

fn failure_tolerance() -> Option<String> {
    std::env::var(FAILURE_TOLERANCE_ENV).ok().filter(|v| !v.is_empty())
}

fn seed_name_for(failure_tolerance: Option<&str>, is_target: bool) -> &'static str {
    match (failure_tolerance, is_target) {
        (Some("node"), false) => "local-ha-single-zone",
        (Some("node"), true) => "local2-ha-single-zone",
        (_, false) => "local",
        (_, true) => "local2",
    }
}

/// Seed a test shoot is scheduled to, or migrated to if `is_target`.
pub fn seed_name(is_target: bool) -> String {
    seed_name_for(failure_tolerance().as_deref(), is_target).to_string()
}

fn control_plane(failure_tolerance: Option<String>) -> Option<ControlPlane> {
    failure_tolerance.map(|type_| ControlPlane {
        high_availability: Some(HighAvailability {
            failure_tolerance: FailureTolerance { type_ },
        }),
    })
}

/// A shoot with one worker pool on the local provider.
pub fn default_shoot(name: &str) -> Shoot {
    let mut shoot = default_workerless_shoot(name);
    shoot.spec.networking = Some(Networking {
        type_: Some("calico".to_string()),
        nodes: Some("172.18.0.0/16".to_string()),
        ..Default::default()
    });
    shoot.spec.provider.workers = vec![Worker {
        name: "local".to_string(),
        machine: Machine {
            type_: "local".to_string(),
        },
        minimum: 1,
        maximum: 1,
    }];
    shoot.spec.secret_binding_name = Some("local".to_string());
    shoot
}

/// A shoot without worker pools.
pub fn default_workerless_shoot(name: &str) -> Shoot {
    Shoot {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(PROJECT_NAMESPACE.to_string()),
            ..Default::default()
        },
        spec: ShootSpec {
            cloud_profile_name: Some("local".to_string()),
            control_plane: control_plane(failure_tolerance()),
            kubernetes: Kubernetes {
                version: KUBERNETES_VERSION.to_string(),
                ..Default::default()
            },
            provider: Provider {
                type_: "local".to_string(),
                workers: Vec::new(),
            },
            region: "local".to_string(),
            ..Default::default()
        },
        status: None,
    }
}

/// Enables hibernation for the shoot.
pub fn hibernated(mut shoot: Shoot) -> Shoot {
    shoot.spec.hibernation = Some(Hibernation { enabled: Some(true) });
    shoot
}

fn is_reconciled(shoot: &Shoot) -> Result<(), String> {
    let observed = shoot.status.as_ref().and_then(|s| s.observed_generation);
    if observed != shoot.metadata.generation {
        return Err(format!(
            "observed generation {observed:?} is outdated, current generation is {:?}",
            shoot.metadata.generation
        ));
    }
    match shoot.last_operation() {
        Some(op) if op.state == operation::STATE_SUCCEEDED && op.type_ != operation::MIGRATE => Ok(()),
        Some(op) => Err(format!("last operation {} is {}: {}", op.type_, op.state, op.description)),
        None => Err("shoot was not yet processed".to_string()),
    }
}

/// Drives shoots through their lifecycle in the garden cluster.
pub struct ShootFramework<C> {
    /// Client of the garden cluster.
    pub garden_client: C,
    /// Interval and timeout of the waits.
    pub ops: RetryOps,
}

impl<C: ClusterClient> ShootFramework<C> {
    /// Creates a framework waiting every 5s for up to 15 minutes.
    pub fn new(garden_client: C) -> Self {
        Self {
            garden_client,
            ops: RetryOps::new(Duration::from_secs(5), Duration::from_secs(15 * 60)),
        }
    }

    /// Replaces the interval and timeout of the waits.
    pub fn with_ops(mut self, ops: RetryOps) -> Self {
        self.ops = ops;
        self
    }

    /// Creates the shoot and waits until its creation succeeded.
    pub async fn create_shoot_and_wait_for_creation(&self, shoot: &Shoot) -> anyhow::Result<Shoot> {
        let created = self
            .garden_client
            .create(shoot)
            .await
            .with_context(|| format!("failed creating shoot {}", shoot.key()))?;
        tracing::info!(shoot = %created.key(), "Shoot created");
        self.wait_for_shoot_to_be_reconciled(&created, None).await
    }

    /// Waits until the shoot is reconciled, by the given seed if set.
    pub async fn wait_for_shoot_to_be_reconciled(&self, shoot: &Shoot, seed_name: Option<&str>) -> anyhow::Result<Shoot> {
        let namespace = shoot.metadata.namespace.as_deref();
        let name = shoot.metadata.name.as_deref().unwrap_or_default();
        let client = &self.garden_client;
        self.ops
            .until(|| async move {
                let current = match client.get::<Shoot>(namespace, name).await {
                    Ok(current) => current,
                    Err(e) => return Outcome::Minor(e.to_string()),
                };
                if let Some(seed) = seed_name {
                    if current.status_seed_name() != Some(seed) {
                        return Outcome::Minor(format!(
                            "shoot is hosted by seed {:?}, waiting for {seed}",
                            current.status_seed_name()
                        ));
                    }
                }
                match is_reconciled(&current) {
                    Ok(()) => Outcome::Done,
                    Err(reason) => Outcome::Minor(reason),
                }
            })
            .await
            .with_context(|| format!("shoot {} was not reconciled", shoot.key()))?;
        Ok(self.garden_client.get(namespace, name).await?)
    }

    /// Confirms the deletion, deletes the shoot and waits until it is gone.
    pub async fn delete_shoot_and_wait_for_deletion(&self, shoot: &Shoot) -> anyhow::Result<()> {
        let namespace = shoot.metadata.namespace.as_deref();
        let name = shoot.metadata.name.as_deref().unwrap_or_default();

        let patch = serde_json::json!({
            "metadata": { "annotations": { CONFIRMATION_DELETION: "true" } }
        });
        self.garden_client
            .patch_merge::<Shoot>(namespace, name, &patch)
            .await
            .with_context(|| format!("failed confirming deletion of shoot {}", shoot.key()))?;
        client::delete_ignore_not_found::<Shoot, _>(&self.garden_client, namespace, name).await?;
        tracing::info!(shoot = %shoot.key(), "Shoot deletion requested");

        let garden_client = &self.garden_client;
        self.ops
            .until(|| async move {
                match client::get_opt::<Shoot, _>(garden_client, namespace, name).await {
                    Ok(None) => Outcome::Done,
                    Ok(Some(current)) => Outcome::Minor(match current.last_operation() {
                        Some(op) => format!("shoot still exists, last operation {} is {}", op.type_, op.state),
                        None => "shoot still exists".to_string(),
                    }),
                    Err(e) => Outcome::Minor(e.to_string()),
                }
            })
            .await
            .with_context(|| format!("shoot {} was not deleted", shoot.key()))
    }
}

/// Moves a shoot's control plane to another seed and verifies the result.
pub struct ShootMigrationTest<'a, C> {
    framework: &'a ShootFramework<C>,
    namespace: String,
    name: String,
    /// Seed hosting the control plane before the migration.
    pub source_seed_name: String,
    /// Seed the control plane moves to.
    pub target_seed_name: String,
}

impl<'a, C: ClusterClient> ShootMigrationTest<'a, C> {
    /// Reads the shoot's current seed. Fails when the shoot is not scheduled yet
    /// or already on the target seed.
    pub async fn new(framework: &'a ShootFramework<C>, shoot: &Shoot, target_seed_name: impl Into<String>) -> anyhow::Result<Self> {
        let namespace = shoot.metadata.namespace.clone().unwrap_or_default();
        let name = shoot.metadata.name.clone().unwrap_or_default();
        let current: Shoot = framework.garden_client.get(Some(&namespace), &name).await?;
        let Some(source_seed_name) = current.spec.seed_name.clone() else {
            bail!("shoot {} is not scheduled to a seed", current.key());
        };
        let target_seed_name = target_seed_name.into();
        if source_seed_name == target_seed_name {
            bail!("shoot {} is already scheduled to seed {target_seed_name}", current.key());
        }
        Ok(Self {
            framework,
            namespace,
            name,
            source_seed_name,
            target_seed_name,
        })
    }

    /// Changes the shoot's seed and waits until the target seed reconciled it.
    pub async fn migrate_shoot(&self) -> anyhow::Result<Shoot> {
        let patch = serde_json::json!({ "spec": { "seedName": self.target_seed_name } });
        let shoot: Shoot = self
            .framework
            .garden_client
            .patch_merge(Some(&self.namespace), &self.name, &patch)
            .await
            .context("failed changing the seed name of the shoot")?;
        tracing::info!(
            shoot = %shoot.key(),
            source = %self.source_seed_name,
            target = %self.target_seed_name,
            "Shoot migration started"
        );
        self.framework
            .wait_for_shoot_to_be_reconciled(&shoot, Some(&self.target_seed_name))
            .await
    }

    /// Checks that the target seed hosts the shoot and the last operation succeeded.
    pub async fn verify_migration(&self) -> anyhow::Result<()> {
        let shoot: Shoot = self
            .framework
            .garden_client
            .get(Some(&self.namespace), &self.name)
            .await?;
        if shoot.status_seed_name() != Some(self.target_seed_name.as_str()) {
            bail!(
                "shoot {} is hosted by seed {:?}, expected {}",
                shoot.key(),
                shoot.status_seed_name(),
                self.target_seed_name
            );
        }
        is_reconciled(&shoot).map_err(anyhow::Error::msg)
    }
}
