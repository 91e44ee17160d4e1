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

//! Leader election on a `coordination.k8s.io/v1` Lease.
//!
//! Only one replica of a component runs its controllers at a time. A
//! candidate takes over the Lease when it is unheld or expired and keeps it
//! by renewing it every retry period.

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::ObjectMeta;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::client::{self, ClientError, ClusterClient};
use crate::config::LeaderElectionConfig;

/// What a candidate should do with the current Lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// No Lease exists yet.
    Create,
    /// The candidate already holds the Lease.
    Renew,
    /// The Lease is unheld or expired.
    TakeOver,
    /// Another candidate holds a valid Lease.
    HeldBy(String),
}

/// Decides how `identity` may proceed given the current Lease spec.
pub fn decide(spec: Option<&LeaseSpec>, identity: &str, now: DateTime<Utc>) -> Decision {
    let Some(spec) = spec else {
        return Decision::Create;
    };

    let holder = spec.holder_identity.as_deref().unwrap_or_default();
    if holder == identity {
        return Decision::Renew;
    }
    if holder.is_empty() {
        return Decision::TakeOver;
    }

    let renewed = spec.renew_time.as_ref().or(spec.acquire_time.as_ref());
    let duration = spec.lease_duration_seconds.unwrap_or_default();
    match renewed {
        Some(MicroTime(renewed)) if *renewed + chrono::Duration::seconds(duration.into()) > now => {
            Decision::HeldBy(holder.to_string())
        }
        _ => Decision::TakeOver,
    }
}

/// Candidate for one Lease.
#[derive(Clone)]
pub struct LeaderElector<C> {
    client: C,
    config: LeaderElectionConfig,
    identity: String,
}

impl<C: ClusterClient> LeaderElector<C> {
    /// Creates an elector competing for the configured lease as `identity`.
    pub fn new(client: C, config: LeaderElectionConfig, identity: impl Into<String>) -> Self {
        Self {
            client,
            config,
            identity: identity.into(),
        }
    }

    /// The holder identity written into the lease.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    fn spec(&self, now: DateTime<Utc>, acquire_time: Option<MicroTime>, transitions: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(self.config.lease_duration.as_secs() as i32),
            acquire_time: acquire_time.or(Some(MicroTime(now))),
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }

    /// Acquires or renews the Lease once. Returns whether it is held now.
    pub async fn try_acquire_or_renew(&self) -> Result<bool, ClientError> {
        let namespace = self.config.resource_namespace.as_str();
        let name = self.config.resource_name.as_str();
        let now = Utc::now();

        let current: Option<Lease> = client::get_opt(&self.client, Some(namespace), name).await?;
        let spec = current.as_ref().and_then(|l| l.spec.as_ref());

        match decide(spec, &self.identity, now) {
            Decision::HeldBy(holder) => {
                tracing::debug!(holder = %holder, lease = %name, "Lease is held by another candidate");
                Ok(false)
            }
            Decision::Create => {
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(name.to_string()),
                        namespace: Some(namespace.to_string()),
                        ..Default::default()
                    },
                    spec: Some(self.spec(now, None, 0)),
                };
                match self.client.create(&lease).await {
                    Ok(_) => Ok(true),
                    Err(e) if e.is_already_exists() => Ok(false),
                    Err(e) => Err(e),
                }
            }
            decision => {
                let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or_default();
                let spec = if decision == Decision::Renew {
                    self.spec(now, spec.and_then(|s| s.acquire_time.clone()), transitions)
                } else {
                    self.spec(now, None, transitions + 1)
                };
                let resource_version = current.and_then(|l| l.metadata.resource_version);
                let patch = serde_json::json!({
                    "metadata": { "resourceVersion": resource_version },
                    "spec": spec,
                });
                match self.client.patch_merge::<Lease>(Some(namespace), name, &patch).await {
                    Ok(_) => Ok(true),
                    Err(ClientError::Conflict { .. }) => Ok(false),
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Blocks until the Lease is acquired. Returns `false` if cancelled first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<bool, ClientError> {
        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    tracing::info!(identity = %self.identity, lease = %self.config.resource_name, "Leadership acquired");
                    return Ok(true);
                }
                Ok(false) => {}
                Err(e) => tracing::warn!(error = %e, "Failed to acquire lease, retrying"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.retry_period) => {}
                _ = cancel.cancelled() => return Ok(false),
            }
        }
    }

    /// Renews the Lease every retry period until it is lost or `cancel` is
    /// triggered. On cancellation the Lease is released.
    pub async fn renew_until_lost(&self, cancel: &CancellationToken) -> anyhow::Result<()> {
        let mut last_renewal = Instant::now();

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.retry_period) => {}
                _ = cancel.cancelled() => {
                    self.release().await;
                    return Ok(());
                }
            }

            match self.try_acquire_or_renew().await {
                Ok(true) => last_renewal = Instant::now(),
                Ok(false) => anyhow::bail!("lease {} was taken over by another candidate", self.config.resource_name),
                Err(e) => tracing::warn!(error = %e, "Transient lease renewal failure, will retry"),
            }

            if last_renewal.elapsed() > self.config.renew_deadline {
                anyhow::bail!(
                    "failed to renew lease {} within {:?}",
                    self.config.resource_name,
                    self.config.renew_deadline
                );
            }
        }
    }

    async fn release(&self) {
        let patch = serde_json::json!({
            "spec": { "holderIdentity": null, "leaseDurationSeconds": 1 }
        });
        if let Err(e) = self
            .client
            .patch_merge::<Lease>(
                Some(&self.config.resource_namespace),
                &self.config.resource_name,
                &patch,
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to release lease");
        }
    }
}

/// Creates a leader election identity from the hostname plus a random suffix.
pub fn create_identity() -> String {
    let hostname = gethostname::gethostname()
        .into_string()
        .unwrap_or_else(|_| "unknown".to_string());
    let suffix: String = (0..4).map(|_| format!("{:02x}", rand::random::<u8>())).collect();
    format!("{hostname}_{suffix}")
}

/// Lease renewals must fit into the lease duration.
pub fn validate(config: &LeaderElectionConfig) -> anyhow::Result<()> {
    if config.renew_deadline >= config.lease_duration {
        anyhow::bail!("leaseDuration must be greater than renewDeadline");
    }
    if config.retry_period.is_zero() || config.retry_period >= config.renew_deadline {
        anyhow::bail!("renewDeadline must be greater than retryPeriod");
    }
    Ok(())
}
