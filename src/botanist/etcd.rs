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

//! Deploys, scales and destroys the shoot's etcds.

use futures::future::try_join;
use tracing::info;

use super::{Botanist, Result};
use crate::apis::constants::{SHOOT_ALPHA_CONTROL_PLANE_SCALE_DOWN_DISABLED, SHOOT_PURPOSE_PRODUCTION};
use crate::client::ClusterClient;
use crate::component::etcd::{Class, Etcd, HvpaConfig, Values, ROLE_MAIN};
use crate::component::{Deployer, Waiter};
use crate::feature::gardener::{HVPA, HVPA_FOR_SHOOTED_SEED};
use crate::feature::FeatureGate;

const PRIORITY_CLASS_NAME: &str = "gardener-system-500";
const DEFAULT_DEFRAGMENTATION_SCHEDULE: &str = "0 0 */3 * *";

/// Cron schedule running every third day at the start of the maintenance
/// window. `begin` has the format `HHMMSS+ZZZZ`.
fn defragmentation_schedule(begin: &str) -> String {
    let hour = begin.get(0..2).and_then(|h| h.parse::<u32>().ok());
    let minute = begin.get(2..4).and_then(|m| m.parse::<u32>().ok());
    match (hour, minute) {
        (Some(hour), Some(minute)) if hour < 24 && minute < 60 => {
            format!("{minute} {hour} */3 * *")
        }
        _ => DEFAULT_DEFRAGMENTATION_SCHEDULE.to_string(),
    }
}

impl<C: ClusterClient> Botanist<C> {
    /// Returns a deployer for the etcd of the given role.
    pub fn default_etcd(&self, role: &str, class: Class) -> Etcd<C> {
        let mut values = Values::new(role, class);
        values.replicas = if self.shoot.hibernation_enabled() {
            None
        } else if self.high_availability_enabled() {
            Some(3)
        } else {
            Some(1)
        };
        if role == ROLE_MAIN {
            values.storage_capacity = "25Gi".to_string();
        }
        let time_window = self
            .shoot
            .spec
            .maintenance
            .as_ref()
            .and_then(|m| m.time_window.clone())
            .unwrap_or_default();
        values.defragmentation_schedule = Some(defragmentation_schedule(&time_window.begin));
        values.priority_class_name = PRIORITY_CLASS_NAME.to_string();
        values.high_availability_enabled = self.high_availability_enabled();

        let features = &self.options.features;
        let hvpa_enabled = if self.options.managed_seed.is_some() {
            features.enabled(HVPA_FOR_SHOOTED_SEED)
        } else {
            features.enabled(HVPA)
        };
        let scale_down_update_mode = if self.has_annotation(SHOOT_ALPHA_CONTROL_PLANE_SCALE_DOWN_DISABLED) {
            "Off"
        } else if class == Class::Important && self.shoot.purpose() == SHOOT_PURPOSE_PRODUCTION {
            "MaintenanceWindow"
        } else {
            "Auto"
        };

        let mut etcd = Etcd::new(self.seed_client.clone(), self.seed_namespace.clone(), values);
        etcd.set_hvpa_config(Some(HvpaConfig {
            enabled: hvpa_enabled,
            maintenance_time_window: time_window,
            scale_down_update_mode: Some(scale_down_update_mode.to_string()),
        }));
        if role == ROLE_MAIN {
            etcd.set_backup_config(self.options.backup.clone());
        }
        etcd
    }

    /// Deploys both etcds in parallel.
    pub async fn deploy_etcd(&self) -> Result<()> {
        let components = self.components()?;
        try_join(components.etcd_main.deploy(), components.etcd_events.deploy()).await?;
        Ok(())
    }

    /// Waits until both etcds report readiness.
    pub async fn wait_until_etcds_ready(&self) -> Result<()> {
        let components = self.components()?;
        try_join(components.etcd_main.wait(), components.etcd_events.wait()).await?;
        Ok(())
    }

    /// Deletes both etcds and waits until they are gone.
    pub async fn destroy_etcd(&self) -> Result<()> {
        let components = self.components()?;
        try_join(components.etcd_main.destroy(), components.etcd_events.destroy()).await?;
        try_join(
            components.etcd_main.wait_cleanup(),
            components.etcd_events.wait_cleanup(),
        )
        .await?;
        Ok(())
    }

    /// Scales both etcds, e.g. to zero when hibernating.
    pub async fn scale_etcd(&self, replicas: i32) -> Result<()> {
        let components = self.components()?;
        try_join(
            components.etcd_main.scale(replicas),
            components.etcd_events.scale(replicas),
        )
        .await?;
        info!(namespace = %self.seed_namespace, replicas, "Scaled etcds");
        Ok(())
    }
}
