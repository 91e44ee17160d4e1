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

//! Controller context - shared resources for all controllers.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::client::ClusterClient;
use crate::config::ManagerConfig;
use crate::feature::FeatureGate;

/// Shared context for all controllers of a manager.
#[derive(Clone)]
pub struct ControllerContext<C> {
    /// Client of the cluster the controllers reconcile in (the seed for the
    /// gardenlet, the shoot for the node agent).
    pub client: C,

    /// Client of the garden cluster, if the component talks to it.
    pub garden_client: Option<C>,

    /// Configuration for this manager instance.
    pub config: Arc<ManagerConfig>,

    /// Feature gates of the component.
    pub feature_gate: Arc<dyn FeatureGate>,

    /// Identity of this process, used as leader election holder.
    pub identity: String,

    /// Function to generate jittered resync periods.
    pub resync_period_fn: Arc<dyn Fn(Duration) -> Duration + Send + Sync>,
}

impl<C: ClusterClient> ControllerContext<C> {
    /// Creates a new controller context.
    pub fn new(
        client: C,
        garden_client: Option<C>,
        config: Arc<ManagerConfig>,
        feature_gate: Arc<dyn FeatureGate>,
        identity: impl Into<String>,
    ) -> Self {
        Self {
            client,
            garden_client,
            config,
            feature_gate,
            identity: identity.into(),
            resync_period_fn: Arc::new(jitter),
        }
    }

    /// Returns a jittered resync period derived from `base`.
    pub fn resync_period(&self, base: Duration) -> Duration {
        (self.resync_period_fn)(base)
    }

    /// Checks if a controller with the given name is enabled.
    pub fn is_controller_enabled(&self, name: &str) -> bool {
        self.config.is_controller_enabled(name)
    }
}

/// Adds between 0 and 100% jitter to `base`, avoiding that all objects are
/// resynced at the same time.
pub fn jitter(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.0..1.0);
    Duration::from_secs_f64(base.as_secs_f64() * (1.0 + factor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fake::FakeClusterClient;
    use crate::feature::MemoryFeatureGate;

    #[test]
    fn test_jitter() {
        let base = Duration::from_secs(60);

        let mut periods = std::collections::HashSet::new();
        for _ in 0..10 {
            let period = jitter(base);
            assert!(period >= base && period < base * 2);
            periods.insert(period);
        }
        assert!(periods.len() > 1);
    }

    #[test]
    fn test_context_controller_enabled() {
        let mut config = ManagerConfig::default();
        config.set_controllers("*,-shoot");
        let ctx = ControllerContext::new(
            FakeClusterClient::new(),
            None,
            Arc::new(config),
            Arc::new(MemoryFeatureGate::gardener()),
            "test",
        );
        assert!(!ctx.is_controller_enabled("shoot"));
        assert!(ctx.is_controller_enabled("operatingsystemconfig"));

        let ctx = ControllerContext {
            resync_period_fn: Arc::new(|base| base),
            ..ctx
        };
        assert_eq!(ctx.resync_period(Duration::from_secs(5)), Duration::from_secs(5));
    }
}
