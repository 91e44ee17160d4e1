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

//! Controller manager - runs the registered controllers of one component.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::client::ClusterClient;
use crate::controller::{Controller, ControllerError, Result};
use crate::controller_context::ControllerContext;
use crate::controller_descriptor::{ControllerDescriptor, ControllerRegistry};
use crate::health::{FunctionHealthChecker, HealthRegistry};
use crate::leader_election::LeaderElector;

/// The controller manager.
///
/// It builds every enabled controller from its registry, optionally waits to
/// become leader, runs the controllers concurrently and shuts them down
/// gracefully once its token is cancelled.
pub struct ControllerManager<C: ClusterClient> {
    ctx: ControllerContext<C>,

    registry: ControllerRegistry<C>,

    leader_elector: Option<LeaderElector<C>>,

    health: Option<HealthRegistry>,

    shutdown_token: CancellationToken,

    running_controllers: Arc<RwLock<HashSet<String>>>,
}

impl<C: ClusterClient> ControllerManager<C> {
    /// Creates a manager with an empty registry and no leader election.
    pub fn new(ctx: ControllerContext<C>) -> Self {
        Self {
            ctx,
            registry: ControllerRegistry::new(),
            leader_elector: None,
            health: None,
            shutdown_token: CancellationToken::new(),
            running_controllers: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    /// Only runs the controllers while holding the given lease.
    pub fn with_leader_election(mut self, elector: LeaderElector<C>) -> Self {
        self.leader_elector = Some(elector);
        self
    }

    /// Registers a readiness check per built controller.
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Adds a controller descriptor to the registry.
    pub fn add(&mut self, descriptor: ControllerDescriptor<C>) -> Result<&mut Self> {
        self.registry.register(descriptor)?;
        Ok(self)
    }

    /// Shared context handed to controller constructors.
    pub fn context(&self) -> &ControllerContext<C> {
        &self.ctx
    }

    /// Registered controller descriptors.
    pub fn registry(&self) -> &ControllerRegistry<C> {
        &self.registry
    }

    /// Returns the root cancellation token. Cancelling it stops the manager.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Initiates a graceful shutdown.
    pub fn shutdown(&self) {
        tracing::info!("Initiating graceful shutdown");
        self.shutdown_token.cancel();
    }

    /// Runs the manager until shutdown or until a controller fails.
    pub async fn run(&self) -> Result<()> {
        if let Some(elector) = &self.leader_elector {
            tracing::info!(identity = %self.ctx.identity, "Waiting for leader election");
            let acquired = elector
                .acquire(&self.shutdown_token)
                .await
                .map_err(|e| ControllerError::StartFailed {
                    name: "leader-election".to_string(),
                    source: e.into(),
                })?;
            if !acquired {
                return Ok(());
            }

            let elector = elector.clone();
            let token = self.shutdown_token.clone();
            tokio::spawn(async move {
                if let Err(e) = elector.renew_until_lost(&token).await {
                    tracing::error!(error = %e, "Leader election lost");
                }
                token.cancel();
            });
        }

        let controllers = self.build_controllers().await?;
        if controllers.is_empty() {
            tracing::warn!("No controllers enabled, exiting");
            return Ok(());
        }
        tracing::info!(count = controllers.len(), "Built controllers");

        if let Some(health) = &self.health {
            health.set_ready(true);
        }
        self.run_controllers(controllers).await
    }

    async fn build_controllers(&self) -> Result<Vec<Arc<dyn Controller<C>>>> {
        let mut controllers = Vec::new();

        for name in self.registry.controller_names() {
            let Some(descriptor) = self.registry.get(&name) else {
                continue;
            };
            let enabled = if descriptor.is_disabled_by_default() {
                self.ctx.config.controllers_enabled.contains(&name)
            } else {
                self.ctx.is_controller_enabled(&name)
            };
            if !enabled {
                tracing::debug!(controller = %name, "Controller is disabled");
                continue;
            }

            match descriptor
                .build_controller(
                    self.ctx.clone(),
                    self.shutdown_token.clone(),
                    self.ctx.feature_gate.as_ref(),
                )
                .await
            {
                Ok(Some(controller)) => {
                    tracing::info!(controller = %name, "Built controller");
                    if let Some(health) = &self.health {
                        let checked = controller.clone();
                        let checker = FunctionHealthChecker::new(name.clone(), move || {
                            let controller = checked.clone();
                            async move { controller.health_check().await }
                        });
                        health.register(Arc::new(checker)).await;
                    }
                    controllers.push(controller);
                }
                Ok(None) => {
                    tracing::debug!(controller = %name, "Controller not built");
                }
                Err(e) => {
                    tracing::error!(controller = %name, error = %e, "Failed to build controller");
                    return Err(ControllerError::StartFailed {
                        name,
                        source: Box::new(e),
                    });
                }
            }
        }

        Ok(controllers)
    }

    async fn run_controllers(&self, controllers: Vec<Arc<dyn Controller<C>>>) -> Result<()> {
        let start_interval = self.ctx.config.controller_start_interval;
        let mut join_set = JoinSet::new();

        for controller in controllers {
            let name = controller.name().to_string();
            let ctx = self.ctx.clone();
            let cancel = self.shutdown_token.clone();
            let running = self.running_controllers.clone();
            let delay = Duration::from_secs_f64(
                start_interval.as_secs_f64() * (1.0 + rand::random::<f64>()),
            );

            join_set.spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return (name, Ok(())),
                }

                tracing::info!(controller = %name, "Starting controller");
                running.write().await.insert(name.clone());
                let result = controller.run(ctx, cancel).await;
                running.write().await.remove(&name);

                if let Err(e) = controller.shutdown().await {
                    tracing::warn!(controller = %name, error = %e, "Controller shutdown failed");
                }
                match &result {
                    Ok(()) => tracing::info!(controller = %name, "Controller terminated"),
                    Err(e) => tracing::error!(controller = %name, error = %e, "Controller terminated with error"),
                }
                (name, result)
            });
        }

        tokio::select! {
            result = async {
                while let Some(joined) = join_set.join_next().await {
                    match joined {
                        Ok((name, Ok(()))) => {
                            tracing::debug!(controller = %name, "Controller finished");
                        }
                        Ok((name, Err(e))) => {
                            return Err(ControllerError::Runtime {
                                name,
                                source: e.into(),
                            });
                        }
                        Err(e) => {
                            return Err(ControllerError::Runtime {
                                name: "unknown".to_string(),
                                source: e.into(),
                            });
                        }
                    }
                }
                Ok(())
            } => {
                if result.is_err() {
                    self.shutdown_token.cancel();
                }
                self.drain(&mut join_set).await;
                result
            }
            _ = self.shutdown_token.cancelled() => {
                tracing::info!("Shutdown signal received, waiting for controllers to stop");
                self.drain(&mut join_set).await;
                Ok(())
            }
        }
    }

    /// Waits for remaining controllers until the shutdown timeout expires.
    async fn drain(&self, join_set: &mut JoinSet<(String, Result<()>)>) {
        let deadline = tokio::time::Instant::now() + self.ctx.config.shutdown_timeout;

        while !join_set.is_empty() {
            match tokio::time::timeout_at(deadline, join_set.join_next()).await {
                Ok(Some(Ok((name, Err(e))))) => {
                    tracing::warn!(controller = %name, error = %e, "Controller stopped with error");
                }
                Ok(Some(Err(e))) => tracing::warn!(error = %e, "Controller task failed"),
                Ok(Some(Ok(_))) => {}
                Ok(None) => break,
                Err(_) => {
                    let running = self.running_controllers.read().await;
                    tracing::warn!(
                        controllers = ?running.iter().collect::<Vec<_>>(),
                        "Shutdown timeout reached, controllers still running"
                    );
                    join_set.abort_all();
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fake::FakeClusterClient;
    use crate::controller_descriptor;
    use crate::config::ManagerConfig;
    use crate::controller::FunctionController;
    use crate::feature::MemoryFeatureGate;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn context(controllers: &str) -> ControllerContext<FakeClusterClient> {
        let mut config = ManagerConfig {
            controller_start_interval: Duration::ZERO,
            shutdown_timeout: Duration::from_secs(1),
            ..Default::default()
        };
        config.set_controllers(controllers);
        ControllerContext::new(
            FakeClusterClient::new(),
            None,
            Arc::new(config),
            Arc::new(MemoryFeatureGate::gardener()),
            "test",
        )
    }

    fn counting(name: &'static str, runs: Arc<AtomicUsize>) -> ControllerDescriptor<FakeClusterClient> {
        controller_descriptor::builder(name).build(Arc::new(move |_, _| {
            let runs = runs.clone();
            Box::pin(async move {
                let controller = FunctionController::new(name, move |_, cancel: CancellationToken| {
                    let runs = runs.clone();
                    async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        cancel.cancelled().await;
                        Ok(())
                    }
                });
                Ok(Some(Arc::new(controller) as Arc<dyn Controller<FakeClusterClient>>))
            })
        }))
    }

    #[tokio::test]
    async fn test_runs_enabled_controllers_until_shutdown() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut manager = ControllerManager::new(context("*,-b"));
        manager.add(counting("a", runs.clone())).unwrap();
        manager.add(counting("b", runs.clone())).unwrap();

        let token = manager.shutdown_token();
        let handle = tokio::spawn(async move { manager.run().await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();

        handle.await.unwrap().unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_controller_failure_stops_manager() {
        let mut manager = ControllerManager::new(context("*"));
        manager
            .add(controller_descriptor::builder("failing").build(Arc::new(|_, _| {
                Box::pin(async {
                    let controller = FunctionController::new("failing", |_, _| async {
                        Err(ControllerError::InvalidConfig {
                            name: "failing".to_string(),
                            reason: "boom".to_string(),
                        })
                    });
                    Ok(Some(Arc::new(controller) as Arc<dyn Controller<FakeClusterClient>>))
                })
            })))
            .unwrap();

        let err = manager.run().await.unwrap_err();
        assert!(matches!(err, ControllerError::Runtime { name, .. } if name == "failing"));
        assert!(manager.shutdown_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_disabled_by_default_requires_explicit_enable() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut manager = ControllerManager::new(context("*"));
        let descriptor = controller_descriptor::builder("optional")
            .disabled_by_default()
            .build(Arc::new(|_, _| Box::pin(async { Ok(None) })));
        manager.add(descriptor).unwrap();
        manager.add(counting("a", runs.clone())).unwrap();

        assert_eq!(manager.build_controllers().await.unwrap().len(), 1);
    }
}
