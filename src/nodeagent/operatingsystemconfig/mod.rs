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

//! The operating system config controller of the node agent.
//!
//! The controller watches the secret carrying the node's
//! `OperatingSystemConfig`. A new secret is applied right away. Changes are
//! applied after a per-node delay so that not all nodes of a shoot restart
//! their units at the same time.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::controller::{self, Action};
use kube::runtime::{reflector, Controller as RuntimeController, WatchStreamExt};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::apis::constants::NAMESPACE_SYSTEM;
use crate::apis::nodeagent::DATA_KEY_OPERATING_SYSTEM_CONFIG;
use crate::client::ClusterClient;
use crate::config::OperatingSystemConfigControllerConfig;
use crate::controller::{graceful_shutdown, CancellationToken, Controller, ControllerError, Result};
use crate::controller_context::ControllerContext;
use crate::controller_descriptor;
use crate::controller_manager::ControllerManager;

mod delayer;
pub mod reconciler;

pub use delayer::Delayer;
pub use reconciler::{Reconciler, SystemctlUnitManager, UnitManager};

/// Name of the operating system config controller.
pub const CONTROLLER_NAME: &str = "operatingsystemconfig";

/// Events observed for the watched secret.
#[derive(Debug, Clone, Copy)]
pub enum Event<'a> {
    /// The secret appeared.
    Create(&'a Secret),
    /// The secret changed.
    Update {
        /// The secret as seen before.
        old: &'a Secret,
        /// The secret as seen now.
        new: &'a Secret,
    },
    /// The secret was deleted.
    Delete(&'a Secret),
    /// Any other notification.
    Generic(&'a Secret),
}

fn osc_data(secret: &Secret) -> Option<&[u8]> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(DATA_KEY_OPERATING_SYSTEM_CONFIG))
        .map(|b| b.0.as_slice())
}

/// Create events pass. Updates pass only when the config data changed.
pub fn secret_predicate(event: &Event<'_>) -> bool {
    match event {
        Event::Create(_) => true,
        Event::Update { old, new } => osc_data(old) != osc_data(new),
        Event::Delete(_) | Event::Generic(_) => false,
    }
}

/// Hashes the config data, so that the watch only passes changes to it.
fn osc_data_hash(secret: &Secret) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    osc_data(secret).hash(&mut hasher);
    Some(hasher.finish())
}

struct State<C> {
    delayer: Delayer<C>,
    /// The secret as of the last passed event.
    last: Option<Secret>,
    /// When the last passed event has to be applied, unset once applied.
    due: Option<Instant>,
}

/// Shared state of all reconciliations.
struct Context<C, U> {
    reconciler: Arc<Reconciler<C, U>>,
    config: OperatingSystemConfigControllerConfig,
    node_name: String,
    state: Mutex<State<C>>,
}

impl<C: ClusterClient, U: UnitManager> Context<C, U> {
    fn new(reconciler: Arc<Reconciler<C, U>>, config: OperatingSystemConfigControllerConfig, node_name: String) -> Self {
        let delayer = Delayer::new(reconciler.client.clone(), Duration::ZERO, config.sync_jitter_period);
        Self {
            reconciler,
            config,
            node_name,
            state: Mutex::new(State {
                delayer,
                last: None,
                due: None,
            }),
        }
    }

    /// Returns the delay after which the event's secret should be applied,
    /// or `None` if the event is filtered out.
    async fn enqueue_delay(&self, event: &Event<'_>, delayer: &mut Delayer<C>) -> Option<Duration> {
        if !secret_predicate(event) {
            return None;
        }
        match event {
            Event::Create(_) => Some(Duration::ZERO),
            Event::Update { .. } => {
                let delay = delayer.compute(&self.node_name).await;
                tracing::info!(
                    duration = ?delay,
                    "Enqueued secret with operating system config with a jitter period"
                );
                Some(delay)
            }
            Event::Delete(_) | Event::Generic(_) => None,
        }
    }

    /// Records `secret` and returns how long until the pending change is due,
    /// `None` if nothing is pending.
    async fn due_in(&self, secret: &Secret) -> Option<Duration> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let delay = match state.last.as_ref() {
            None => self.enqueue_delay(&Event::Create(secret), &mut state.delayer).await,
            Some(old) => {
                self.enqueue_delay(&Event::Update { old, new: secret }, &mut state.delayer)
                    .await
            }
        };
        let now = Instant::now();
        if let Some(delay) = delay {
            let deadline = now + delay;
            // a pending change keeps its earlier deadline
            state.due = Some(state.due.map_or(deadline, |due| due.min(deadline)));
            state.last = Some(secret.clone());
        }
        state.due.map(|due| due.saturating_duration_since(now))
    }

    async fn applied(&self) {
        self.state.lock().await.due = None;
    }
}

async fn reconcile<C: ClusterClient, U: UnitManager>(
    secret: Arc<Secret>,
    ctx: Arc<Context<C, U>>,
) -> std::result::Result<Action, crate::nodeagent::Error> {
    match ctx.due_in(&secret).await {
        None => Ok(Action::await_change()),
        Some(delay) if !delay.is_zero() => Ok(Action::requeue(delay)),
        Some(_) => {
            let name = secret.metadata.name.as_deref().unwrap_or_default();
            ctx.reconciler.reconcile(NAMESPACE_SYSTEM, name).await?;
            ctx.applied().await;
            Ok(Action::await_change())
        }
    }
}

fn error_policy<C: ClusterClient, U: UnitManager>(
    secret: Arc<Secret>,
    err: &crate::nodeagent::Error,
    ctx: Arc<Context<C, U>>,
) -> Action {
    tracing::error!(
        secret = secret.metadata.name.as_deref().unwrap_or_default(),
        error = %err,
        "Reconciling operating system config failed"
    );
    Action::requeue(ctx.config.retry_interval)
}

/// Watches the node's operating system config secret and applies it, one
/// reconcile at a time. Updates are delayed by the node's spot in the jitter
/// period.
pub struct OperatingSystemConfigController<C, U> {
    reconciler: Arc<Reconciler<C, U>>,
    config: OperatingSystemConfigControllerConfig,
    node_name: String,
}

impl<C: ClusterClient, U: UnitManager> OperatingSystemConfigController<C, U> {
    /// Creates the controller for the node named `node_name`.
    pub fn new(reconciler: Reconciler<C, U>, config: OperatingSystemConfigControllerConfig, node_name: impl Into<String>) -> Self {
        Self {
            reconciler: Arc::new(reconciler),
            config,
            node_name: node_name.into(),
        }
    }
}

#[async_trait]
impl<C: ClusterClient, U: UnitManager> Controller<C> for OperatingSystemConfigController<C, U> {
    fn name(&self) -> &str {
        CONTROLLER_NAME
    }

    async fn run(&self, _ctx: ControllerContext<C>, cancel: CancellationToken) -> Result<()> {
        tracing::info!(secret = %self.config.secret_name, node = %self.node_name, "Starting operating system config controller");

        let (reader, writer) = reflector::store();
        let selector = format!("metadata.name={}", self.config.secret_name);
        let secrets = reflector(
            writer,
            self.reconciler.client.watch::<Secret>(Some(NAMESPACE_SYSTEM), Some(&selector)),
        )
        .applied_objects()
        .predicate_filter(osc_data_hash);
        let context = Arc::new(Context::new(
            self.reconciler.clone(),
            self.config.clone(),
            self.node_name.clone(),
        ));

        RuntimeController::for_stream(secrets, reader)
            .with_config(controller::Config::default().concurrency(1))
            .graceful_shutdown_on(graceful_shutdown(&cancel))
            .run(reconcile::<C, U>, error_policy::<C, U>, context)
            .for_each(|result| async move {
                match result {
                    Ok((secret, action)) => tracing::debug!(secret = %secret, ?action, "Reconciled operating system config"),
                    Err(controller::Error::ReconcilerFailed(..)) => {}
                    Err(err) => tracing::warn!(error = %err, "Operating system config controller error"),
                }
            })
            .await;
        Ok(())
    }
}

/// Registers the operating system config controller with the manager.
pub fn add_to_manager<C: ClusterClient>(
    manager: &mut ControllerManager<C>,
    config: OperatingSystemConfigControllerConfig,
    node_name: String,
) -> Result<()> {
    let descriptor = controller_descriptor::builder(CONTROLLER_NAME)
        .with_alias("osc")
        .build(Arc::new(move |ctx: ControllerContext<C>, _| {
            let config = config.clone();
            let node_name = node_name.clone();
            Box::pin(async move {
                if config.secret_name.is_empty() {
                    return Err(ControllerError::InvalidConfig {
                        name: CONTROLLER_NAME.to_string(),
                        reason: "secretName must be set".to_string(),
                    });
                }
                let reconciler = Reconciler::new(ctx.client.clone(), SystemctlUnitManager, config.root_dir.clone());
                Ok(Some(Arc::new(OperatingSystemConfigController::new(reconciler, config, node_name)) as Arc<dyn Controller<C>>))
            })
        }));
    manager.add(descriptor)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::reconciler::tests::{secret, FakeUnitManager};
    use super::*;
    use crate::apis::nodeagent::{File, FileContent, FileContentInline, OperatingSystemConfig};
    use crate::client::fake::FakeClusterClient;
    use k8s_openapi::api::core::v1::Node;
    use kube::api::ObjectMeta;

    fn osc(data: &str) -> OperatingSystemConfig {
        OperatingSystemConfig {
            files: vec![File {
                path: "/etc/foo".to_string(),
                permissions: None,
                content: FileContent {
                    inline: Some(FileContentInline {
                        encoding: String::new(),
                        data: data.to_string(),
                    }),
                },
            }],
            units: Vec::new(),
        }
    }

    fn config() -> OperatingSystemConfigControllerConfig {
        OperatingSystemConfigControllerConfig {
            secret_name: "osc-secret".to_string(),
            sync_jitter_period: Duration::from_secs(300),
            ..Default::default()
        }
    }

    #[test]
    fn test_secret_predicate() {
        let a = secret(&osc("a"));
        let b = secret(&osc("b"));
        let mut a_relabeled = a.clone();
        a_relabeled.metadata.labels = Some([("foo".to_string(), "bar".to_string())].into());

        assert!(secret_predicate(&Event::Create(&a)));
        assert!(secret_predicate(&Event::Update { old: &a, new: &b }));
        assert!(!secret_predicate(&Event::Update { old: &a, new: &a_relabeled }));
        assert!(!secret_predicate(&Event::Delete(&a)));
        assert!(!secret_predicate(&Event::Generic(&a)));
    }

    async fn client_with_nodes(names: &[&str]) -> FakeClusterClient {
        let client = FakeClusterClient::new();
        for name in names {
            client
                .create(&Node {
                    metadata: ObjectMeta {
                        name: Some(name.to_string()),
                        ..Default::default()
                    },
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        client
    }

    #[test]
    fn test_osc_data_hash_ignores_metadata() {
        let a = secret(&osc("a"));
        let mut relabeled = a.clone();
        relabeled.metadata.labels = Some([("foo".to_string(), "bar".to_string())].into());

        assert_eq!(osc_data_hash(&a), osc_data_hash(&relabeled));
        assert_ne!(osc_data_hash(&a), osc_data_hash(&secret(&osc("b"))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_is_due_immediately_and_update_after_delay() {
        let root = tempfile::tempdir().unwrap();
        let client = client_with_nodes(&["node-a", "node-b"]).await;
        let ctx = Context::new(
            Arc::new(Reconciler::new(client, FakeUnitManager::default(), root.path())),
            config(),
            "node-b".to_string(),
        );

        let first = secret(&osc("a"));
        assert_eq!(ctx.due_in(&first).await, Some(Duration::ZERO));
        ctx.applied().await;

        // Unchanged data is filtered.
        assert_eq!(ctx.due_in(&first).await, None);

        let second = secret(&osc("b"));
        assert_eq!(ctx.due_in(&second).await, Some(Duration::from_secs(150)));
        tokio::time::advance(Duration::from_secs(100)).await;
        assert_eq!(ctx.due_in(&second).await, Some(Duration::from_secs(50)));

        // A further change does not postpone the pending one.
        let third = secret(&osc("c"));
        assert_eq!(ctx.due_in(&third).await, Some(Duration::from_secs(50)));

        tokio::time::advance(Duration::from_secs(50)).await;
        assert_eq!(ctx.due_in(&third).await, Some(Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_applies_changed_config_after_node_delay() {
        let root = tempfile::tempdir().unwrap();
        let client = client_with_nodes(&["node-a", "node-b"]).await;
        client.create(&secret(&osc("hello"))).await.unwrap();
        let controller = OperatingSystemConfigController::new(
            Reconciler::new(client.clone(), FakeUnitManager::default(), root.path()),
            config(),
            "node-b",
        );
        let ctx = crate::controller_context::ControllerContext::new(
            client.clone(),
            None,
            Arc::new(crate::config::ManagerConfig::default()),
            Arc::new(crate::feature::MemoryFeatureGate::gardener()),
            "node-agent",
        );
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { controller.run(ctx, token).await });

        let path = root.path().join("etc/foo");
        let read = || std::fs::read_to_string(&path).unwrap_or_default();
        while read() != "hello" {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let changed = Instant::now();
        client.apply(&secret(&osc("world"))).await.unwrap();
        while read() != "world" {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        assert!(changed.elapsed() >= Duration::from_secs(150));

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_run_applies_config_until_cancelled() {
        let root = tempfile::tempdir().unwrap();
        let client = FakeClusterClient::new();
        client.create(&secret(&osc("hello"))).await.unwrap();
        let units = FakeUnitManager::default();
        let controller = Arc::new(OperatingSystemConfigController::new(
            Reconciler::new(client.clone(), units, root.path()),
            OperatingSystemConfigControllerConfig {
                retry_interval: Duration::from_millis(20),
                ..config()
            },
            "",
        ));
        let ctx = crate::controller_context::ControllerContext::new(
            client,
            None,
            Arc::new(crate::config::ManagerConfig::default()),
            Arc::new(crate::feature::MemoryFeatureGate::gardener()),
            "node-agent",
        );
        let cancel = CancellationToken::new();
        let handle = {
            let controller = controller.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { controller.run(ctx, cancel).await })
        };

        let path = root.path().join("etc/foo");
        for _ in 0..100 {
            if path.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello");

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
