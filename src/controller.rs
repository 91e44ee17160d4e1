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

//! The [`Controller`] trait run by the [`ControllerManager`](crate::controller_manager::ControllerManager).

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;

pub use tokio_util::sync::CancellationToken;

use crate::client::ClusterClient;
use crate::controller_context::ControllerContext;

/// Errors that can occur when registering or running a controller.
#[derive(Error, Debug)]
pub enum ControllerError {
    /// The controller could not be started.
    #[error("controller {name} failed to start: {source}")]
    StartFailed {
        /// Controller name.
        name: String,
        /// Cause.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The controller failed while running.
    #[error("controller {name} runtime error: {source}")]
    Runtime {
        /// Controller name.
        name: String,
        /// Cause.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The controller could not be added to the manager.
    #[error("failed adding {name} controller: {source}")]
    AddFailed {
        /// Controller name.
        name: String,
        /// Cause.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A controller with the same name or alias exists.
    #[error("controller {0:?} is already registered")]
    AlreadyRegistered(String),

    /// The controller configuration is invalid.
    #[error("invalid configuration for controller {name}: {reason}")]
    InvalidConfig {
        /// Controller name.
        name: String,
        /// What is wrong.
        reason: String,
    },
}

/// Result type for controller operations.
pub type Result<T> = std::result::Result<T, ControllerError>;

/// A control loop of the gardenlet or the node agent.
///
/// Built from a [`ControllerDescriptor`](crate::controller_descriptor::ControllerDescriptor),
/// run until its token is cancelled and shut down afterwards.
#[async_trait]
pub trait Controller<C: ClusterClient>: Send + Sync + 'static {
    /// Returns the canonical name of this controller, used in logs and
    /// health checks.
    fn name(&self) -> &str;

    /// Runs the controller's main loop until `cancel` is triggered or a fatal
    /// error occurs.
    async fn run(&self, ctx: ControllerContext<C>, cancel: CancellationToken) -> Result<()>;

    /// Reported through `/readyz`.
    fn health_check(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(async { true })
    }

    /// Called after the main loop exits.
    fn shutdown(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }

    /// Maximum number of concurrent reconciliations.
    fn worker_count(&self) -> usize {
        1
    }
}

/// Resolves once `cancel` is triggered, for
/// [`kube::runtime::Controller::graceful_shutdown_on`] which requires a `Sync`
/// future.
pub fn graceful_shutdown(cancel: &CancellationToken) -> impl Future<Output = ()> + Send + Sync + 'static {
    let (tx, rx) = futures::channel::oneshot::channel::<()>();
    let cancel = cancel.clone();
    tokio::spawn(async move {
        cancel.cancelled().await;
        let _ = tx.send(());
    });
    rx.map(|_| ())
}

/// [`Controller`] running a closure, mostly for small loops and tests.
pub struct FunctionController<F> {
    name: String,
    run_fn: F,
    worker_count: usize,
}

impl<F> FunctionController<F> {
    /// Creates a controller named `name` running `run_fn`.
    pub fn new(name: impl Into<String>, run_fn: F) -> Self {
        Self {
            name: name.into(),
            run_fn,
            worker_count: 1,
        }
    }

    /// Workers reported through [`Controller::worker_count`].
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }
}

impl<F> fmt::Debug for FunctionController<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionController")
            .field("name", &self.name)
            .field("worker_count", &self.worker_count)
            .finish()
    }
}

#[async_trait]
impl<C, F, Fut> Controller<C> for FunctionController<F>
where
    C: ClusterClient,
    F: Fn(ControllerContext<C>, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: ControllerContext<C>, cancel: CancellationToken) -> Result<()> {
        (self.run_fn)(ctx, cancel).await
    }

    fn worker_count(&self) -> usize {
        self.worker_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fake::FakeClusterClient;

    fn noop(
        _: ControllerContext<FakeClusterClient>,
        _: CancellationToken,
    ) -> impl Future<Output = Result<()>> + Send + 'static {
        async { Ok(()) }
    }

    #[test]
    fn test_function_controller() {
        let controller = FunctionController::new("test", noop).with_worker_count(5);
        assert_eq!(Controller::<FakeClusterClient>::name(&controller), "test");
        assert_eq!(Controller::<FakeClusterClient>::worker_count(&controller), 5);
    }

    #[tokio::test]
    async fn test_graceful_shutdown() {
        let cancel = CancellationToken::new();
        let mut shutdown = Box::pin(graceful_shutdown(&cancel));
        assert!(futures::poll!(shutdown.as_mut()).is_pending());

        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), shutdown)
            .await
            .unwrap();
    }

    #[test]
    fn test_add_failed_message() {
        let err = ControllerError::AddFailed {
            name: "Shoot".to_string(),
            source: "boom".into(),
        };
        assert_eq!(err.to_string(), "failed adding Shoot controller: boom");
    }
}
