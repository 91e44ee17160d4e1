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

//! Control plane components.
//!
//! Every component translates a typed `Values` struct into Kubernetes objects
//! and exposes the same lifecycle:
//!
//! 1. [`Deployer::deploy`] renders and applies the desired objects
//! 2. [`Waiter::wait`] blocks until the applied objects are healthy
//! 3. [`Deployer::destroy`] deletes everything the component owns
//! 4. [`Waiter::wait_cleanup`] blocks until the objects are gone
//!
//! Components never talk to the API server directly but through a
//! [`ClusterClient`](crate::client::ClusterClient), so they can be exercised
//! against the in-memory fake client in tests.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

use crate::client::ClientError;
use crate::utils::retry::RetryError;

pub mod etcd;
pub mod kubeapiserver;
pub mod managedresources;
pub mod nodeexporter;

/// Errors returned by components.
#[derive(Debug, Error)]
pub enum Error {
    /// A request to the cluster failed.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// A readiness wait gave up.
    #[error(transparent)]
    Retry(#[from] RetryError),

    /// An object could not be rendered.
    #[error("failed to render {kind} {name:?}: {source}")]
    Render {
        /// Kind of the object.
        kind: String,
        /// Name of the object.
        name: String,
        /// Rendering error.
        #[source]
        source: serde_yaml::Error,
    },

    /// The configuration is invalid.
    #[error("{0}")]
    Invalid(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Client(ClientError::Serialization(err))
    }
}

/// Result type for component operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Creates and deletes the objects of a component.
#[async_trait]
pub trait Deployer: Send + Sync {
    /// Renders and applies all objects of the component.
    async fn deploy(&self) -> Result<()>;

    /// Deletes all objects of the component.
    async fn destroy(&self) -> Result<()>;
}

/// Waits for the objects of a component to become healthy or disappear.
#[async_trait]
pub trait Waiter: Send + Sync {
    /// Waits until the deployed objects are healthy.
    async fn wait(&self) -> Result<()>;

    /// Waits until the deleted objects are gone.
    async fn wait_cleanup(&self) -> Result<()>;
}

/// A component that can be deployed, destroyed and waited for.
pub trait DeployWaiter: Deployer + Waiter {}

impl<T: Deployer + Waiter> DeployWaiter for T {}

/// Destroys `component` and waits until its objects are gone.
pub async fn destroy_and_wait<D: DeployWaiter + ?Sized>(component: &D) -> Result<()> {
    component.destroy().await?;
    component.wait_cleanup().await
}

/// Source of the current time, replaceable in tests.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// The wall clock.
pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

/// Formats a time the way operation timestamps are written into annotations,
/// e.g. `2025-01-02T03:04:05.123Z`.
pub fn format_timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}
