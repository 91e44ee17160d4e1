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

//! Cluster client abstraction.
//!
//! Components and reconcilers talk to clusters exclusively through
//! [`ClusterClient`], which is implemented on top of [`kube::Client`] for real
//! clusters and by [`fake::FakeClusterClient`] for tests.

use std::fmt::Debug;

use async_trait::async_trait;
use futures::stream::BoxStream;
use kube::runtime::watcher;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

pub mod fake;
mod kube_client;

pub use kube_client::KubeClusterClient;

/// A typed Kubernetes object which can be read and written through a
/// [`ClusterClient`].
pub trait Object:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> Object for T where
    T: Resource<DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Errors returned by cluster clients.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The object does not exist.
    #[error("{kind} {name:?} not found")]
    NotFound {
        /// Kind of the object.
        kind: String,
        /// Object name.
        name: String,
    },

    /// An object with the same name exists.
    #[error("{kind} {name:?} already exists")]
    AlreadyExists {
        /// Kind of the object.
        kind: String,
        /// Object name.
        name: String,
    },

    /// The object was changed since it was read.
    #[error("operation cannot be fulfilled on {kind} {name:?}: {message}")]
    Conflict {
        /// Kind of the object.
        kind: String,
        /// Object name.
        name: String,
        /// Message of the API server.
        message: String,
    },

    /// The request was denied.
    #[error("{message}")]
    Forbidden {
        /// Message of the API server.
        message: String,
    },

    /// Any other API failure.
    #[error(transparent)]
    Api(#[from] kube::Error),

    /// An object could not be converted to or from JSON.
    #[error("failed to convert object: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A failure injected by the fake client.
    #[error("{0}")]
    Injected(String),
}

impl ClientError {
    /// Returns true if the error indicates a missing object.
    pub fn is_not_found(&self) -> bool {
        match self {
            ClientError::NotFound { .. } => true,
            ClientError::Api(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// Returns true if the error indicates an already existing object.
    pub fn is_already_exists(&self) -> bool {
        match self {
            ClientError::AlreadyExists { .. } => true,
            ClientError::Api(kube::Error::Api(resp)) => {
                resp.code == 409 && resp.reason == "AlreadyExists"
            }
            _ => false,
        }
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Watch events of objects of kind `K`, as consumed by
/// [`kube::runtime::reflector`].
pub type WatchStream<K> = BoxStream<'static, std::result::Result<watcher::Event<K>, watcher::Error>>;

/// Read and write access to a single cluster.
///
/// `namespace` is `None` for cluster-scoped objects and for listing across
/// all namespaces.
#[async_trait]
pub trait ClusterClient: Clone + Send + Sync + 'static {
    /// Reads a single object.
    async fn get<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<K>;

    /// Lists objects, optionally filtered by an equality-based label selector
    /// (`key=value,other=value`).
    async fn list<K: Object>(
        &self,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<K>>;

    /// Creates a new object. Fails with [`ClientError::AlreadyExists`] if it
    /// exists.
    async fn create<K: Object>(&self, obj: &K) -> Result<K>;

    /// Creates or updates an object via server-side apply.
    async fn apply<K: Object>(&self, obj: &K) -> Result<K>;

    /// Applies a JSON merge patch to an object.
    async fn patch_merge<K: Object>(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<K>;

    /// Applies a JSON merge patch to the status subresource of an object.
    async fn patch_status_merge<K: Object>(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<K>;

    /// Deletes an object.
    async fn delete<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<()>;

    /// Watches objects of kind `K`. The stream starts with the current state
    /// (`Init`, `InitApply`..., `InitDone`) and then follows every change.
    ///
    /// `field_selector` is an equality-based selector on object fields, e.g.
    /// `metadata.name=foo`.
    fn watch<K: Object>(&self, namespace: Option<&str>, field_selector: Option<&str>) -> WatchStream<K>;
}

/// Reads an object, mapping "not found" to `None`.
pub async fn get_opt<K: Object, C: ClusterClient>(
    client: &C,
    namespace: Option<&str>,
    name: &str,
) -> Result<Option<K>> {
    match client.get::<K>(namespace, name).await {
        Ok(obj) => Ok(Some(obj)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Deletes an object, ignoring "not found" errors.
pub async fn delete_ignore_not_found<K: Object, C: ClusterClient>(
    client: &C,
    namespace: Option<&str>,
    name: &str,
) -> Result<()> {
    match client.delete::<K>(namespace, name).await {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

/// Returns the lowercase kind of `K`, used in error messages and keys.
pub fn kind_of<K: Object>() -> String {
    K::kind(&()).to_lowercase()
}
