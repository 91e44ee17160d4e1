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

//! Rejects deletions of shoots, projects and shoot states that were not
//! confirmed with the `confirmation.gardener.cloud/deletion` annotation.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;

use crate::apis::core::{Project, Shoot, ShootState};
use crate::client::{ClusterClient, Object};
use crate::utils::check_if_deletion_is_confirmed;

use super::{
    AdmissionError, AdmissionResult, Attributes, Factory, Handler, Interface, Operation,
    PluginContext, ReadyFunc, ValidationInterface,
};

/// Name under which the plugin is registered.
pub const PLUGIN_NAME: &str = "DeletionConfirmation";

const GROUP: &str = "core.gardener.cloud";

/// Factory for [`Plugins`](super::Plugins) registration.
pub fn factory<C: ClusterClient>() -> Factory<C> {
    Arc::new(|ctx: &PluginContext<C>| {
        let plugin = DeletionConfirmation::new(ctx.ready_timeout);
        plugin.set_cache_client(ctx.cache_client.clone());
        plugin.set_live_client(ctx.live_client.clone());
        if let Some(ready) = &ctx.ready_func {
            plugin.set_ready_func(ready.clone());
        }
        Ok(Arc::new(plugin) as Arc<dyn ValidationInterface>)
    })
}

/// Allows deleting shoots, projects and shoot states only when the object
/// carries the deletion confirmation annotation.
///
/// The cache client is asked first. A live read follows when the object is
/// missing from the cache or not confirmed there.
pub struct DeletionConfirmation<C> {
    handler: Handler,
    cache_client: RwLock<Option<C>>,
    live_client: RwLock<Option<C>>,
}

impl<C: ClusterClient> DeletionConfirmation<C> {
    /// Creates the plugin. Requests wait up to `ready_timeout` for the cache.
    pub fn new(ready_timeout: Duration) -> Self {
        Self {
            handler: Handler::new([Operation::Delete]).with_ready_timeout(ready_timeout),
            cache_client: RwLock::new(None),
            live_client: RwLock::new(None),
        }
    }

    /// Client serving cached reads.
    pub fn set_cache_client(&self, client: C) {
        if let Ok(mut c) = self.cache_client.write() {
            *c = Some(client);
        }
    }

    /// Client reading directly from the API server.
    pub fn set_live_client(&self, client: C) {
        if let Ok(mut c) = self.live_client.write() {
            *c = Some(client);
        }
    }

    /// Reports whether the cache has synced.
    pub fn set_ready_func(&self, f: ReadyFunc) {
        self.handler.set_ready_func(f);
    }

    fn clients(&self) -> AdmissionResult<(C, C)> {
        let cache = self.cache_client.read().ok().and_then(|c| c.clone());
        let live = self.live_client.read().ok().and_then(|c| c.clone());
        match (cache, live) {
            (Some(cache), Some(live)) => Ok((cache, live)),
            _ => Err(AdmissionError::Internal("plugin is not initialized".to_string())),
        }
    }

    async fn validate_kind<K: Object>(&self, attrs: &Attributes, namespaced: bool) -> AdmissionResult<()> {
        if !self.handler.wait_for_ready().await {
            return Err(AdmissionError::forbidden(attrs, "not yet ready to handle request"));
        }
        let (cache, live) = self.clients()?;
        let namespace = if namespaced { attrs.namespace() } else { None };

        // DELETECOLLECTION requests arrive with an empty name. They are only
        // allowed if every object of the kind is confirmed.
        if attrs.name.is_empty() {
            let objects: Vec<K> = cache
                .list(namespace, None)
                .await
                .map_err(|e| AdmissionError::Internal(e.to_string()))?;

            let results = join_all(objects.iter().map(|obj| {
                let attrs = attrs.with_name(obj.meta().name.clone().unwrap_or_default());
                let (cache, live) = (&cache, &live);
                async move { validate_named::<K, C>(cache, live, namespace, &attrs).await }
            }))
            .await;

            let errors: Vec<String> = results
                .into_iter()
                .filter_map(|r| r.err())
                .map(|e| e.to_string())
                .collect();
            return match errors.len() {
                0 => Ok(()),
                n => Err(AdmissionError::forbidden(
                    attrs,
                    format!("{n} error(s) occurred: [{}]", errors.join(", ")),
                )),
            };
        }

        validate_named::<K, C>(&cache, &live, namespace, attrs).await
    }
}

/// Validates a single object. The cached copy is enough to accept, rejecting
/// requires a live read.
async fn validate_named<K: Object, C: ClusterClient>(
    cache: &C,
    live: &C,
    namespace: Option<&str>,
    attrs: &Attributes,
) -> AdmissionResult<()> {
    match cache.get::<K>(namespace, &attrs.name).await {
        Ok(obj) if check_if_deletion_is_confirmed(obj.meta()).is_ok() => return Ok(()),
        Ok(_) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(AdmissionError::from_client(attrs, e)),
    }

    let obj = live
        .get::<K>(namespace, &attrs.name)
        .await
        .map_err(|e| AdmissionError::from_client(attrs, e))?;
    check_if_deletion_is_confirmed(obj.meta()).map_err(|reason| AdmissionError::forbidden(attrs, reason))
}

impl<C: ClusterClient> Interface for DeletionConfirmation<C> {
    fn handles(&self, operation: Operation) -> bool {
        self.handler.handles(operation)
    }
}

#[async_trait]
impl<C: ClusterClient> ValidationInterface for DeletionConfirmation<C> {
    async fn validate(&self, attrs: &Attributes) -> AdmissionResult<()> {
        if attrs.kind.group != GROUP {
            return Ok(());
        }
        match attrs.kind.kind.as_str() {
            "Shoot" => self.validate_kind::<Shoot>(attrs, true).await,
            "Project" => self.validate_kind::<Project>(attrs, false).await,
            "ShootState" => self.validate_kind::<ShootState>(attrs, true).await,
            _ => Ok(()),
        }
    }

    fn validate_initialization(&self) -> Result<(), String> {
        if self.cache_client.read().map(|c| c.is_none()).unwrap_or(true) {
            return Err("missing cache client".to_string());
        }
        if self.live_client.read().map(|c| c.is_none()).unwrap_or(true) {
            return Err("missing gardener core client".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::constants::CONFIRMATION_DELETION;
    use crate::apis::core::{ProjectSpec, ShootSpec};
    use crate::client::fake::{FakeClusterClient, Verb};
    use kube::api::ObjectMeta;
    use kube::core::GroupVersionKind;
    use std::collections::BTreeMap;

    fn meta(name: &str, namespace: Option<&str>, confirmed: bool) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: namespace.map(str::to_string),
            annotations: confirmed.then(|| {
                BTreeMap::from([(CONFIRMATION_DELETION.to_string(), "true".to_string())])
            }),
            ..Default::default()
        }
    }

    fn shoot(name: &str, confirmed: bool) -> Shoot {
        Shoot {
            metadata: meta(name, Some("garden-dev"), confirmed),
            spec: ShootSpec::default(),
            status: None,
        }
    }

    fn attrs(kind: &str, resource: &str, namespace: &str, name: &str) -> Attributes {
        Attributes::new(
            GroupVersionKind::gvk(GROUP, "v1beta1", kind),
            resource,
            namespace,
            name,
            Operation::Delete,
        )
    }

    fn plugin(cache: &FakeClusterClient, live: &FakeClusterClient) -> DeletionConfirmation<FakeClusterClient> {
        let plugin = DeletionConfirmation::new(Duration::from_millis(200));
        plugin.set_cache_client(cache.clone());
        plugin.set_live_client(live.clone());
        plugin
    }

    #[test]
    fn test_handles_only_delete() {
        let plugin = DeletionConfirmation::<FakeClusterClient>::new(Duration::ZERO);
        assert!(plugin.handles(Operation::Delete));
        assert!(!plugin.handles(Operation::Create));
        assert!(!plugin.handles(Operation::Update));
    }

    #[test]
    fn test_validate_initialization() {
        let plugin = DeletionConfirmation::<FakeClusterClient>::new(Duration::ZERO);
        assert_eq!(plugin.validate_initialization().unwrap_err(), "missing cache client");
        plugin.set_cache_client(FakeClusterClient::new());
        assert_eq!(plugin.validate_initialization().unwrap_err(), "missing gardener core client");
        plugin.set_live_client(FakeClusterClient::new());
        assert!(plugin.validate_initialization().is_ok());
    }

    #[tokio::test]
    async fn test_ignores_other_kinds() {
        let client = FakeClusterClient::new();
        let plugin = plugin(&client, &client);
        let other = Attributes::new(
            GroupVersionKind::gvk("", "v1", "Namespace"),
            "namespaces",
            "",
            "foo",
            Operation::Delete,
        );
        assert!(plugin.validate(&other).await.is_ok());
        assert!(plugin
            .validate(&attrs("Seed", "seeds", "", "foo"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_not_ready() {
        let client = FakeClusterClient::new();
        let plugin = plugin(&client, &client);
        plugin.set_ready_func(Arc::new(|| false));

        let err = plugin
            .validate(&attrs("Shoot", "shoots", "garden-dev", "foo"))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"shoots.core.gardener.cloud "foo" is forbidden: not yet ready to handle request"#
        );
    }

    #[tokio::test]
    async fn test_factory_waits_for_cache_sync() {
        let client = FakeClusterClient::new();
        let ctx = PluginContext {
            cache_client: client.clone(),
            live_client: client,
            ready_func: Some(Arc::new(|| false)),
            ready_timeout: Duration::ZERO,
        };
        let plugin = factory()(&ctx).unwrap();

        let err = plugin
            .validate(&attrs("Shoot", "shoots", "garden-dev", "foo"))
            .await
            .unwrap_err();
        assert!(err.to_string().ends_with("not yet ready to handle request"), "{err}");
    }

    #[tokio::test]
    async fn test_confirmed_in_cache() {
        let cache = FakeClusterClient::new();
        let live = FakeClusterClient::new();
        cache.create(&shoot("foo", true)).await.unwrap();
        live.fail_on::<Shoot>(Verb::Get).await;

        let plugin = plugin(&cache, &live);
        assert!(plugin
            .validate(&attrs("Shoot", "shoots", "garden-dev", "foo"))
            .await
            .is_ok());
        assert!(live.actions().await.is_empty());
    }

    #[tokio::test]
    async fn test_live_lookup_fallback() {
        let cache = FakeClusterClient::new();
        let live = FakeClusterClient::new();
        cache.create(&shoot("foo", false)).await.unwrap();
        live.create(&shoot("foo", true)).await.unwrap();
        let plugin = plugin(&cache, &live);
        assert!(plugin
            .validate(&attrs("Shoot", "shoots", "garden-dev", "foo"))
            .await
            .is_ok());

        // Not yet in the cache at all.
        live.create(&shoot("bar", true)).await.unwrap();
        assert!(plugin
            .validate(&attrs("Shoot", "shoots", "garden-dev", "bar"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_unconfirmed_is_forbidden() {
        let client = FakeClusterClient::new();
        client.create(&shoot("foo", false)).await.unwrap();
        let plugin = plugin(&client, &client);

        let err = plugin
            .validate(&attrs("Shoot", "shoots", "garden-dev", "foo"))
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::Forbidden { .. }));
        assert!(err.to_string().contains("annotation to delete"));
    }

    #[tokio::test]
    async fn test_missing_object() {
        let client = FakeClusterClient::new();
        let plugin = plugin(&client, &client);
        let err = plugin
            .validate(&attrs("ShootState", "shootstates", "garden-dev", "foo"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            AdmissionError::NotFound {
                resource: "shootstates.core.gardener.cloud".to_string(),
                name: "foo".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_cache_error_propagates() {
        let cache = FakeClusterClient::new();
        let live = FakeClusterClient::new();
        cache.fail_on::<Shoot>(Verb::Get).await;
        live.create(&shoot("foo", true)).await.unwrap();

        let err = plugin(&cache, &live)
            .validate(&attrs("Shoot", "shoots", "garden-dev", "foo"))
            .await
            .unwrap_err();
        assert_eq!(err, AdmissionError::Internal("fake err".to_string()));
    }

    #[tokio::test]
    async fn test_cluster_scoped_project() {
        let client = FakeClusterClient::new();
        let project = Project {
            metadata: meta("dev", None, true),
            spec: ProjectSpec::default(),
        };
        client.create(&project).await.unwrap();

        assert!(plugin(&client, &client)
            .validate(&attrs("Project", "projects", "", "dev"))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_delete_collection() {
        let client = FakeClusterClient::new();
        client.create(&shoot("foo", true)).await.unwrap();
        client.create(&shoot("bar", true)).await.unwrap();
        let plugin = plugin(&client, &client);
        let collection = attrs("Shoot", "shoots", "garden-dev", "");
        assert!(plugin.validate(&collection).await.is_ok());

        client.create(&shoot("baz", false)).await.unwrap();
        client.create(&shoot("qux", false)).await.unwrap();
        let err = plugin.validate(&collection).await.unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with(r#"shoots.core.gardener.cloud "" is forbidden: 2 error(s) occurred"#));
        assert!(message.contains(r#""baz""#));
        assert!(message.contains(r#""qux""#));
    }

    #[tokio::test]
    async fn test_delete_collection_list_error() {
        let client = FakeClusterClient::new();
        client.fail_on::<Shoot>(Verb::List).await;
        let err = plugin(&client, &client)
            .validate(&attrs("Shoot", "shoots", "garden-dev", ""))
            .await
            .unwrap_err();
        assert!(matches!(err, AdmissionError::Internal(_)));
    }
}
