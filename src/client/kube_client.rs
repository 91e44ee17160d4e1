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

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, GetParams, ListParams, Patch, PatchParams,
    PostParams,
};
use kube::runtime::reflector::{self, store::Writer, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use tracing::{debug, warn};

use super::{ClientError, ClusterClient, Object, Result, WatchStream};

/// Field manager used for server-side apply.
pub const FIELD_MANAGER: &str = "gardener";

/// A reflector mirroring all objects of one kind.
#[derive(Clone)]
struct Informer {
    resource: ApiResource,
    store: Store<DynamicObject>,
    synced: Arc<AtomicBool>,
}

impl Informer {
    fn start(client: Client, resource: ApiResource) -> Self {
        let writer = Writer::new(resource.clone());
        let store = writer.as_reader();
        let synced = Arc::new(AtomicBool::new(false));

        let api = Api::<DynamicObject>::all_with(client, &resource);
        let kind = resource.kind.clone();
        let events = reflector::reflector(writer, watcher(api, watcher::Config::default()).default_backoff());
        tokio::spawn(async move {
            events
                .for_each(|event| {
                    if let Err(err) = event {
                        warn!(kind = %kind, error = %err, "Watch for informer failed");
                    }
                    futures::future::ready(())
                })
                .await;
        });

        let ready = store.clone();
        let flag = synced.clone();
        let kind = resource.kind.clone();
        tokio::spawn(async move {
            if ready.wait_until_ready().await.is_ok() {
                debug!(kind = %kind, "Informer synced");
                flag.store(true, Ordering::SeqCst);
            }
        });

        Self { resource, store, synced }
    }

    fn has_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    fn get(&self, namespace: Option<&str>, name: &str) -> Option<Arc<DynamicObject>> {
        let mut key = ObjectRef::new_with(name, self.resource.clone());
        if let Some(ns) = namespace {
            key = key.within(ns);
        }
        self.store.get(&key)
    }

    fn list(&self, namespace: Option<&str>) -> Vec<Arc<DynamicObject>> {
        self.store
            .state()
            .into_iter()
            .filter(|obj| namespace.map_or(true, |ns| obj.metadata.namespace.as_deref() == Some(ns)))
            .collect()
    }
}

/// Informers of a cached client, one per kind, started on first use.
#[derive(Default)]
struct Informers {
    started: Mutex<HashMap<(String, String), Informer>>,
}

impl Informers {
    fn for_kind<K: Object>(&self, client: &Client) -> Option<Informer> {
        let resource = ApiResource::erase::<K>(&());
        let mut started = self.started.lock().ok()?;
        let informer = started
            .entry((resource.api_version.clone(), resource.kind.clone()))
            .or_insert_with(|| Informer::start(client.clone(), resource));
        Some(informer.clone())
    }

    fn has_synced(&self) -> bool {
        self.started
            .lock()
            .is_ok_and(|started| started.values().all(Informer::has_synced))
    }
}

/// [`ClusterClient`] backed by a [`kube::Client`].
///
/// A client created with [`KubeClusterClient::cached`] serves reads from
/// reflector stores which may lag behind the latest state. Until the store of
/// a kind has synced, its reads go to the API server's watch cache.
/// [`KubeClusterClient::new`] performs quorum reads.
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
    informers: Option<Arc<Informers>>,
    field_manager: String,
}

impl KubeClusterClient {
    /// Creates a client performing live reads.
    pub fn new(client: Client) -> Self {
        Self {
            client,
            informers: None,
            field_manager: FIELD_MANAGER.to_string(),
        }
    }

    /// Creates a client reading from informer caches.
    pub fn cached(client: Client) -> Self {
        Self {
            informers: Some(Arc::default()),
            ..Self::new(client)
        }
    }

    /// Overrides the server-side apply field manager.
    pub fn with_field_manager(mut self, field_manager: impl Into<String>) -> Self {
        self.field_manager = field_manager.into();
        self
    }

    /// Starts the informer for objects of kind `K` ahead of the first read.
    /// No-op for clients performing live reads.
    pub fn start_informer<K: Object>(&self) {
        if let Some(informers) = &self.informers {
            informers.for_kind::<K>(&self.client);
        }
    }

    /// Returns true once every started informer has listed its objects.
    pub fn has_synced(&self) -> bool {
        self.informers.as_ref().map_or(true, |i| i.has_synced())
    }

    fn synced_informer<K: Object>(&self) -> Option<Informer> {
        self.informers
            .as_ref()
            .and_then(|i| i.for_kind::<K>(&self.client))
            .filter(Informer::has_synced)
    }

    fn api<K: Object>(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        let resource = ApiResource::erase::<K>(&());
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        }
    }
}

fn map_err<K: Object>(name: &str, err: kube::Error) -> ClientError {
    match &err {
        kube::Error::Api(resp) if resp.code == 404 => ClientError::NotFound {
            kind: super::kind_of::<K>(),
            name: name.to_string(),
        },
        kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
            ClientError::AlreadyExists {
                kind: super::kind_of::<K>(),
                name: name.to_string(),
            }
        }
        kube::Error::Api(resp) if resp.code == 409 => ClientError::Conflict {
            kind: super::kind_of::<K>(),
            name: name.to_string(),
            message: resp.message.clone(),
        },
        kube::Error::Api(resp) if resp.code == 403 => ClientError::Forbidden {
            message: resp.message.clone(),
        },
        _ => ClientError::Api(err),
    }
}

fn from_dynamic<K: Object>(obj: DynamicObject) -> Result<K> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<K> {
        if let Some(informer) = self.synced_informer::<K>() {
            return match informer.get(namespace, name) {
                Some(obj) => from_dynamic(obj.as_ref().clone()),
                None => Err(ClientError::NotFound {
                    kind: super::kind_of::<K>(),
                    name: name.to_string(),
                }),
            };
        }
        let api = self.api::<K>(namespace);
        let obj = if self.informers.is_some() {
            api.get_with(name, &GetParams::any()).await
        } else {
            api.get(name).await
        }
        .map_err(|e| map_err::<K>(name, e))?;
        from_dynamic(obj)
    }

    async fn list<K: Object>(
        &self,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<K>> {
        if label_selector.is_none() {
            if let Some(informer) = self.synced_informer::<K>() {
                return informer
                    .list(namespace)
                    .into_iter()
                    .map(|obj| from_dynamic(obj.as_ref().clone()))
                    .collect();
            }
        }
        let mut params = ListParams::default();
        if self.informers.is_some() {
            params = params.match_any();
        }
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        let list = self
            .api::<K>(namespace)
            .list(&params)
            .await
            .map_err(|e| map_err::<K>("", e))?;
        list.items.into_iter().map(from_dynamic).collect()
    }

    async fn create<K: Object>(&self, obj: &K) -> Result<K> {
        let name = obj.meta().name.clone().unwrap_or_default();
        let data: DynamicObject = serde_json::from_value(serde_json::to_value(obj)?)?;
        let created = self
            .api::<K>(obj.meta().namespace.as_deref())
            .create(&PostParams::default(), &data)
            .await
            .map_err(|e| map_err::<K>(&name, e))?;
        from_dynamic(created)
    }

    async fn apply<K: Object>(&self, obj: &K) -> Result<K> {
        let name = obj.meta().name.clone().unwrap_or_default();
        let params = PatchParams::apply(&self.field_manager).force();
        let applied = self
            .api::<K>(obj.meta().namespace.as_deref())
            .patch(&name, &params, &Patch::Apply(serde_json::to_value(obj)?))
            .await
            .map_err(|e| map_err::<K>(&name, e))?;
        from_dynamic(applied)
    }

    async fn patch_merge<K: Object>(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<K> {
        let patched = self
            .api::<K>(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| map_err::<K>(name, e))?;
        from_dynamic(patched)
    }

    async fn patch_status_merge<K: Object>(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<K> {
        let patched = self
            .api::<K>(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| map_err::<K>(name, e))?;
        from_dynamic(patched)
    }

    async fn delete<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<()> {
        self.api::<K>(namespace)
            .delete(name, &DeleteParams::background())
            .await
            .map_err(|e| map_err::<K>(name, e))?;
        Ok(())
    }

    fn watch<K: Object>(&self, namespace: Option<&str>, field_selector: Option<&str>) -> WatchStream<K> {
        let fields = watch_fields(namespace, field_selector);
        let mut config = watcher::Config::default();
        if !fields.is_empty() {
            config = config.fields(&fields);
        }
        watcher(Api::<K>::all_with(self.client.clone(), &()), config)
            .default_backoff()
            .boxed()
    }
}

/// Combines a namespace restriction with a field selector. Watches always go
/// to the cluster-wide endpoint so that they work for any scope.
fn watch_fields(namespace: Option<&str>, field_selector: Option<&str>) -> String {
    namespace
        .map(|ns| format!("metadata.namespace={ns}"))
        .into_iter()
        .chain(field_selector.filter(|s| !s.is_empty()).map(str::to_string))
        .collect::<Vec<_>>()
        .join(",")
}
