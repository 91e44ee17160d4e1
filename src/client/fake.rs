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

//! In-memory [`ClusterClient`] for tests.
//!
//! Objects are stored as JSON keyed by apiVersion, kind, namespace and name.
//! Every call is recorded as an [`Action`] so tests can assert on ordering,
//! and failures can be injected per verb and kind. Merge patches carrying
//! `metadata.resourceVersion` fail with a conflict if the object changed in
//! the meantime, and every change is published to open watches.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use kube::runtime::watcher::Event;
use serde_json::{Map, Value};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Mutex;

use super::{kind_of, ClientError, ClusterClient, Object, Result, WatchStream};

const WATCH_BUFFER: usize = 1024;

/// Error message returned by injected failures.
pub const FAKE_ERROR: &str = "fake err";

/// The verb of a recorded client call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    /// [`ClusterClient::get`].
    Get,
    /// [`ClusterClient::list`].
    List,
    /// [`ClusterClient::create`].
    Create,
    /// [`ClusterClient::apply`].
    Apply,
    /// [`ClusterClient::patch_merge`].
    Patch,
    /// [`ClusterClient::patch_status_merge`].
    PatchStatus,
    /// [`ClusterClient::delete`].
    Delete,
}

/// A recorded client call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    /// The called verb.
    pub verb: Verb,
    /// Kind of the object.
    pub kind: String,
    /// Namespace, `None` for cluster scoped objects.
    pub namespace: Option<String>,
    /// Object name, empty for lists.
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Key {
    api_version: String,
    kind: String,
    namespace: String,
    name: String,
}

#[derive(Debug, Clone)]
struct Failure {
    verb: Verb,
    kind: String,
    name: Option<String>,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<Key, Value>,
    actions: Vec<Action>,
    failures: Vec<Failure>,
}

#[derive(Debug, Clone)]
enum Change {
    Applied(Key, Value),
    Deleted(Key, Value),
}

/// Selects the objects a watch is interested in.
#[derive(Debug, Clone)]
struct WatchFilter {
    api_version: String,
    kind: String,
    namespace: Option<String>,
    fields: Vec<(String, String)>,
}

impl WatchFilter {
    fn new<K: Object>(namespace: Option<&str>, field_selector: Option<&str>) -> Self {
        let fields = field_selector
            .unwrap_or_default()
            .split(',')
            .filter_map(|requirement| requirement.trim().split_once('='))
            .map(|(field, value)| (format!("/{}", field.replace('.', "/")), value.to_string()))
            .collect();
        Self {
            api_version: K::api_version(&()).to_string(),
            kind: K::kind(&()).to_string(),
            namespace: namespace.map(str::to_string),
            fields,
        }
    }

    fn matches(&self, key: &Key, value: &Value) -> bool {
        key.api_version == self.api_version
            && key.kind == self.kind
            && self.namespace.as_ref().map_or(true, |ns| &key.namespace == ns)
            && self
                .fields
                .iter()
                .all(|(pointer, expected)| value.pointer(pointer).and_then(Value::as_str) == Some(expected))
    }
}

/// Thread-safe in-memory cluster. Clones share the same state.
#[derive(Clone)]
pub struct FakeClusterClient {
    state: Arc<Mutex<State>>,
    changes: broadcast::Sender<Change>,
}

impl Default for FakeClusterClient {
    fn default() -> Self {
        Self {
            state: Arc::default(),
            changes: broadcast::channel(WATCH_BUFFER).0,
        }
    }
}

fn key_for<K: Object>(namespace: Option<&str>, name: &str) -> Key {
    Key {
        api_version: K::api_version(&()).to_string(),
        kind: K::kind(&()).to_string(),
        namespace: namespace.unwrap_or_default().to_string(),
        name: name.to_string(),
    }
}

fn not_found<K: Object>(name: &str) -> ClientError {
    ClientError::NotFound {
        kind: kind_of::<K>(),
        name: name.to_string(),
    }
}

/// Applies an RFC 7386 JSON merge patch.
fn merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(patch) => {
            if !target.is_object() {
                *target = Value::Object(Map::new());
            }
            if let Value::Object(target) = target {
                for (key, value) in patch {
                    if value.is_null() {
                        target.remove(key);
                    } else {
                        merge_patch(target.entry(key.clone()).or_insert(Value::Null), value);
                    }
                }
            }
        }
        _ => *target = patch.clone(),
    }
}

fn resource_version(value: &Value) -> u64 {
    value
        .pointer("/metadata/resourceVersion")
        .and_then(Value::as_str)
        .and_then(|rv| rv.parse().ok())
        .unwrap_or(0)
}

fn set_metadata(value: &mut Value, field: &str, new: Value) {
    merge_patch(value, &serde_json::json!({ "metadata": { field: new } }));
}

fn has_finalizers(value: &Value) -> bool {
    value
        .pointer("/metadata/finalizers")
        .and_then(Value::as_array)
        .is_some_and(|f| !f.is_empty())
}

fn is_deleting(value: &Value) -> bool {
    value.pointer("/metadata/deletionTimestamp").is_some()
}

impl FakeClusterClient {
    /// Creates an empty fake cluster.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call with the given verb on objects of kind `K`
    /// fail.
    pub async fn fail_on<K: Object>(&self, verb: Verb) {
        self.state.lock().await.failures.push(Failure {
            verb,
            kind: kind_of::<K>(),
            name: None,
        });
    }

    /// Like [`fail_on`](Self::fail_on) but restricted to a single object name.
    pub async fn fail_on_name<K: Object>(&self, verb: Verb, name: &str) {
        self.state.lock().await.failures.push(Failure {
            verb,
            kind: kind_of::<K>(),
            name: Some(name.to_string()),
        });
    }

    /// Removes all injected failures.
    pub async fn clear_failures(&self) {
        self.state.lock().await.failures.clear();
    }

    /// Returns all recorded calls.
    pub async fn actions(&self) -> Vec<Action> {
        self.state.lock().await.actions.clone()
    }

    /// Forgets all recorded calls.
    pub async fn clear_actions(&self) {
        self.state.lock().await.actions.clear();
    }

    /// Returns true if an object of kind `K` exists.
    pub async fn contains<K: Object>(&self, namespace: Option<&str>, name: &str) -> bool {
        self.state
            .lock()
            .await
            .objects
            .contains_key(&key_for::<K>(namespace, name))
    }

    fn check(state: &mut State, verb: Verb, kind: &str, namespace: Option<&str>, name: &str) -> Result<()> {
        state.actions.push(Action {
            verb,
            kind: kind.to_string(),
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        });
        let failing = state.failures.iter().any(|f| {
            f.verb == verb && f.kind == kind && f.name.as_deref().map_or(true, |n| n == name)
        });
        if failing {
            return Err(ClientError::Injected(FAKE_ERROR.to_string()));
        }
        Ok(())
    }

    /// Stores `value` under `key`, removing it instead if it is being deleted
    /// and carries no finalizers anymore.
    fn store(&self, state: &mut State, key: Key, value: Value) {
        if is_deleting(&value) && !has_finalizers(&value) {
            self.remove(state, &key);
        } else {
            state.objects.insert(key.clone(), value.clone());
            // no open watch
            let _ = self.changes.send(Change::Applied(key, value));
        }
    }

    fn remove(&self, state: &mut State, key: &Key) {
        if let Some(value) = state.objects.remove(key) {
            let _ = self.changes.send(Change::Deleted(key.clone(), value));
        }
    }

    fn parse<K: Object>(value: Value) -> Result<K> {
        Ok(serde_json::from_value(value)?)
    }
}

fn matches_selector(value: &Value, selector: &str) -> bool {
    let labels = value.pointer("/metadata/labels").and_then(Value::as_object);
    selector
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .all(|requirement| match requirement.split_once('=') {
            Some((key, expected)) => labels
                .and_then(|l| l.get(key))
                .and_then(Value::as_str)
                == Some(expected),
            None => labels.is_some_and(|l| l.contains_key(requirement)),
        })
}

#[async_trait]
impl ClusterClient for FakeClusterClient {
    async fn get<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<K> {
        let mut state = self.state.lock().await;
        Self::check(&mut state, Verb::Get, &kind_of::<K>(), namespace, name)?;
        let value = state
            .objects
            .get(&key_for::<K>(namespace, name))
            .cloned()
            .ok_or_else(|| not_found::<K>(name))?;
        Self::parse(value)
    }

    async fn list<K: Object>(
        &self,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<K>> {
        let mut state = self.state.lock().await;
        Self::check(&mut state, Verb::List, &kind_of::<K>(), namespace, "")?;
        let api_version = K::api_version(&());
        let kind = K::kind(&());
        state
            .objects
            .iter()
            .filter(|(key, _)| key.api_version == api_version && key.kind == kind)
            .filter(|(key, _)| namespace.map_or(true, |ns| key.namespace == ns))
            .filter(|(_, value)| label_selector.map_or(true, |s| matches_selector(value, s)))
            .map(|(_, value)| Self::parse(value.clone()))
            .collect()
    }

    async fn create<K: Object>(&self, obj: &K) -> Result<K> {
        let name = obj.meta().name.clone().unwrap_or_default();
        let namespace = obj.meta().namespace.clone();
        let mut state = self.state.lock().await;
        Self::check(&mut state, Verb::Create, &kind_of::<K>(), namespace.as_deref(), &name)?;

        let key = key_for::<K>(namespace.as_deref(), &name);
        if state.objects.contains_key(&key) {
            return Err(ClientError::AlreadyExists {
                kind: kind_of::<K>(),
                name,
            });
        }
        let mut value = serde_json::to_value(obj)?;
        set_metadata(&mut value, "resourceVersion", Value::from("1"));
        self.store(&mut state, key, value.clone());
        Self::parse(value)
    }

    async fn apply<K: Object>(&self, obj: &K) -> Result<K> {
        let name = obj.meta().name.clone().unwrap_or_default();
        let namespace = obj.meta().namespace.clone();
        let mut state = self.state.lock().await;
        Self::check(&mut state, Verb::Apply, &kind_of::<K>(), namespace.as_deref(), &name)?;

        let key = key_for::<K>(namespace.as_deref(), &name);
        let mut value = serde_json::to_value(obj)?;
        let version = match state.objects.get(&key) {
            Some(existing) => {
                if value.get("status").map_or(true, Value::is_null) {
                    if let (Some(status), Value::Object(map)) = (existing.get("status"), &mut value) {
                        map.insert("status".to_string(), status.clone());
                    }
                }
                for field in ["finalizers", "deletionTimestamp", "uid", "generation"] {
                    let current = value.pointer(&format!("/metadata/{field}")).cloned();
                    if current.is_none() {
                        if let Some(old) = existing.pointer(&format!("/metadata/{field}")) {
                            set_metadata(&mut value, field, old.clone());
                        }
                    }
                }
                resource_version(existing) + 1
            }
            None => 1,
        };
        set_metadata(&mut value, "resourceVersion", Value::from(version.to_string()));
        self.store(&mut state, key, value.clone());
        Self::parse(value)
    }

    async fn patch_merge<K: Object>(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<K> {
        let mut state = self.state.lock().await;
        Self::check(&mut state, Verb::Patch, &kind_of::<K>(), namespace, name)?;

        let key = key_for::<K>(namespace, name);
        let mut value = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| not_found::<K>(name))?;
        let current = resource_version(&value);
        if let Some(expected) = patch.pointer("/metadata/resourceVersion").and_then(Value::as_str) {
            if expected != current.to_string() {
                return Err(ClientError::Conflict {
                    kind: kind_of::<K>(),
                    name: name.to_string(),
                    message: "the object has been modified; please apply your changes to the latest version and try again".to_string(),
                });
            }
        }
        merge_patch(&mut value, patch);
        set_metadata(&mut value, "resourceVersion", Value::from((current + 1).to_string()));
        let parsed = Self::parse::<K>(value.clone())?;
        self.store(&mut state, key, value);
        Ok(parsed)
    }

    async fn patch_status_merge<K: Object>(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<K> {
        let mut state = self.state.lock().await;
        Self::check(&mut state, Verb::PatchStatus, &kind_of::<K>(), namespace, name)?;

        let key = key_for::<K>(namespace, name);
        let mut value = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| not_found::<K>(name))?;
        if let Some(status) = patch.get("status") {
            let version = resource_version(&value) + 1;
            merge_patch(&mut value, &serde_json::json!({ "status": status }));
            set_metadata(&mut value, "resourceVersion", Value::from(version.to_string()));
            self.store(&mut state, key, value.clone());
        }
        Self::parse(value)
    }

    async fn delete<K: Object>(&self, namespace: Option<&str>, name: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        Self::check(&mut state, Verb::Delete, &kind_of::<K>(), namespace, name)?;

        let key = key_for::<K>(namespace, name);
        let mut value = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| not_found::<K>(name))?;
        if !has_finalizers(&value) {
            self.remove(&mut state, &key);
            return Ok(());
        }
        if !is_deleting(&value) {
            let version = resource_version(&value) + 1;
            set_metadata(
                &mut value,
                "deletionTimestamp",
                Value::from(chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
            );
            set_metadata(&mut value, "resourceVersion", Value::from(version.to_string()));
            self.store(&mut state, key, value);
        }
        Ok(())
    }

    fn watch<K: Object>(&self, namespace: Option<&str>, field_selector: Option<&str>) -> WatchStream<K> {
        let filter = WatchFilter::new::<K>(namespace, field_selector);
        let state = self.state.clone();
        let changes = self.changes.clone();

        stream::once(async move {
            // Subscribing under the lock keeps the snapshot and the change
            // feed gapless.
            let guard = state.lock().await;
            let rx = changes.subscribe();
            let initial: Vec<K> = guard
                .objects
                .iter()
                .filter(|(key, value)| filter.matches(key, value))
                .filter_map(|(_, value)| Self::parse(value.clone()).ok())
                .collect();
            drop(guard);

            let init = stream::iter(
                std::iter::once(Event::Init)
                    .chain(initial.into_iter().map(Event::InitApply))
                    .chain(std::iter::once(Event::InitDone))
                    .map(Ok),
            );
            let updates = stream::unfold((rx, filter), |(mut rx, filter)| async move {
                loop {
                    let event = match rx.recv().await {
                        Ok(Change::Applied(key, value)) if filter.matches(&key, &value) => {
                            Self::parse::<K>(value).ok().map(Event::Apply)
                        }
                        Ok(Change::Deleted(key, value)) if filter.matches(&key, &value) => {
                            Self::parse::<K>(value).ok().map(Event::Delete)
                        }
                        Ok(_) | Err(RecvError::Lagged(_)) => None,
                        Err(RecvError::Closed) => return None,
                    };
                    if let Some(event) = event {
                        return Some((Ok(event), (rx, filter)));
                    }
                }
            });
            init.chain(updates)
        })
        .flatten()
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    fn config_map(name: &str, labels: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_get_and_resource_version() {
        let client = FakeClusterClient::new();
        client.create(&config_map("a", &[])).await.unwrap();

        let cm: ConfigMap = client.get(Some("default"), "a").await.unwrap();
        assert_eq!(cm.metadata.resource_version.as_deref(), Some("1"));

        let err = client.create(&config_map("a", &[])).await.unwrap_err();
        assert!(err.is_already_exists());

        let cm: ConfigMap = client
            .patch_merge(Some("default"), "a", &serde_json::json!({"data": {"k": "v"}}))
            .await
            .unwrap();
        assert_eq!(cm.metadata.resource_version.as_deref(), Some("2"));
        assert_eq!(cm.data.unwrap().get("k").map(String::as_str), Some("v"));
    }

    #[tokio::test]
    async fn test_list_with_label_selector() {
        let client = FakeClusterClient::new();
        client.create(&config_map("a", &[("app", "x")])).await.unwrap();
        client.create(&config_map("b", &[("app", "y")])).await.unwrap();

        let all: Vec<ConfigMap> = client.list(None, None).await.unwrap();
        assert_eq!(all.len(), 2);

        let selected: Vec<ConfigMap> = client.list(Some("default"), Some("app=y")).await.unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].metadata.name.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_delete_with_finalizers_sets_deletion_timestamp() {
        let client = FakeClusterClient::new();
        let mut cm = config_map("a", &[]);
        cm.metadata.finalizers = Some(vec!["test".to_string()]);
        client.create(&cm).await.unwrap();

        client.delete::<ConfigMap>(Some("default"), "a").await.unwrap();
        let cm: ConfigMap = client.get(Some("default"), "a").await.unwrap();
        assert!(cm.metadata.deletion_timestamp.is_some());

        client
            .patch_merge::<ConfigMap>(
                Some("default"),
                "a",
                &serde_json::json!({"metadata": {"finalizers": null}}),
            )
            .await
            .unwrap();
        assert!(!client.contains::<ConfigMap>(Some("default"), "a").await);
    }

    #[tokio::test]
    async fn test_patch_with_stale_resource_version_conflicts() {
        let client = FakeClusterClient::new();
        client.create(&config_map("a", &[])).await.unwrap();

        let err = client
            .patch_merge::<ConfigMap>(
                Some("default"),
                "a",
                &serde_json::json!({"metadata": {"resourceVersion": "0"}, "data": {"k": "v"}}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Conflict { .. }), "{err}");

        let cm: ConfigMap = client
            .patch_merge(
                Some("default"),
                "a",
                &serde_json::json!({"metadata": {"resourceVersion": "1"}, "data": {"k": "v"}}),
            )
            .await
            .unwrap();
        assert_eq!(cm.metadata.resource_version.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_watch_lists_then_follows_changes() {
        let client = FakeClusterClient::new();
        client.create(&config_map("a", &[])).await.unwrap();
        let mut other = config_map("b", &[]);
        other.metadata.namespace = Some("other".to_string());
        client.create(&other).await.unwrap();

        let mut events = client.watch::<ConfigMap>(Some("default"), None);
        assert!(matches!(events.next().await, Some(Ok(Event::Init))));
        assert!(matches!(
            events.next().await,
            Some(Ok(Event::InitApply(cm))) if cm.metadata.name.as_deref() == Some("a")
        ));
        assert!(matches!(events.next().await, Some(Ok(Event::InitDone))));

        client.create(&config_map("c", &[])).await.unwrap();
        client.delete::<ConfigMap>(Some("default"), "a").await.unwrap();

        assert!(matches!(
            events.next().await,
            Some(Ok(Event::Apply(cm))) if cm.metadata.name.as_deref() == Some("c")
        ));
        assert!(matches!(
            events.next().await,
            Some(Ok(Event::Delete(cm))) if cm.metadata.name.as_deref() == Some("a")
        ));
    }

    #[tokio::test]
    async fn test_watch_with_field_selector() {
        let client = FakeClusterClient::new();
        let mut events = client.watch::<ConfigMap>(None, Some("metadata.name=b"));
        assert!(matches!(events.next().await, Some(Ok(Event::Init))));
        assert!(matches!(events.next().await, Some(Ok(Event::InitDone))));

        client.create(&config_map("a", &[])).await.unwrap();
        client.create(&config_map("b", &[])).await.unwrap();
        assert!(matches!(
            events.next().await,
            Some(Ok(Event::Apply(cm))) if cm.metadata.name.as_deref() == Some("b")
        ));
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let client = FakeClusterClient::new();
        client.fail_on::<ConfigMap>(Verb::Get).await;

        let err = client.get::<ConfigMap>(Some("default"), "a").await.unwrap_err();
        assert_eq!(err.to_string(), FAKE_ERROR);
        assert_eq!(client.actions().await.len(), 1);
    }

    #[test]
    fn test_merge_patch_removes_null_fields() {
        let mut target = serde_json::json!({"a": {"b": 1, "c": 2}, "d": 3});
        merge_patch(&mut target, &serde_json::json!({"a": {"b": null}, "d": [1]}));
        assert_eq!(target, serde_json::json!({"a": {"c": 2}, "d": [1]}));
    }
}
