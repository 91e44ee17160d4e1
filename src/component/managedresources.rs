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

//! Helpers for `ManagedResource`s.
//!
//! Manifests are serialized into an immutable secret whose name carries a hash
//! of its content, and a `ManagedResource` referencing that secret is applied.
//! The resource manager then applies the manifests to the target cluster.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use tracing::debug;

use super::{Error, Result};
use crate::apis::constants::{
    CONDITION_TRUE, GARBAGE_COLLECTABLE_REFERENCE, LABEL_ORIGIN, ORIGIN_GARDENER,
    RESOURCES_APPLIED, RESOURCES_HEALTHY, SHOOT_NO_CLEANUP,
};
use crate::apis::core::{get_condition, NameRef};
use crate::apis::resources::{ManagedResource, ManagedResourceSpec};
use crate::client::{self, kind_of, ClusterClient, Object};
use crate::utils::retry::{Outcome, RetryOps};
use crate::utils::{compute_checksum, string_map};

/// Resource class of managed resources targeting the seed cluster.
pub const CLASS_SEED: &str = "seed";

/// Prefix of secrets referenced by managed resources.
pub const SECRET_NAME_PREFIX: &str = "managedresource-";

/// Annotation prefix recording the secrets referenced by an object.
const REFERENCE_ANNOTATION_PREFIX: &str = "reference.resources.gardener.cloud/secret-";

/// Serializes objects into the data of a managed resource secret.
#[derive(Debug, Default)]
pub struct Registry {
    objects: BTreeMap<String, String>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an object under the key `<kind>__<namespace>__<name>.yaml`.
    pub fn add<K: Object>(&mut self, obj: &K) -> Result<()> {
        let name = obj.meta().name.clone().unwrap_or_default();
        let namespace = obj.meta().namespace.clone().unwrap_or_default();
        let kind = kind_of::<K>();

        let yaml = serde_yaml::to_string(obj).map_err(|source| Error::Render {
            kind: kind.clone(),
            name: name.clone(),
            source,
        })?;
        let key = format!("{kind}__{namespace}__{}.yaml", name.replace(':', "_"));
        self.objects.insert(key, yaml);
        Ok(())
    }

    /// Returns the rendered manifests as secret data.
    pub fn serialized_objects(&self) -> BTreeMap<String, ByteString> {
        self.objects
            .iter()
            .map(|(k, v)| (k.clone(), ByteString(v.as_bytes().to_vec())))
            .collect()
    }
}

/// Name of the content-addressed secret for the given data.
pub fn secret_name(managed_resource_name: &str, data: &BTreeMap<String, ByteString>) -> String {
    let mut content = Vec::new();
    for (key, value) in data {
        content.extend_from_slice(key.as_bytes());
        content.extend_from_slice(&value.0);
    }
    let hash = compute_checksum(content);
    format!("{SECRET_NAME_PREFIX}{managed_resource_name}-{}", &hash[..8])
}

fn reference_annotation(secret_name: &str) -> (String, String) {
    let hash = compute_checksum(secret_name);
    (
        format!("{REFERENCE_ANNOTATION_PREFIX}{}", &hash[..8]),
        secret_name.to_string(),
    )
}

#[allow(clippy::too_many_arguments)]
async fn create<C: ClusterClient>(
    client: &C,
    namespace: &str,
    name: &str,
    class: Option<&str>,
    labels: BTreeMap<String, String>,
    inject_labels: BTreeMap<String, String>,
    keep_objects: bool,
    data: BTreeMap<String, ByteString>,
) -> Result<()> {
    let secret_name = secret_name(name, &data);
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(secret_name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(string_map([(GARBAGE_COLLECTABLE_REFERENCE, "true")])),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        immutable: Some(true),
        data: Some(data),
        ..Default::default()
    };
    match client.create(&secret).await {
        Err(err) if err.is_already_exists() => {
            debug!(secret = %secret_name, "Managed resource secret already exists");
        }
        other => {
            other?;
        }
    }

    let annotations = BTreeMap::from([reference_annotation(&secret_name)]);
    let managed_resource = ManagedResource {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: ManagedResourceSpec {
            class: class.map(str::to_string),
            secret_refs: vec![NameRef { name: secret_name }],
            inject_labels,
            keep_objects: Some(keep_objects),
        },
        status: None,
    };
    client.apply(&managed_resource).await?;
    Ok(())
}

/// Creates a managed resource whose objects are applied to the shoot cluster.
pub async fn create_for_shoot<C: ClusterClient>(
    client: &C,
    namespace: &str,
    name: &str,
    keep_objects: bool,
    data: BTreeMap<String, ByteString>,
) -> Result<()> {
    create(
        client,
        namespace,
        name,
        None,
        string_map([(LABEL_ORIGIN, ORIGIN_GARDENER)]),
        string_map([(SHOOT_NO_CLEANUP, "true")]),
        keep_objects,
        data,
    )
    .await
}

/// Creates a managed resource whose objects are applied to the seed cluster.
pub async fn create_for_seed<C: ClusterClient>(
    client: &C,
    namespace: &str,
    name: &str,
    keep_objects: bool,
    data: BTreeMap<String, ByteString>,
) -> Result<()> {
    create(
        client,
        namespace,
        name,
        Some(CLASS_SEED),
        BTreeMap::new(),
        BTreeMap::new(),
        keep_objects,
        data,
    )
    .await
}

/// Deletes a managed resource and the secrets it references.
pub async fn delete<C: ClusterClient>(client: &C, namespace: &str, name: &str) -> Result<()> {
    let mut secrets = vec![format!("{SECRET_NAME_PREFIX}{name}")];
    if let Some(mr) = client::get_opt::<ManagedResource, _>(client, Some(namespace), name).await? {
        secrets.extend(mr.spec.secret_refs.into_iter().map(|r| r.name));
    }

    client::delete_ignore_not_found::<ManagedResource, _>(client, Some(namespace), name).await?;
    for secret in secrets {
        client::delete_ignore_not_found::<Secret, _>(client, Some(namespace), &secret).await?;
    }
    Ok(())
}

/// Returns an error message if the managed resource is not healthy.
pub fn check_managed_resource(mr: &ManagedResource) -> std::result::Result<(), String> {
    let generation = mr.metadata.generation.unwrap_or_default();
    let status = mr.status.clone().unwrap_or_default();
    if status.observed_generation < generation {
        return Err(format!(
            "observed generation outdated ({}/{generation})",
            status.observed_generation
        ));
    }
    for type_ in [RESOURCES_APPLIED, RESOURCES_HEALTHY] {
        match get_condition(&status.conditions, type_) {
            Some(c) if c.status == CONDITION_TRUE => {}
            Some(c) => {
                return Err(format!(
                    "condition {type_} has status {}: {}",
                    c.status,
                    c.message.as_deref().unwrap_or_default()
                ))
            }
            None => return Err(format!("condition {type_} is missing")),
        }
    }
    Ok(())
}

/// Waits until the managed resource has been applied and its objects are
/// healthy.
pub async fn wait_until_healthy<C: ClusterClient>(
    client: &C,
    namespace: &str,
    name: &str,
    ops: &RetryOps,
) -> Result<()> {
    ops.until(|| async move {
        match client.get::<ManagedResource>(Some(namespace), name).await {
            Err(err) => Outcome::Minor(err.to_string()),
            Ok(mr) => match check_managed_resource(&mr) {
                Ok(()) => Outcome::Done,
                Err(reason) => Outcome::Minor(format!(
                    "managed resource {namespace}/{name} is not healthy: {reason}"
                )),
            },
        }
    })
    .await?;
    Ok(())
}

/// Waits until the managed resource is gone.
pub async fn wait_until_deleted<C: ClusterClient>(
    client: &C,
    namespace: &str,
    name: &str,
    ops: &RetryOps,
) -> Result<()> {
    ops.until(|| async move {
        match client.get::<ManagedResource>(Some(namespace), name).await {
            Err(err) if err.is_not_found() => Outcome::Done,
            Err(err) => Outcome::Minor(err.to_string()),
            Ok(_) => Outcome::Minor(format!("managed resource {namespace}/{name} still exists")),
        }
    })
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::core::Condition;
    use crate::apis::resources::ManagedResourceStatus;
    use crate::client::fake::FakeClusterClient;
    use k8s_openapi::api::core::v1::ConfigMap;
    use std::time::Duration;

    fn ops() -> RetryOps {
        RetryOps::new(Duration::from_millis(1), Duration::from_secs(1)).with_max_attempts(2)
    }

    fn managed_resource(generation: i64, observed: i64, healthy: &str) -> ManagedResource {
        ManagedResource {
            metadata: ObjectMeta {
                name: Some("foo".to_string()),
                namespace: Some("ns".to_string()),
                generation: Some(generation),
                ..Default::default()
            },
            spec: ManagedResourceSpec::default(),
            status: Some(ManagedResourceStatus {
                observed_generation: observed,
                conditions: vec![
                    Condition::new(RESOURCES_APPLIED, CONDITION_TRUE),
                    Condition::new(RESOURCES_HEALTHY, healthy),
                ],
            }),
        }
    }

    #[test]
    fn test_registry_keys() {
        let mut registry = Registry::new();
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some("system:foo".to_string()),
                namespace: Some("kube-system".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        registry.add(&cm).unwrap();

        let data = registry.serialized_objects();
        let yaml = data.get("configmap__kube-system__system_foo.yaml").unwrap();
        let parsed: ConfigMap = serde_yaml::from_slice(&yaml.0).unwrap();
        assert_eq!(parsed.metadata.name.as_deref(), Some("system:foo"));
    }

    #[test]
    fn test_secret_name_depends_on_content() {
        let a = BTreeMap::from([("k".to_string(), ByteString(b"a".to_vec()))]);
        let b = BTreeMap::from([("k".to_string(), ByteString(b"b".to_vec()))]);
        assert_ne!(secret_name("foo", &a), secret_name("foo", &b));
        assert!(secret_name("foo", &a).starts_with("managedresource-foo-"));
    }

    #[tokio::test]
    async fn test_create_for_shoot() {
        let client = FakeClusterClient::new();
        let data = BTreeMap::from([("k".to_string(), ByteString(b"v".to_vec()))]);
        create_for_shoot(&client, "ns", "foo", false, data.clone()).await.unwrap();

        let mr: ManagedResource = client.get(Some("ns"), "foo").await.unwrap();
        assert_eq!(mr.metadata.resource_version.as_deref(), Some("1"));
        assert_eq!(mr.metadata.labels, Some(string_map([("origin", "gardener")])));
        assert_eq!(mr.spec.inject_labels, string_map([(SHOOT_NO_CLEANUP, "true")]));
        assert_eq!(mr.spec.keep_objects, Some(false));
        assert_eq!(mr.spec.class, None);

        let secret: Secret = client
            .get(Some("ns"), &mr.spec.secret_refs[0].name)
            .await
            .unwrap();
        assert_eq!(secret.immutable, Some(true));
        assert_eq!(secret.type_.as_deref(), Some("Opaque"));
        assert_eq!(secret.data, Some(data.clone()));

        // Deploying the same content twice reuses the immutable secret.
        create_for_shoot(&client, "ns", "foo", false, data).await.unwrap();
    }

    #[tokio::test]
    async fn test_create_for_seed_sets_class() {
        let client = FakeClusterClient::new();
        create_for_seed(&client, "ns", "foo", true, BTreeMap::new()).await.unwrap();

        let mr: ManagedResource = client.get(Some("ns"), "foo").await.unwrap();
        assert_eq!(mr.spec.class.as_deref(), Some(CLASS_SEED));
        assert_eq!(mr.spec.keep_objects, Some(true));
        assert!(mr.spec.inject_labels.is_empty());
    }

    #[tokio::test]
    async fn test_delete_removes_referenced_secrets() {
        let client = FakeClusterClient::new();
        create_for_shoot(&client, "ns", "foo", false, BTreeMap::new()).await.unwrap();
        let mr: ManagedResource = client.get(Some("ns"), "foo").await.unwrap();
        let secret = mr.spec.secret_refs[0].name.clone();

        delete(&client, "ns", "foo").await.unwrap();
        assert!(!client.contains::<ManagedResource>(Some("ns"), "foo").await);
        assert!(!client.contains::<Secret>(Some("ns"), &secret).await);

        // Deleting again is a no-op.
        delete(&client, "ns", "foo").await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_until_healthy() {
        let client = FakeClusterClient::new();
        let err = wait_until_healthy(&client, "ns", "foo", &ops()).await.unwrap_err();
        assert!(err.to_string().contains("not found"));

        client.create(&managed_resource(2, 1, CONDITION_TRUE)).await.unwrap();
        let err = wait_until_healthy(&client, "ns", "foo", &ops()).await.unwrap_err();
        assert!(err.to_string().contains("is not healthy"));

        client.delete::<ManagedResource>(Some("ns"), "foo").await.unwrap();
        client.create(&managed_resource(1, 1, "False")).await.unwrap();
        let err = wait_until_healthy(&client, "ns", "foo", &ops()).await.unwrap_err();
        assert!(err.to_string().contains("is not healthy"));

        client.delete::<ManagedResource>(Some("ns"), "foo").await.unwrap();
        client.create(&managed_resource(1, 1, CONDITION_TRUE)).await.unwrap();
        wait_until_healthy(&client, "ns", "foo", &ops()).await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_until_deleted() {
        let client = FakeClusterClient::new();
        wait_until_deleted(&client, "ns", "foo", &ops()).await.unwrap();

        client.create(&managed_resource(1, 1, CONDITION_TRUE)).await.unwrap();
        let err = wait_until_deleted(&client, "ns", "foo", &ops()).await.unwrap_err();
        assert!(err.to_string().contains("still exists"));
    }
}
