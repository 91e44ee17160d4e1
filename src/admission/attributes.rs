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

use kube::core::GroupVersionKind;

use super::Operation;

/// Everything an admission plugin gets to know about a request.
#[derive(Debug, Clone, PartialEq)]
pub struct Attributes {
    /// Group, version and kind of the object.
    pub kind: GroupVersionKind,
    /// Plural resource name, e.g. `shoots`.
    pub resource: String,
    /// Subresource, empty for the main resource.
    pub subresource: String,
    /// Namespace, empty for cluster scoped objects.
    pub namespace: String,
    /// Empty for collection requests.
    pub name: String,
    /// Requested operation.
    pub operation: Operation,
    /// True for dry-run requests.
    pub dry_run: bool,
    /// The object after the request. Unset for deletions.
    pub object: Option<serde_json::Value>,
    /// The object before the request. Set for updates and deletions.
    pub old_object: Option<serde_json::Value>,
    /// Name of the requesting user.
    pub user: String,
}

impl Attributes {
    /// Creates attributes without objects or user.
    pub fn new(
        kind: GroupVersionKind,
        resource: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        operation: Operation,
    ) -> Self {
        Self {
            kind,
            resource: resource.into(),
            subresource: String::new(),
            namespace: namespace.into(),
            name: name.into(),
            operation,
            dry_run: false,
            object: None,
            old_object: None,
            user: String::new(),
        }
    }

    /// The same request for a single named object.
    pub fn with_name(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }

    /// `resource.group`, or the bare resource for the core group.
    pub fn qualified_resource(&self) -> String {
        if self.kind.group.is_empty() {
            self.resource.clone()
        } else {
            format!("{}.{}", self.resource, self.kind.group)
        }
    }

    /// Namespace as client argument, `None` for cluster-scoped requests.
    pub fn namespace(&self) -> Option<&str> {
        Some(self.namespace.as_str()).filter(|ns| !ns.is_empty())
    }
}
