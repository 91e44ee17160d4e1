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

//! Operating system configuration consumed by the node agent.
//!
//! The configuration is stored as YAML in a secret under
//! [`DATA_KEY_OPERATING_SYSTEM_CONFIG`].

use serde::{Deserialize, Serialize};

/// Secret data key holding the operating system config.
pub const DATA_KEY_OPERATING_SYSTEM_CONFIG: &str = "osc.yaml";

/// Files and systemd units to provision on a node.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatingSystemConfig {
    /// Files written to the node.
    #[serde(default)]
    pub files: Vec<File>,
    /// Systemd units installed on the node.
    #[serde(default)]
    pub units: Vec<Unit>,
}

/// A file on the node.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct File {
    /// Absolute path.
    pub path: String,
    /// Octal file mode, defaults to `0644`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<u32>,
    /// Content of the file.
    pub content: FileContent,
}

/// Source of a file's content.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileContent {
    /// Content embedded in the config.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline: Option<FileContentInline>,
}

/// Inline file content.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileContentInline {
    /// Empty for plain text or `b64` for base64 encoded data.
    #[serde(default)]
    pub encoding: String,
    /// The data, encoded as given by `encoding`.
    pub data: String,
}

/// A systemd unit.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Unit {
    /// Unit name, e.g. `kubelet.service`.
    pub name: String,
    /// Enables the unit when true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable: Option<bool>,
    /// `start`, `restart` or `stop`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Unit file content. Units without content are only commanded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Drop-in files of the unit.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub drop_ins: Vec<DropIn>,
}

/// A drop-in file of a unit.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DropIn {
    /// Drop-in file name.
    pub name: String,
    /// Drop-in content.
    pub content: String,
}
