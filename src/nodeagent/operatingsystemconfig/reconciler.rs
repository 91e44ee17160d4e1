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

//! Applies the operating system config of a secret to the node.

use std::collections::BTreeSet;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::Engine;
use k8s_openapi::api::core::v1::Secret;
use tokio::process::Command;

use crate::apis::nodeagent::{File, OperatingSystemConfig, Unit, DATA_KEY_OPERATING_SYSTEM_CONFIG};
use crate::client::{self, ClusterClient};
use crate::nodeagent::{Error, Result};

const UNIT_DIR: &str = "etc/systemd/system";
const LAST_APPLIED: &str = "var/lib/gardener-node-agent/last-applied-osc.yaml";
const DEFAULT_FILE_PERMISSIONS: u32 = 0o644;

/// Controls systemd units on the node.
#[async_trait]
pub trait UnitManager: Send + Sync + 'static {
    /// Reloads the unit files.
    async fn daemon_reload(&self) -> Result<()>;
    /// Enables a unit.
    async fn enable(&self, unit: &str) -> Result<()>;
    /// Disables a unit.
    async fn disable(&self, unit: &str) -> Result<()>;
    /// Starts a unit.
    async fn start(&self, unit: &str) -> Result<()>;
    /// Stops a unit.
    async fn stop(&self, unit: &str) -> Result<()>;
    /// Restarts a unit.
    async fn restart(&self, unit: &str) -> Result<()>;
}

/// [`UnitManager`] shelling out to `systemctl`.
#[derive(Debug, Clone, Default)]
pub struct SystemctlUnitManager;

impl SystemctlUnitManager {
    async fn systemctl(&self, args: &[&str]) -> Result<()> {
        let unit = args.last().copied().unwrap_or_default().to_string();
        let output = Command::new("systemctl")
            .args(args)
            .output()
            .await
            .map_err(|e| Error::Unit {
                unit: unit.clone(),
                message: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(Error::Unit {
                unit,
                message: format!(
                    "systemctl {} failed: {}",
                    args.join(" "),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl UnitManager for SystemctlUnitManager {
    async fn daemon_reload(&self) -> Result<()> {
        self.systemctl(&["daemon-reload"]).await
    }

    async fn enable(&self, unit: &str) -> Result<()> {
        self.systemctl(&["enable", unit]).await
    }

    async fn disable(&self, unit: &str) -> Result<()> {
        self.systemctl(&["disable", unit]).await
    }

    async fn start(&self, unit: &str) -> Result<()> {
        self.systemctl(&["start", unit]).await
    }

    async fn stop(&self, unit: &str) -> Result<()> {
        self.systemctl(&["stop", unit]).await
    }

    async fn restart(&self, unit: &str) -> Result<()> {
        self.systemctl(&["restart", unit]).await
    }
}

/// Applies an operating system config to the node's filesystem and units.
pub struct Reconciler<C, U> {
    /// Client reading the config secret.
    pub client: C,
    /// Unit control.
    pub units: U,
    /// Root of the node filesystem, `/` outside of tests.
    pub root_dir: PathBuf,
}

impl<C: ClusterClient, U: UnitManager> Reconciler<C, U> {
    /// Creates a reconciler writing below `root_dir`.
    pub fn new(client: C, units: U, root_dir: impl Into<PathBuf>) -> Self {
        Self {
            client,
            units,
            root_dir: root_dir.into(),
        }
    }

    fn host_path(&self, path: &str) -> PathBuf {
        self.root_dir.join(path.trim_start_matches('/'))
    }

    fn unit_path(&self, name: &str) -> PathBuf {
        self.root_dir.join(UNIT_DIR).join(name)
    }

    fn drop_in_dir(&self, name: &str) -> PathBuf {
        self.root_dir.join(UNIT_DIR).join(format!("{name}.d"))
    }

    /// Applies the config in secret `namespace/name`. A missing secret is ignored.
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<()> {
        let Some(secret) = client::get_opt::<Secret, _>(&self.client, Some(namespace), name).await? else {
            tracing::info!(secret = %name, "Secret is gone, nothing to apply");
            return Ok(());
        };
        let data = secret
            .data
            .as_ref()
            .and_then(|d| d.get(DATA_KEY_OPERATING_SYSTEM_CONFIG))
            .ok_or_else(|| Error::MissingData(DATA_KEY_OPERATING_SYSTEM_CONFIG.to_string()))?;
        let osc: OperatingSystemConfig = serde_yaml::from_slice(&data.0)?;
        let previous = self.last_applied().await?;

        for file in &osc.files {
            self.write_file(file).await?;
        }
        let changed: Vec<&Unit> = osc
            .units
            .iter()
            .filter(|unit| previous.units.iter().find(|u| u.name == unit.name) != Some(*unit))
            .collect();
        for unit in &changed {
            self.write_unit(unit).await?;
        }

        let files: BTreeSet<&str> = osc.files.iter().map(|f| f.path.as_str()).collect();
        for file in previous.files.iter().filter(|f| !files.contains(f.path.as_str())) {
            tracing::info!(path = %file.path, "Removing file no longer part of the config");
            remove_file(&self.host_path(&file.path)).await?;
        }
        let units: BTreeSet<&str> = osc.units.iter().map(|u| u.name.as_str()).collect();
        let removed: Vec<&Unit> = previous
            .units
            .iter()
            .filter(|u| !units.contains(u.name.as_str()))
            .collect();
        for unit in &removed {
            tracing::info!(unit = %unit.name, "Removing unit no longer part of the config");
            self.units.stop(&unit.name).await?;
            self.units.disable(&unit.name).await?;
            remove_file(&self.unit_path(&unit.name)).await?;
            remove_dir(&self.drop_in_dir(&unit.name)).await?;
        }

        if !changed.is_empty() || !removed.is_empty() {
            self.units.daemon_reload().await?;
        }
        for unit in &changed {
            if unit.enable == Some(false) {
                self.units.disable(&unit.name).await?;
            } else {
                self.units.enable(&unit.name).await?;
            }
            match unit.command.as_deref() {
                Some("stop") => self.units.stop(&unit.name).await?,
                Some("start") => self.units.start(&unit.name).await?,
                _ => self.units.restart(&unit.name).await?,
            }
            tracing::info!(unit = %unit.name, "Applied changed unit");
        }

        self.persist(&osc).await?;
        tracing::info!(
            files = osc.files.len(),
            units = osc.units.len(),
            changed_units = changed.len(),
            "Successfully applied operating system config"
        );
        Ok(())
    }

    async fn write_file(&self, file: &File) -> Result<()> {
        let content = match &file.content.inline {
            Some(inline) if inline.encoding == "b64" || inline.encoding == "base64" => {
                base64::engine::general_purpose::STANDARD.decode(inline.data.trim())?
            }
            Some(inline) => inline.data.clone().into_bytes(),
            None => Vec::new(),
        };
        let path = self.host_path(&file.path);
        write(&path, &content).await?;
        let mode = file.permissions.unwrap_or(DEFAULT_FILE_PERMISSIONS);
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
            .await
            .map_err(|source| Error::Io { path, source })
    }

    async fn write_unit(&self, unit: &Unit) -> Result<()> {
        if let Some(content) = &unit.content {
            write(&self.unit_path(&unit.name), content.as_bytes()).await?;
        }
        for drop_in in &unit.drop_ins {
            write(&self.drop_in_dir(&unit.name).join(&drop_in.name), drop_in.content.as_bytes()).await?;
        }
        Ok(())
    }

    async fn last_applied(&self) -> Result<OperatingSystemConfig> {
        let path = self.root_dir.join(LAST_APPLIED);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(serde_yaml::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(OperatingSystemConfig::default()),
            Err(source) => Err(Error::Io { path, source }),
        }
    }

    async fn persist(&self, osc: &OperatingSystemConfig) -> Result<()> {
        write(&self.root_dir.join(LAST_APPLIED), serde_yaml::to_string(osc)?.as_bytes()).await
    }
}

async fn write(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|source| Error::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    tokio::fs::write(path, content).await.map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })
}

async fn remove_file(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(Error::Io {
            path: path.to_path_buf(),
            source: e,
        }),
        _ => Ok(()),
    }
}

async fn remove_dir(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(Error::Io {
            path: path.to_path_buf(),
            source: e,
        }),
        _ => Ok(()),
    }
}
