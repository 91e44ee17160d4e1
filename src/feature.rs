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

//! Feature gate support.
//!
//! Feature gates allow gardener components to incrementally roll out new
//! behavior.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

/// Error type for feature gate operations.
#[derive(Debug, thiserror::Error)]
pub enum FeatureGateError {
    /// The gate is not known.
    #[error("unknown feature gate: {0}")]
    UnknownFeature(String),

    /// The gate cannot be changed.
    #[error("feature gate {0} is locked to its default and cannot be modified")]
    Locked(String),

    /// The value is not a bool. Holds the gate and the value.
    #[error("invalid value for feature gate {0}: expected bool, got {1}")]
    InvalidValue(String, String),
}

/// Result type for feature gate operations.
pub type Result<T> = std::result::Result<T, FeatureGateError>;

/// A trait for types that can check and manipulate feature gates.
pub trait FeatureGate: Send + Sync {
    /// Returns true if the given feature gate is enabled.
    fn enabled(&self, feature: &str) -> bool;

    /// Sets a feature gate to the given value.
    ///
    /// Returns an error if the feature gate doesn't exist or is locked.
    fn set(&self, feature: &str, enabled: bool) -> Result<()>;

    /// Returns all known feature gates and their current values.
    fn all_features(&self) -> HashMap<String, bool>;

    /// Checks if a feature gate exists.
    fn contains(&self, feature: &str) -> bool;
}

/// Maturity of a feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Experimental, disabled by default.
    Alpha,
    /// Well tested, usually enabled by default.
    Beta,
    /// Generally available.
    Ga,
}

/// Simple in-memory feature gate implementation.
#[derive(Debug, Clone)]
pub struct MemoryFeatureGate {
    features: Arc<RwLock<HashMap<String, bool>>>,
    known_features: HashMap<String, FeatureSpec>,
}

#[derive(Debug, Clone, Copy)]
struct FeatureSpec {
    default: bool,
    stage: Stage,
    locked_to_default: bool,
}

impl MemoryFeatureGate {
    /// Creates a new feature gate with the given known features.
    ///
    /// # Arguments
    ///
    /// * `features` - Iterator of (name, default_enabled, stage, locked_to_default)
    pub fn new(features: impl IntoIterator<Item = (&'static str, bool, Stage, bool)>) -> Self {
        let known_features: HashMap<String, FeatureSpec> = features
            .into_iter()
            .map(|(name, default, stage, locked_to_default)| {
                (
                    name.to_string(),
                    FeatureSpec {
                        default,
                        stage,
                        locked_to_default,
                    },
                )
            })
            .collect();

        let features = known_features
            .iter()
            .map(|(k, v)| (k.clone(), v.default))
            .collect();

        Self {
            features: Arc::new(RwLock::new(features)),
            known_features,
        }
    }

    /// Feature gate preloaded with the gardener features.
    pub fn gardener() -> Self {
        Self::new(gardener::default_features().iter().copied())
    }

    /// Sets feature gates from a comma-separated list.
    ///
    /// Format: "Feature1=true,Feature2=false"
    pub fn set_from_string(&self, s: &str) -> Result<()> {
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let (name, value) = part.split_once('=').ok_or_else(|| {
                FeatureGateError::InvalidValue(part.to_string(), "missing =".to_string())
            })?;

            let enabled = value
                .trim()
                .parse::<bool>()
                .map_err(|_| FeatureGateError::InvalidValue(name.to_string(), value.to_string()))?;

            self.set(name.trim(), enabled)?;
        }
        Ok(())
    }

    /// Sets feature gates from a configuration map.
    pub fn set_from_map(&self, map: &BTreeMap<String, bool>) -> Result<()> {
        for (name, enabled) in map {
            self.set(name, *enabled)?;
        }
        Ok(())
    }

    /// Returns the names of all alpha features.
    pub fn alpha_features(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .known_features
            .iter()
            .filter(|(_, v)| v.stage == Stage::Alpha)
            .map(|(k, _)| k.clone())
            .collect();
        names.sort();
        names
    }
}

impl FeatureGate for MemoryFeatureGate {
    fn enabled(&self, feature: &str) -> bool {
        let features = self.features.read().unwrap_or_else(PoisonError::into_inner);
        features.get(feature).copied().unwrap_or(false)
    }

    fn set(&self, feature: &str, enabled: bool) -> Result<()> {
        let spec = self
            .known_features
            .get(feature)
            .ok_or_else(|| FeatureGateError::UnknownFeature(feature.to_string()))?;

        if spec.locked_to_default && enabled != spec.default {
            return Err(FeatureGateError::Locked(feature.to_string()));
        }

        let mut features = self.features.write().unwrap_or_else(PoisonError::into_inner);
        features.insert(feature.to_string(), enabled);
        Ok(())
    }

    fn all_features(&self) -> HashMap<String, bool> {
        self.features
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn contains(&self, feature: &str) -> bool {
        self.known_features.contains_key(feature)
    }
}

/// Gardener feature gates.
pub mod gardener {
    use super::Stage;

    /// Autoscales etcd and kube-apiserver of shoots with HVPA.
    pub const HVPA: &str = "HVPA";
    /// Autoscales the control plane of managed seeds with HVPA.
    pub const HVPA_FOR_SHOOTED_SEED: &str = "HVPAForShootedSeed";
    /// Sets the `RuntimeDefault` seccomp profile for control plane pods.
    pub const DEFAULT_SECCOMP_PROFILE: &str = "DefaultSeccompProfile";
    /// Allows shoots without worker pools.
    pub const WORKERLESS_SHOOTS: &str = "WorkerlessShoots";
    /// Allows forceful deletion of shoots stuck in deletion.
    pub const SHOOT_FORCE_DELETION: &str = "ShootForceDeletion";

    /// Returns the known gardener feature gates.
    pub fn default_features() -> &'static [(&'static str, bool, Stage, bool)] {
        &[
            // (name, default_enabled, stage, locked_to_default)
            (HVPA, false, Stage::Alpha, false),
            (HVPA_FOR_SHOOTED_SEED, false, Stage::Alpha, false),
            (DEFAULT_SECCOMP_PROFILE, false, Stage::Alpha, false),
            (WORKERLESS_SHOOTS, true, Stage::Ga, true),
            (SHOOT_FORCE_DELETION, true, Stage::Beta, false),
        ]
    }
}
