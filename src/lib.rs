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

//! gardener - shoot control plane management for Kubernetes.
//!
//! This library provides the building blocks of three components:
//! - the gardenlet, which deploys and migrates shoot control planes on seeds
//! - the node agent, which provisions files and units on shoot worker nodes
//! - the admission webhook, which guards deletions in the garden cluster
//!
//! All of them run on the same controller framework: descriptors, a
//! manager, feature gates, leader election and health checks.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::too_many_arguments)]

pub mod admission;
pub mod apis;
pub mod botanist;
pub mod client;
pub mod component;
pub mod config;
pub mod controller;
pub mod controller_context;
pub mod controller_descriptor;
pub mod controller_manager;
pub mod e2e;
pub mod feature;
pub mod gardenlet;
pub mod health;
pub mod leader_election;
pub mod nodeagent;
pub mod utils;

pub use client::{ClientError, ClusterClient};
pub use controller::{Controller, ControllerError};
pub use controller_context::ControllerContext;
pub use controller_descriptor::{ControllerDescriptor, ControllerRegistry};
pub use controller_manager::ControllerManager;
pub use feature::{FeatureGate, MemoryFeatureGate};

/// Semantic version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
