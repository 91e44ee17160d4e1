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

//! Admission plugins for gardener resources.
//!
//! Plugins implement [`ValidationInterface`] and are registered by name in
//! [`Plugins`]. The enabled ones run as a [`ValidationChain`] behind the
//! [`webhook`] server.

mod attributes;
pub mod deletionconfirmation;
mod errors;
mod handler;
mod interfaces;
mod plugins;
pub mod webhook;

pub use attributes::Attributes;
pub use errors::{AdmissionError, AdmissionResult};
pub use handler::{Handler, ReadyFunc};
pub use interfaces::{Interface, Operation, ValidationChain, ValidationInterface};
pub use plugins::{Factory, PluginContext, Plugins};

use crate::client::ClusterClient;

/// Registers all admission plugins of this crate.
pub fn register_all_admission_plugins<C: ClusterClient>(plugins: &mut Plugins<C>) -> AdmissionResult<()> {
    plugins.register(deletionconfirmation::PLUGIN_NAME, deletionconfirmation::factory())
}
