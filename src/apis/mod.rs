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

//! API types of the resources this crate reads and writes.
//!
//! The custom resource definitions are owned by their API groups, so schema
//! generation is disabled for all of them.

pub mod autoscaling;
pub mod constants;
pub mod core;
pub mod druid;
pub mod nodeagent;
pub mod resources;
