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

use thiserror::Error;

use crate::client::ClientError;

use super::Attributes;

/// Errors returned by admission plugins.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    /// The request is denied.
    #[error("{resource} {name:?} is forbidden: {reason}")]
    Forbidden {
        /// Qualified resource, e.g. `shoots.core.gardener.cloud`.
        resource: String,
        /// Object name.
        name: String,
        /// Why the request is denied.
        reason: String,
    },

    /// The object does not exist.
    #[error("{resource} {name:?} not found")]
    NotFound {
        /// Qualified resource.
        resource: String,
        /// Object name.
        name: String,
    },

    /// The plugin could not decide.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AdmissionError {
    /// A forbidden error for the object described by `attrs`.
    pub fn forbidden(attrs: &Attributes, reason: impl ToString) -> Self {
        AdmissionError::Forbidden {
            resource: attrs.qualified_resource(),
            name: attrs.name.clone(),
            reason: reason.to_string(),
        }
    }

    /// Maps a client error for the object described by `attrs`.
    pub fn from_client(attrs: &Attributes, err: ClientError) -> Self {
        if err.is_not_found() {
            AdmissionError::NotFound {
                resource: attrs.qualified_resource(),
                name: attrs.name.clone(),
            }
        } else {
            AdmissionError::Internal(err.to_string())
        }
    }

    /// HTTP status code reported in admission responses.
    pub fn code(&self) -> u16 {
        match self {
            AdmissionError::Forbidden { .. } => 403,
            AdmissionError::NotFound { .. } => 404,
            AdmissionError::Internal(_) => 500,
        }
    }
}

/// Result type of admission plugins.
pub type AdmissionResult<T> = Result<T, AdmissionError>;
