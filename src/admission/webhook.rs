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

//! Validating admission webhook serving the enabled plugins.

use std::sync::Arc;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use kube::core::admission::{self, AdmissionRequest, AdmissionResponse, AdmissionReview};
use kube::core::DynamicObject;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::health::respond;

use super::{Attributes, Operation, ValidationChain};

/// Path the validating webhook is served on.
pub const VALIDATE_PATH: &str = "/validate";

fn operation(op: &admission::Operation) -> Operation {
    match op {
        admission::Operation::Create => Operation::Create,
        admission::Operation::Update => Operation::Update,
        admission::Operation::Delete => Operation::Delete,
        admission::Operation::Connect => Operation::Connect,
    }
}

fn attributes(req: &AdmissionRequest<DynamicObject>) -> Attributes {
    Attributes {
        kind: req.kind.clone(),
        resource: req.resource.resource.clone(),
        subresource: req.sub_resource.clone().unwrap_or_default(),
        namespace: req.namespace.clone().unwrap_or_default(),
        name: req.name.clone(),
        operation: operation(&req.operation),
        dry_run: req.dry_run,
        object: req.object.as_ref().and_then(|o| serde_json::to_value(o).ok()),
        old_object: req.old_object.as_ref().and_then(|o| serde_json::to_value(o).ok()),
        user: req.user_info.username.clone().unwrap_or_default(),
    }
}

/// Runs the chain for one review and returns the review carrying the
/// response.
pub async fn review(chain: &ValidationChain, review: AdmissionReview<DynamicObject>) -> AdmissionReview<DynamicObject> {
    let req: AdmissionRequest<DynamicObject> = match review.try_into() {
        Ok(req) => req,
        Err(err) => {
            tracing::warn!(error = %err, "Received invalid admission review");
            return AdmissionResponse::invalid(err.to_string()).into_review();
        }
    };

    let attrs = attributes(&req);
    let response = AdmissionResponse::from(&req);
    match chain.validate(&attrs).await {
        Ok(()) => response.into_review(),
        Err(err) => {
            tracing::info!(
                operation = %attrs.operation,
                resource = %attrs.qualified_resource(),
                namespace = %attrs.namespace,
                name = %attrs.name,
                user = %attrs.user,
                reason = %err,
                "Denied admission request"
            );
            response.deny(err.to_string()).into_review()
        }
    }
}

async fn handle_request(req: Request<Incoming>, chain: &ValidationChain) -> Response<Full<Bytes>> {
    if req.uri().path() != VALIDATE_PATH {
        return respond(StatusCode::NOT_FOUND, "text/plain", "not found");
    }
    if req.method() != Method::POST {
        return respond(StatusCode::METHOD_NOT_ALLOWED, "text/plain", "method not allowed");
    }

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(err) => return respond(StatusCode::BAD_REQUEST, "text/plain", err.to_string()),
    };
    let incoming: AdmissionReview<DynamicObject> = match serde_json::from_slice(&body) {
        Ok(review) => review,
        Err(err) => return respond(StatusCode::BAD_REQUEST, "text/plain", err.to_string()),
    };

    match serde_json::to_vec(&review(chain, incoming).await) {
        Ok(body) => respond(StatusCode::OK, "application/json", body),
        Err(err) => respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", err.to_string()),
    }
}

/// Serves `AdmissionReview` requests on `/validate` through a validation chain.
pub struct WebhookServer {
    chain: Arc<ValidationChain>,
    bind_address: String,
    port: u16,
}

impl WebhookServer {
    /// Creates a server for `chain` on `bind_address:port`.
    pub fn new(chain: ValidationChain, bind_address: impl Into<String>, port: u16) -> Self {
        Self {
            chain: Arc::new(chain),
            bind_address: bind_address.into(),
            port,
        }
    }

    /// Serves until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.bind_address, self.port);
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!(address = %addr, plugins = ?self.chain.names(), "Serving admission webhook");

        loop {
            let (stream, _) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = cancel.cancelled() => return Ok(()),
            };
            let chain = self.chain.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let chain = chain.clone();
                    async move { Ok::<_, hyper::Error>(handle_request(req, &chain).await) }
                });
                if let Err(e) = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    tracing::debug!(error = %e, "Webhook connection failed");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::deletionconfirmation::{DeletionConfirmation, PLUGIN_NAME};
    use crate::admission::ValidationInterface;
    use crate::apis::constants::CONFIRMATION_DELETION;
    use crate::apis::core::{Shoot, ShootSpec};
    use crate::client::fake::FakeClusterClient;
    use crate::client::ClusterClient;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn chain(client: &FakeClusterClient) -> ValidationChain {
        let plugin = DeletionConfirmation::new(Duration::from_millis(100));
        plugin.set_cache_client(client.clone());
        plugin.set_live_client(client.clone());
        ValidationChain::new(vec![(
            PLUGIN_NAME.to_string(),
            Arc::new(plugin) as Arc<dyn ValidationInterface>,
        )])
    }

    fn delete_review(name: &str) -> AdmissionReview<DynamicObject> {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "0d1e4f3a-2c3b-4d5e-8f9a-0b1c2d3e4f5a",
                "kind": {"group": "core.gardener.cloud", "version": "v1beta1", "kind": "Shoot"},
                "resource": {"group": "core.gardener.cloud", "version": "v1beta1", "resource": "shoots"},
                "name": name,
                "namespace": "garden-dev",
                "operation": "DELETE",
                "userInfo": {"username": "admin"},
                "dryRun": false
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_review_denies_unconfirmed_deletion() {
        let client = FakeClusterClient::new();
        client
            .create(&Shoot {
                metadata: ObjectMeta {
                    name: Some("foo".to_string()),
                    namespace: Some("garden-dev".to_string()),
                    ..Default::default()
                },
                spec: ShootSpec::default(),
                status: None,
            })
            .await
            .unwrap();

        let out = review(&chain(&client), delete_review("foo")).await;
        let response = out.response.unwrap();
        assert!(!response.allowed);
        assert_eq!(response.uid, "0d1e4f3a-2c3b-4d5e-8f9a-0b1c2d3e4f5a");
    }

    #[tokio::test]
    async fn test_review_allows_confirmed_deletion() {
        let client = FakeClusterClient::new();
        client
            .create(&Shoot {
                metadata: ObjectMeta {
                    name: Some("foo".to_string()),
                    namespace: Some("garden-dev".to_string()),
                    annotations: Some(BTreeMap::from([(
                        CONFIRMATION_DELETION.to_string(),
                        "true".to_string(),
                    )])),
                    ..Default::default()
                },
                spec: ShootSpec::default(),
                status: None,
            })
            .await
            .unwrap();

        let out = review(&chain(&client), delete_review("foo")).await;
        assert!(out.response.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_review_without_request() {
        let empty: AdmissionReview<DynamicObject> = serde_json::from_value(serde_json::json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview"
        }))
        .unwrap();
        let out = review(&ValidationChain::default(), empty).await;
        assert!(!out.response.unwrap().allowed);
    }
}
