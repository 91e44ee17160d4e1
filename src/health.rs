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

//! Liveness and readiness endpoints.
//!
//! `/healthz` reports that the process is alive. `/readyz` reports ready once
//! the component marked itself ready and all registered checks pass.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Boxed future returned by [`HealthChecker::check`].
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Status of a check or of the whole component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All checks pass.
    Healthy,
    /// At least one check fails.
    Unhealthy,
}

/// Result of running all registered checks.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    /// Overall status.
    pub status: HealthStatus,

    /// Status per check.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub checks: BTreeMap<String, HealthStatus>,
}

/// A named readiness check.
pub trait HealthChecker: Send + Sync + 'static {
    /// Returns `true` if the checked part is healthy.
    fn check(&self) -> BoxFuture<'_, bool>;

    /// Name reported in [`HealthCheck::checks`].
    fn name(&self) -> &str;
}

/// Adapter for implementing [`HealthChecker`] with a function.
pub struct FunctionHealthChecker<F> {
    name: String,
    check_fn: F,
}

impl<F> FunctionHealthChecker<F> {
    /// Creates a checker named `name` calling `check_fn`.
    pub fn new(name: impl Into<String>, check_fn: F) -> Self {
        Self {
            name: name.into(),
            check_fn,
        }
    }
}

impl<F, Fut> HealthChecker for FunctionHealthChecker<F>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    fn check(&self) -> BoxFuture<'_, bool> {
        Box::pin((self.check_fn)())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Registry of readiness checks shared between the component and its health
/// server. Clones share state.
#[derive(Clone, Default)]
pub struct HealthRegistry {
    checkers: Arc<RwLock<Vec<Arc<dyn HealthChecker>>>>,
    ready: Arc<AtomicBool>,
}

impl HealthRegistry {
    /// Creates an empty, unready registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a checker.
    pub async fn register(&self, checker: Arc<dyn HealthChecker>) {
        self.checkers.write().await.push(checker);
    }

    /// Removes a checker by name, returning whether one was removed.
    pub async fn unregister(&self, name: &str) -> bool {
        let mut checkers = self.checkers.write().await;
        let before = checkers.len();
        checkers.retain(|c| c.name() != name);
        checkers.len() < before
    }

    /// Marks the component as (not) ready.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Whether the component reported readiness.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Runs all checks.
    pub async fn check_all(&self) -> HealthCheck {
        let checkers = self.checkers.read().await;
        let mut checks = BTreeMap::new();
        for checker in checkers.iter() {
            let status = if checker.check().await {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy
            };
            checks.insert(checker.name().to_string(), status);
        }

        let healthy = self.is_ready() && checks.values().all(|s| *s == HealthStatus::Healthy);
        HealthCheck {
            status: if healthy {
                HealthStatus::Healthy
            } else {
                HealthStatus::Unhealthy
            },
            checks,
        }
    }

    /// Number of registered checkers.
    pub async fn len(&self) -> usize {
        self.checkers.read().await.len()
    }

    /// True when no checker is registered.
    pub async fn is_empty(&self) -> bool {
        self.checkers.read().await.is_empty()
    }
}

/// HTTP server exposing `/healthz` and `/readyz`.
pub struct HealthServer {
    registry: HealthRegistry,
    bind_address: String,
    port: u16,
}

impl HealthServer {
    /// Creates a server for `registry` on `bind_address:port`.
    pub fn new(registry: HealthRegistry, bind_address: impl Into<String>, port: u16) -> Self {
        Self {
            registry,
            bind_address: bind_address.into(),
            port,
        }
    }

    /// The served registry.
    pub fn registry(&self) -> &HealthRegistry {
        &self.registry
    }

    /// Serves health checks until `cancel` is triggered.
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.bind_address, self.port);
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!(address = %addr, "Serving health checks");

        loop {
            let (stream, _) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = cancel.cancelled() => return Ok(()),
            };
            let registry = self.registry.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let registry = registry.clone();
                    async move { Ok::<_, hyper::Error>(handle_request(req.uri().path(), &registry).await) }
                });
                if let Err(e) = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    tracing::debug!(error = %e, "Health check connection failed");
                }
            });
        }
    }

    /// Spawns the server. It stops when `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        tokio::spawn(self.run(cancel))
    }
}

pub(crate) fn respond(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    if let Ok(value) = content_type.parse() {
        response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

async fn handle_request(path: &str, registry: &HealthRegistry) -> Response<Full<Bytes>> {
    match path {
        "/healthz" => respond(StatusCode::OK, "text/plain", "ok"),
        "/readyz" => {
            let result = registry.check_all().await;
            let status = match result.status {
                HealthStatus::Healthy => StatusCode::OK,
                HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
            };
            let body = serde_json::to_string(&result).unwrap_or_default();
            respond(status, "application/json", body)
        }
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "not found"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_registry() {
        let registry = HealthRegistry::new();
        registry
            .register(Arc::new(FunctionHealthChecker::new("shoot", || async { true })))
            .await;
        assert_eq!(registry.len().await, 1);

        assert_eq!(registry.check_all().await.status, HealthStatus::Unhealthy);
        registry.set_ready(true);
        let result = registry.check_all().await;
        assert_eq!(result.status, HealthStatus::Healthy);
        assert_eq!(result.checks.get("shoot"), Some(&HealthStatus::Healthy));

        assert!(registry.unregister("shoot").await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_unhealthy_checker() {
        let registry = HealthRegistry::new();
        registry.set_ready(true);
        registry
            .register(Arc::new(FunctionHealthChecker::new("failing", || async { false })))
            .await;

        let result = registry.check_all().await;
        assert_eq!(result.status, HealthStatus::Unhealthy);
        assert_eq!(result.checks.get("failing"), Some(&HealthStatus::Unhealthy));
    }

    #[tokio::test]
    async fn test_endpoints() {
        let registry = HealthRegistry::new();

        assert_eq!(handle_request("/healthz", &registry).await.status(), StatusCode::OK);
        assert_eq!(
            handle_request("/readyz", &registry).await.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        registry.set_ready(true);
        assert_eq!(handle_request("/readyz", &registry).await.status(), StatusCode::OK);
        assert_eq!(handle_request("/metrics", &registry).await.status(), StatusCode::NOT_FOUND);
    }
}
