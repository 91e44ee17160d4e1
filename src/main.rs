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

//! gardener - runs the gardenlet, the node agent or the admission webhook.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gardener::admission::webhook::WebhookServer;
use gardener::admission::{self, PluginContext, Plugins};
use gardener::apis::core::{Project, Shoot, ShootState};
use gardener::client::KubeClusterClient;
use gardener::config::{
    self, AdmissionConfiguration, GardenletConfiguration, ManagerConfig, NodeAgentConfiguration,
};
use gardener::controller_context::ControllerContext;
use gardener::controller_manager::ControllerManager;
use gardener::feature::MemoryFeatureGate;
use gardener::health::{HealthRegistry, HealthServer};
use gardener::leader_election::{self, LeaderElector};
use gardener::{gardenlet, nodeagent};

/// Gardener components
///
/// One binary for the agent reconciling shoot control planes on a seed, the
/// agent provisioning shoot worker nodes and the admission webhook guarding
/// deletions in the garden cluster.
#[derive(Parser, Debug)]
#[command(name = "gardener")]
#[command(version = gardener::VERSION)]
#[command(about = "Gardener components", long_about = None)]
struct Cli {
    /// Path to the kubeconfig file, overrides the configured client connection
    #[arg(long, global = true)]
    kubeconfig: Option<PathBuf>,

    /// Path to the component configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long, global = true)]
    log_json: bool,

    /// Feature gates to enable/disable
    ///
    /// Format: "Feature1=true,Feature2=false"
    #[arg(long, global = true)]
    feature_gates: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reconciles shoot control planes on a seed cluster
    Gardenlet,
    /// Applies the operating system config on a shoot worker node
    NodeAgent,
    /// Serves the validating admission webhook
    Admission,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_json);

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        wait_for_shutdown().await;
        token.cancel();
    });

    let result = match cli.command {
        Command::Gardenlet => run_gardenlet(&cli, cancel).await,
        Command::NodeAgent => run_node_agent(&cli, cancel).await,
        Command::Admission => run_admission(&cli, cancel).await,
    };
    if let Err(e) = &result {
        error!("{:#}", e);
    }
    result
}

fn init_logging(level: &str, json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer())
            .init();
    }
}

fn require_config<T: serde::de::DeserializeOwned>(cli: &Cli) -> anyhow::Result<T> {
    let path = cli.config.as_deref().context("--config is required")?;
    config::load(path)
}

fn feature_gate(cli: &Cli, configured: &BTreeMap<String, bool>) -> anyhow::Result<Arc<MemoryFeatureGate>> {
    let gate = MemoryFeatureGate::gardener();
    gate.set_from_map(configured).context("invalid feature gates in config")?;
    if let Some(flag) = &cli.feature_gates {
        gate.set_from_string(flag).context("invalid --feature-gates")?;
    }
    Ok(Arc::new(gate))
}

/// Builds a kube client from the first kubeconfig given, or infers one from
/// the environment.
async fn kube_client(kubeconfigs: &[Option<&Path>]) -> anyhow::Result<kube::Client> {
    use kube::config::{KubeConfigOptions, Kubeconfig};

    let config = match kubeconfigs.iter().flatten().next() {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("failed to read kubeconfig from: {path:?}"))?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .with_context(|| format!("failed to load kubeconfig from: {path:?}"))?
        }
        None => kube::Config::infer().await.context("failed to infer kubeconfig")?,
    };
    Ok(kube::Client::try_from(config)?)
}

async fn run_gardenlet(cli: &Cli, cancel: CancellationToken) -> anyhow::Result<()> {
    let cfg: GardenletConfiguration = require_config(cli)?;
    info!(seed = %cfg.seed_config.name, "Starting {}", gardenlet::NAME);

    let gate = feature_gate(cli, &cfg.feature_gates)?;
    let seed = kube_client(&[
        cli.kubeconfig.as_deref(),
        cfg.seed_client_connection.kubeconfig.as_deref(),
    ])
    .await?;
    let garden = kube_client(&[cfg.garden_client_connection.kubeconfig.as_deref()]).await?;
    let seed_client = KubeClusterClient::new(seed).with_field_manager(gardenlet::NAME);
    let garden_client = KubeClusterClient::new(garden).with_field_manager(gardenlet::NAME);

    let identity = leader_election::create_identity();
    let ctx = ControllerContext::new(
        seed_client.clone(),
        Some(garden_client),
        Arc::new(cfg.manager.clone()),
        gate,
        identity.clone(),
    );
    let health = HealthRegistry::new();
    let mut manager = ControllerManager::new(ctx).with_health(health.clone());
    if cfg.leader_election.leader_elect {
        leader_election::validate(&cfg.leader_election)?;
        manager = manager.with_leader_election(LeaderElector::new(
            seed_client,
            cfg.leader_election.clone(),
            identity,
        ));
    }
    gardenlet::add_to_manager(&mut manager, &cfg).await?;

    run_manager(manager, health, &cfg.health_server, cancel).await
}

async fn run_node_agent(cli: &Cli, cancel: CancellationToken) -> anyhow::Result<()> {
    let mut cfg: NodeAgentConfiguration = require_config(cli)?;
    if cfg.node_name.is_empty() {
        cfg.node_name = std::env::var("NODE_NAME").unwrap_or_default();
    }
    info!(node = %cfg.node_name, "Starting {}", nodeagent::NAME);

    let gate = feature_gate(cli, &cfg.feature_gates)?;
    let client = kube_client(&[cli.kubeconfig.as_deref(), cfg.client_connection.kubeconfig.as_deref()]).await?;
    let client = KubeClusterClient::new(client).with_field_manager(nodeagent::NAME);

    let ctx = ControllerContext::new(
        client,
        None,
        Arc::new(ManagerConfig::default()),
        gate,
        leader_election::create_identity(),
    );
    let health = HealthRegistry::new();
    let mut manager = ControllerManager::new(ctx).with_health(health.clone());
    nodeagent::add_to_manager(&mut manager, &cfg)?;

    run_manager(manager, health, &cfg.health_server, cancel).await
}

async fn run_admission(cli: &Cli, cancel: CancellationToken) -> anyhow::Result<()> {
    let cfg: AdmissionConfiguration = match &cli.config {
        Some(path) => config::load(path)?,
        None => AdmissionConfiguration::default(),
    };
    info!(plugins = ?cfg.plugins, "Starting admission webhook");

    let client = kube_client(&[cli.kubeconfig.as_deref(), cfg.client_connection.kubeconfig.as_deref()]).await?;
    let mut plugins = Plugins::new();
    admission::register_all_admission_plugins(&mut plugins)?;

    let cache_client = KubeClusterClient::cached(client.clone());
    cache_client.start_informer::<Shoot>();
    cache_client.start_informer::<Project>();
    cache_client.start_informer::<ShootState>();
    let synced = cache_client.clone();
    let ctx = PluginContext {
        cache_client,
        live_client: KubeClusterClient::new(client),
        ready_func: Some(Arc::new(move || synced.has_synced())),
        ready_timeout: cfg.ready_timeout,
    };
    let chain = plugins.new_from_plugins(&cfg.plugins, &ctx)?;

    WebhookServer::new(chain, cfg.server.bind_address.clone(), cfg.server.port)
        .run(cancel)
        .await
}

async fn run_manager(
    manager: ControllerManager<KubeClusterClient>,
    health: HealthRegistry,
    health_server: &config::ServerConfig,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let shutdown = manager.shutdown_token();
    let server = HealthServer::new(health, health_server.bind_address.clone(), health_server.port).spawn(shutdown.clone());
    tokio::spawn(async move {
        cancel.cancelled().await;
        shutdown.cancel();
    });

    let result = manager.run().await;
    manager.shutdown();
    if let Ok(Err(e)) = server.await {
        error!(error = %e, "Health server failed");
    }
    result?;
    info!("Exited successfully");
    Ok(())
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_shutdown() {
    use tokio::signal;

    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("Received SIGINT, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        if signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down");
        }
    }
}
