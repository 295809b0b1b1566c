//! Ray Operator - Kubernetes lifecycle management for Ray clusters

use std::sync::Arc;

use clap::{Parser, Subcommand};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt};

use ray_common::crd::Ray;
use ray_common::leader_election::{LeaderElector, LEADER_LEASE_NAME};
use ray_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use ray_common::{FIELD_MANAGER, RAY_SYSTEM_NAMESPACE};
use ray_operator::controller_runner::build_ray_controllers;

/// Ray operator - CRD-driven controller for Ray clusters
#[derive(Parser, Debug)]
#[command(name = "ray-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Acquire a Lease before reconciling so only one replica is active
    #[arg(long, env = "RAY_OPERATOR_LEADER_ELECTION")]
    enable_leader_election: bool,

    /// Namespace holding the leader election Lease
    #[arg(long, env = "POD_NAMESPACE", default_value = RAY_SYSTEM_NAMESPACE)]
    lease_namespace: String,

    /// Holder identity for the Lease (defaults to the pod name)
    #[arg(long, env = "POD_NAME")]
    identity: Option<String>,

    /// Log output format: text or json
    #[arg(long, env = "RAY_OPERATOR_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    ///
    /// Installs the Ray CRD, then watches Ray objects and reconciles their
    /// head Deployment, worker Deployment and head Service.
    Controller,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&Ray::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        log_format: cli.log_format,
        ..Default::default()
    })?;

    match cli.command {
        Some(Commands::Controller) | None => run_controller(&cli).await,
    }
}

/// Ensure the Ray CRD is installed
///
/// The operator installs its own CRD on startup using server-side apply so
/// the schema always matches the operator version.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("Installing Ray CRD...");
    crds.patch("rays.ray.kubeflow.org", &params, &Patch::Apply(&Ray::crd()))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to install Ray CRD: {}", e))?;

    tracing::info!("Ray CRD installed/updated");
    Ok(())
}

async fn run_controller(cli: &Cli) -> anyhow::Result<()> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Ray operator");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    let mut guard = if cli.enable_leader_election {
        let identity = cli
            .identity
            .clone()
            .unwrap_or_else(|| format!("ray-operator-{}", std::process::id()));
        tracing::info!(
            identity = %identity,
            namespace = %cli.lease_namespace,
            "Waiting for leadership..."
        );
        let elector = Arc::new(LeaderElector::new(
            client.clone(),
            LEADER_LEASE_NAME,
            &cli.lease_namespace,
            &identity,
        ));
        Some(elector.acquire().await?)
    } else {
        None
    };

    tracing::info!("Starting controllers:");
    let controllers = futures::future::join_all(build_ray_controllers(client));

    match guard.as_mut() {
        Some(leader) => {
            tokio::select! {
                _ = controllers => {
                    tracing::info!("Ray controller completed");
                }
                _ = leader.lost() => {
                    tracing::warn!("Leadership lost, shutting down");
                    return Err(anyhow::anyhow!("leadership lost"));
                }
            }
            if let Err(e) = leader.release_leadership().await {
                tracing::warn!(error = %e, "Failed to release leadership");
            }
        }
        None => {
            controllers.await;
            tracing::info!("Ray controller completed");
        }
    }

    tracing::info!("Ray operator shutting down");
    Ok(())
}
