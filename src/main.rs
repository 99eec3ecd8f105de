//! Trellis Operator - tenant-contributed edge nodes for Kubernetes

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};
use tokio::sync::watch;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use trellis::cluster::{KubeClusterClient, FIELD_MANAGER};
use trellis::config::Settings;
use trellis::controller::LifecycleHandler;
use trellis::crd::NodeContribution;
use trellis::dispatch::Dispatcher;
use trellis::dns::LogRegistrar;
use trellis::notify::LogNotifier;
use trellis::procedure::{ProcedureDeps, TaskLauncher};
use trellis::remote::ssh::SshTransport;
use trellis::retry::{retry_with_backoff, RetryConfig};
use trellis::token::KubeadmTokenIssuer;

/// Trellis - Kubernetes operator for tenant-contributed edge nodes
#[derive(Parser, Debug)]
#[command(name = "trellis", version, about, long_about = None)]
struct Cli {
    /// Generate the NodeContribution CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// DNS zone under which managed nodes are named
    #[arg(long, env = "TRELLIS_NODE_DOMAIN", default_value = trellis::DEFAULT_NODE_DOMAIN)]
    node_domain: String,

    /// Tenant operating the platform itself
    #[arg(long, env = "TRELLIS_PLATFORM_TENANT", default_value = trellis::DEFAULT_PLATFORM_TENANT)]
    platform_tenant: String,

    /// Kubernetes package version pinned during node installation
    #[arg(long, env = "TRELLIS_KUBERNETES_VERSION", default_value = "1.19.2")]
    kubernetes_version: String,

    /// Join token validity in seconds
    #[arg(long, env = "TRELLIS_JOIN_TOKEN_TTL", default_value = "600")]
    join_token_ttl_secs: u64,

    /// Number of dispatcher workers
    #[arg(long, env = "TRELLIS_WORKERS", default_value = "2")]
    workers: usize,
}

impl Cli {
    fn settings(&self) -> Settings {
        Settings {
            node_domain: self.node_domain.clone(),
            platform_tenant: self.platform_tenant.clone(),
            kubernetes_version: self.kubernetes_version.clone(),
            join_token_ttl: Duration::from_secs(self.join_token_ttl_secs),
            workers: self.workers,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&NodeContribution::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    run_operator(cli.settings()).await
}

/// Ensure the NodeContribution CRD is installed
///
/// The operator installs its own CRD on startup using server-side apply so
/// the schema always matches the operator version. Retried: the apiserver
/// may not be reachable yet right after deployment.
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("Installing NodeContribution CRD...");
    retry_with_backoff(
        &RetryConfig::with_max_attempts(5),
        "install_crd",
        || async {
            crds.patch(
                "nodecontributions.trellis.dev",
                &params,
                &Patch::Apply(&NodeContribution::crd()),
            )
            .await
        },
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install NodeContribution CRD: {}", e))?;

    tracing::info!("NodeContribution CRD installed/updated");
    Ok(())
}

/// Run the operator until SIGINT
async fn run_operator(settings: Settings) -> anyhow::Result<()> {
    tracing::info!("Trellis operator starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crd_installed(&client).await?;

    // Wire the orchestrator: every collaborator injected, no globals
    let store = Arc::new(KubeClusterClient::new(client.clone()));
    let deps = Arc::new(ProcedureDeps {
        store: store.clone(),
        transport: Arc::new(SshTransport),
        registrar: Arc::new(LogRegistrar),
        tokens: Arc::new(KubeadmTokenIssuer),
        notifier: Arc::new(LogNotifier),
        settings: settings.clone(),
    });
    let launcher = Arc::new(TaskLauncher::new(deps));
    let handler = Arc::new(LifecycleHandler::new(
        store,
        launcher,
        Arc::new(LogNotifier),
        settings.clone(),
    ));

    let contributions: Api<NodeContribution> = Api::all(client);
    let dispatcher = Dispatcher::new(contributions, handler, settings.workers);

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            let _ = stop_tx.send(true);
        }
    });

    tracing::info!(workers = settings.workers, "Starting NodeContribution dispatcher...");
    dispatcher.run(stop_rx).await;

    tracing::info!("Trellis operator shutting down");
    Ok(())
}
