//! aks-mesh
//!
//! Provisions the multi-region AKS platform described by a region catalog.
//! Logs go to stderr as JSON; results are printed to stdout.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use aks_mesh_engine::config::{AzureContext, EngineSettings};
use aks_mesh_engine::orchestrator::{Orchestrator, RunReport};
use aks_mesh_engine::provider::identity::TokenSettings;
use aks_mesh_engine::provider::{ArmProvider, ArmSettings, InMemoryProvider, ResourceProvider, TokenSource};
use aks_mesh_engine::topology::credentials::CredentialKind;
use aks_mesh_engine::topology::ids::SubscriptionId;
use aks_mesh_engine::topology::{RegionCatalog, Stack, StackOutputs, ValidatedCatalog};

/// Multi-region AKS platform provisioning
#[derive(Parser, Debug)]
#[command(name = "aks-mesh", version, about)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// Region catalog (JSON). Defaults to the built-in three-region catalog.
    #[arg(long, global = true, env = "AKS_MESH_CATALOG")]
    catalog: Option<PathBuf>,

    /// Target subscription
    #[arg(long, global = true, env = "AZURE_SUBSCRIPTION_ID")]
    subscription_id: Option<String>,

    #[arg(long, global = true, env = "AZURE_TENANT_ID")]
    tenant_id: Option<String>,

    #[arg(long, global = true, env = "AZURE_CLIENT_ID")]
    client_id: Option<String>,

    #[arg(long, global = true, env = "AZURE_CLIENT_SECRET", hide_env_values = true)]
    client_secret: Option<String>,

    /// Workload identity token file
    #[arg(long, global = true, env = "AZURE_FEDERATED_TOKEN_FILE")]
    federated_token_file: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        default_value = aks_mesh_engine::provider::azure::DEFAULT_ENDPOINT,
        env = "AZURE_RESOURCE_MANAGER_ENDPOINT"
    )]
    endpoint: String,

    /// Maximum provisioning calls in flight
    #[arg(long, global = true, default_value = "8", env = "AKS_MESH_PARALLELISM")]
    parallelism: usize,

    /// Polling interval for long-running operations, in seconds
    #[arg(long, global = true, default_value = "10", env = "AKS_MESH_POLL_INTERVAL")]
    poll_interval: u64,

    /// Give up waiting on a long-running operation after this many seconds
    #[arg(long, global = true, default_value = "1800", env = "AKS_MESH_OPERATION_TIMEOUT")]
    operation_timeout: u64,

    /// Kubeconfig bundle to export (admin or user)
    #[arg(long, global = true, default_value = "admin")]
    credentials: CredentialKind,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check the catalog without contacting Azure
    Validate,
    /// Show what `up` would create or update
    Preview {
        /// Plan against an empty in-memory backend
        #[arg(long)]
        offline: bool,
    },
    /// Create or reconcile every resource
    Up {
        #[arg(long)]
        show_secrets: bool,
    },
    /// Read every resource and report its state
    Refresh,
    /// Print the published outputs of the current deployment
    Outputs {
        #[arg(long)]
        show_secrets: bool,
    },
    /// Delete every resource, dependents first
    Destroy {
        /// Required confirmation
        #[arg(long)]
        yes: bool,
    },
}

impl GlobalArgs {
    fn settings(&self) -> EngineSettings {
        EngineSettings {
            parallelism: self.parallelism,
            poll_interval: Duration::from_secs(self.poll_interval),
            operation_timeout: Duration::from_secs(self.operation_timeout),
            credential_kind: self.credentials,
        }
    }

    fn context(&self) -> Result<AzureContext> {
        let raw = self
            .subscription_id
            .as_deref()
            .context("AZURE_SUBSCRIPTION_ID is not set (or pass --subscription-id)")?;
        let subscription = SubscriptionId::parse(raw)?;
        Ok(AzureContext::new(subscription))
    }

    fn provider(&self, settings: &EngineSettings) -> Result<Arc<dyn ResourceProvider>> {
        let tokens = TokenSource::from_settings(TokenSettings {
            tenant_id: self.tenant_id.clone(),
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            federated_token_file: self.federated_token_file.clone(),
        })?;

        let provider = ArmProvider::new(
            tokens,
            ArmSettings {
                endpoint: self.endpoint.clone(),
                poll_interval: settings.poll_interval,
                operation_timeout: settings.operation_timeout,
            },
        )?;
        Ok(Arc::new(provider))
    }
}

fn load_catalog(path: Option<&PathBuf>) -> Result<ValidatedCatalog> {
    let catalog = match path {
        Some(path) => {
            info!(path = %path.display(), "Loading region catalog");
            RegionCatalog::from_file(path)?
        }
        None => RegionCatalog::default_europe(),
    };

    catalog.validate().context("Region catalog is invalid")
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn ensure_success(report: &RunReport, stack: &Stack) -> Result<()> {
    if report.is_success() {
        return Ok(());
    }

    for (node, err) in report.failures() {
        let region = stack.region_of(node).unwrap_or("cross-region");
        if err.is_pending() {
            warn!(region = %region, error = %err, "Resource did not finish provisioning");
        } else {
            error!(region = %region, error = %err, "Resource failed");
        }
    }

    let summary = report.summary();
    anyhow::bail!(
        "{} failed: {} failed, {} pending, {} skipped",
        report.operation,
        summary.failed,
        summary.pending,
        summary.skipped
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .json()
        .init();

    let cli = Cli::parse();
    let settings = cli.global.settings();
    let catalog = load_catalog(cli.global.catalog.as_ref())?;

    match cli.command {
        Command::Validate => {
            info!(
                regions = catalog.regions().len(),
                peerings = catalog.peerings().len(),
                "Region catalog is valid"
            );
            let regions: Vec<&str> = catalog.regions().iter().map(|r| r.name()).collect();
            let peerings: Vec<String> = catalog.peerings().iter().map(|p| p.key()).collect();
            print_json(&serde_json::json!({
                "regions": regions,
                "peerings": peerings,
                "cluster_policy": catalog.cluster_policy(),
            }))?;
        }

        Command::Preview { offline } => {
            let (ctx, provider): (AzureContext, Arc<dyn ResourceProvider>) = if offline {
                let ctx = match cli.global.subscription_id.as_deref() {
                    Some(raw) => AzureContext::new(SubscriptionId::parse(raw)?),
                    None => AzureContext::new(SubscriptionId::parse("00000000-0000-0000-0000-000000000000")?),
                };
                let provider: Arc<dyn ResourceProvider> = Arc::new(InMemoryProvider::new());
                (ctx, provider)
            } else {
                (cli.global.context()?, cli.global.provider(&settings)?)
            };

            let stack = Stack::build(&ctx, &catalog, settings.credential_kind)?;
            let orchestrator = Orchestrator::new(provider, settings.parallelism);
            let plan = orchestrator.preview(stack.graph()).await?;
            print_json(&serde_json::to_value(&plan)?)?;
        }

        Command::Up { show_secrets } => {
            let ctx = cli.global.context()?;
            let stack = Stack::build(&ctx, &catalog, settings.credential_kind)?;
            let orchestrator = Orchestrator::new(cli.global.provider(&settings)?, settings.parallelism);

            let report = orchestrator.apply(stack.graph()).await;
            let outputs = StackOutputs::collect(&stack, &report);
            print_json(&outputs.to_json(show_secrets))?;
            ensure_success(&report, &stack)?;
        }

        Command::Refresh => {
            let ctx = cli.global.context()?;
            let stack = Stack::build(&ctx, &catalog, settings.credential_kind)?;
            let orchestrator = Orchestrator::new(cli.global.provider(&settings)?, settings.parallelism);

            let report = orchestrator.refresh(stack.graph()).await;
            print_json(&serde_json::to_value(report.summary())?)?;
            ensure_success(&report, &stack)?;
        }

        Command::Outputs { show_secrets } => {
            let ctx = cli.global.context()?;
            let stack = Stack::build(&ctx, &catalog, settings.credential_kind)?;
            let orchestrator = Orchestrator::new(cli.global.provider(&settings)?, settings.parallelism);

            let report = orchestrator.refresh(stack.graph()).await;
            let outputs = StackOutputs::collect(&stack, &report);
            print_json(&outputs.to_json(show_secrets))?;
        }

        Command::Destroy { yes } => {
            if !yes {
                anyhow::bail!("destroy deletes every resource in the catalog; pass --yes to confirm");
            }

            let ctx = cli.global.context()?;
            let stack = Stack::build(&ctx, &catalog, settings.credential_kind)?;
            let orchestrator = Orchestrator::new(cli.global.provider(&settings)?, settings.parallelism);

            let report = orchestrator.destroy(stack.graph()).await;
            print_json(&serde_json::to_value(report.summary())?)?;
            ensure_success(&report, &stack)?;
        }
    }

    Ok(())
}
