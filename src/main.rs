//! lattice-netcore - networking control-plane startup helpers

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use lattice_netcore::controller::TaskManager;
use lattice_netcore::crd::{KubeCrdRegistry, ReadinessConfig, ReadinessWaiter};

/// lattice-netcore - networking control-plane startup helpers
#[derive(Parser, Debug)]
#[command(name = "lattice-netcore", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Block until the given CRDs are served by the API server
    ///
    /// Intended as an init step: exits 0 once every CRD was found, non-zero
    /// if any of them is still missing when the timeout expires.
    WaitForCrd(WaitForCrdArgs),
}

/// wait-for-crd arguments
#[derive(Parser, Debug)]
struct WaitForCrdArgs {
    /// Full CRD names, e.g. ciliumnodes.cilium.io
    #[arg(required = true)]
    names: Vec<String>,

    /// Seconds between lookups
    #[arg(long, env = "LATTICE_CRD_POLL_INTERVAL_SECS", default_value = "15")]
    interval_secs: u64,

    /// Seconds to wait for each CRD before giving up
    #[arg(long, env = "LATTICE_CRD_WAIT_TIMEOUT_SECS", default_value = "300")]
    timeout_secs: u64,

    /// Give up immediately on errors waiting cannot fix (e.g. RBAC denials)
    #[arg(long, env = "LATTICE_CRD_FAIL_FAST")]
    fail_fast: bool,
}

impl WaitForCrdArgs {
    fn config(&self) -> ReadinessConfig {
        ReadinessConfig::default()
            .with_poll_interval(Duration::from_secs(self.interval_secs))
            .with_timeout(Duration::from_secs(self.timeout_secs))
            .with_fail_fast(self.fail_fast)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::WaitForCrd(args) => run_wait_for_crd(args).await,
    }
}

async fn run_wait_for_crd(args: WaitForCrdArgs) -> anyhow::Result<()> {
    let config = args.config();
    config.validate()?;

    let client = kube::Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create kube client: {}", e))?;

    let waiter = ReadinessWaiter::new(
        Arc::new(KubeCrdRegistry::new(client)),
        Arc::new(TaskManager::new()),
    )
    .with_config(config);

    let failed: Vec<String> = waiter
        .wait_for_all(&args.names)
        .await
        .into_iter()
        .filter_map(|(name, outcome)| outcome.err().map(|e| format!("{}: {}", name, e)))
        .collect();

    if !failed.is_empty() {
        anyhow::bail!("CRDs not available: {}", failed.join("; "));
    }

    tracing::info!(crds = args.names.len(), "All CRDs available");
    Ok(())
}
