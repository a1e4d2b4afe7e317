// txcost CLI
//
// Design Decision: Use clap derive for argument parsing, with TXCOST_CONFIG as
// the environment fallback for the config path.
// Design Decision: Run on a current-thread runtime; iterations and entries are
// strictly sequential.

mod output;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use txcost_bench::{load_config, InMemoryConnector, TestMatrixDriver};
use txcost_core::InMemoryReplicaSet;

#[derive(Parser)]
#[command(name = "txcost")]
#[command(about = "Measure the latency cost of write concern, read concern and read preference")]
#[command(version)]
pub struct Cli {
    /// Harness config file (built-in matrix when omitted)
    #[arg(long, short, env = "TXCOST_CONFIG")]
    pub config: Option<PathBuf>,

    /// Iterations per matrix entry
    #[arg(long, short = 'n')]
    pub iterations: Option<u64>,

    /// Directory for graphs and the run summary
    #[arg(long, short)]
    pub output_dir: Option<PathBuf>,

    /// Seed of the simulated replica set
    #[arg(long)]
    pub seed: Option<u64>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    if let Ok(path) = dotenvy::dotenv() {
        eprintln!("Loaded environment from {}", path.display());
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "txcost=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref()).context("Failed to load config")?;
    if let Some(iterations) = cli.iterations {
        config = config.with_iterations(iterations);
    }
    if let Some(output_dir) = cli.output_dir {
        config = config.with_output_dir(output_dir);
    }
    if let Some(seed) = cli.seed {
        config = config.with_seed(seed);
    }
    let matrix = config.matrix().context("Invalid test matrix")?;

    let cluster = InMemoryReplicaSet::new(config.cluster.clone());
    tracing::info!(
        members = cluster.member_count(),
        version = %config.cluster.server_version,
        "simulated replica set ready"
    );

    let connector = InMemoryConnector::new(cluster);
    let mut driver = TestMatrixDriver::new(connector, matrix, config.fixture())
        .with_test_name(config.test_name.clone())
        .with_output_dir(config.output_dir.clone());
    let run = driver.run().await;

    output::print_run_summary(&run);
    if let Some(path) = &run.summary_path {
        output::print_field("Summary", &path.display().to_string());
    }

    if run.failed() > 0 {
        tracing::warn!(failed = run.failed(), "some matrix entries failed");
    }
    Ok(())
}
