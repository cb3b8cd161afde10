//! Entry point for the kflow pipeline runner: loads a JSON pipeline
//! configuration, brings up a `Supervisor`, and runs until ctrl-c or a
//! component failure forces a stop.

mod supervisor;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use kflow_core::config::PipelineConfig;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use supervisor::Supervisor;

/// Runs a kflow pipeline from a JSON configuration document.
#[derive(Parser, Debug)]
#[command(name = "kflow")]
#[command(about = "Kafka-to-ClickHouse streaming ETL runner")]
#[command(long_about = "
kflow reads a JSON pipeline configuration describing a Kafka source, a
ClickHouse sink, and the schema versions bridging them, then runs the
ingestor and sink until stopped.

Examples:
  kflow --config pipelines/events.json
  RUST_LOG=debug kflow -c pipelines/events.json
")]
struct Args {
    /// Path to the pipeline JSON configuration file.
    #[arg(short, long)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let config = match load_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "configuration rejected");
            return ExitCode::from(1);
        }
    };

    let supervisor = match Supervisor::connect(&config.bus.url).await {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "failed to connect to bus");
            return ExitCode::from(2);
        }
    };

    if let Err(e) = supervisor.start(config).await {
        tracing::error!(error = %e, "pipeline failed to start");
        return ExitCode::from(2);
    }

    let _ = signal::ctrl_c().await;
    tracing::info!("received ctrl-c, shutting down");
    supervisor.shutdown_all().await;
    ExitCode::from(0)
}

fn load_config(path: &PathBuf) -> anyhow::Result<PipelineConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file '{}'", path.display()))?;
    serde_json::from_str(&raw).context("failed to parse pipeline configuration")
}
