mod config;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use crate::config::ProbeConfig;
use pubconfirm_core::{Topology, TopologyError};
use pubconfirm_engine::PublishError;
use pubconfirm_sim::{ConfirmHarness, ProbeResult};
use pubconfirm_transport::ConfirmTransport;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
enum ProbeError {
    #[error("failed to load config: {0}")]
    Config(#[from] ::config::ConfigError),
    #[error("invalid topology: {0}")]
    Topology(#[from] TopologyError),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error("failed to encode output: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("{failed} of {total} probes missed their expected outcome")]
    Mismatch { failed: usize, total: usize },
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (`.env` files are loaded into the environment)
    #[arg(long, short)]
    config: Option<PathBuf>,
    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish every configured probe and report its confirm (default)
    Run,
    /// Print the declared topology
    Topology,
}

fn render_result(result: &ProbeResult) -> String {
    let mut line = format!(
        "{}: {} (exchange={} routing_key={} id={})",
        result.name, result.outcome, result.exchange, result.routing_key, result.correlation_id
    );
    if let Some(expected) = result.expected.filter(|_| !result.passed()) {
        line.push_str(&format!(" MISMATCH expected {expected:?}"));
    }
    line
}

fn render_topology(topology: &Topology) -> Vec<String> {
    let mut lines = Vec::new();
    for exchange in topology.exchanges() {
        let bound = if topology.is_bound(&exchange.name) {
            ""
        } else {
            ", unbound"
        };
        lines.push(format!(
            "exchange {} ({}{}{})",
            exchange.name,
            exchange.kind,
            if exchange.durable { ", durable" } else { "" },
            bound
        ));
    }
    for queue in topology.queues() {
        lines.push(format!(
            "queue {}{}",
            queue.name,
            if queue.durable { " (durable)" } else { "" }
        ));
    }
    for binding in topology.bindings() {
        lines.push(format!(
            "binding {} -> {} [{}]",
            binding.exchange, binding.queue, binding.routing_key
        ));
    }
    lines
}

async fn run_probes(config: &ProbeConfig, json: bool) -> Result<(), ProbeError> {
    let topology = config.topology()?;
    let cases = config.probe_cases();
    if cases.is_empty() {
        warn!("no probes selected");
    }

    let harness = ConfirmHarness::start(topology, config.engine_config());
    let results = harness.run_probes(&cases, config.wait_timeout).await;
    let shutdown = harness.shutdown().await;
    let results = results?;

    for result in &results {
        if json {
            println!("{}", serde_json::to_string(result)?);
        } else {
            println!("{}", render_result(result));
        }
    }

    let stats = harness.publisher.stats();
    let health = harness.broker.health_snapshot();
    info!(
        published = stats.published,
        acked = stats.acked,
        nacked = stats.nacked,
        timed_out = stats.timed_out,
        unroutable = health.unroutable_messages,
        drained = shutdown.drained,
        expired = shutdown.expired,
        "probe run finished"
    );

    let failed = results.iter().filter(|r| !r.passed()).count();
    if failed > 0 && config.fail_on_mismatch {
        return Err(ProbeError::Mismatch {
            failed,
            total: results.len(),
        });
    }
    Ok(())
}

fn print_topology(config: &ProbeConfig, json: bool) -> Result<(), ProbeError> {
    let topology = config.topology()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&topology)?);
    } else {
        for line in render_topology(&topology) {
            println!("{line}");
        }
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<(), ProbeError> {
    let config = ProbeConfig::new(cli.config)?;
    match cli.command {
        Some(Commands::Topology) => print_topology(&config, cli.json),
        Some(Commands::Run) | None => run_probes(&config, cli.json).await,
    }
}

#[tokio::main]
async fn main() {
    let filter = std::env::var("PUBCONFIRM_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        error!("{err}");
        std::process::exit(1);
    }
}
