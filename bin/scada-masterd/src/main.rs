//! ---
//! scada_section: "05-master-runtime"
//! scada_subsection: "binary"
//! scada_type: "source"
//! scada_scope: "code"
//! scada_description: "Binary entrypoint for the SCADA master daemon."
//! scada_version: "v0.1.0"
//! scada_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use scada_common::config::MasterConfig;
use scada_common::logging::init_tracing;
use scada_historian::NdjsonSink;
use scada_master::MasterRuntime;
use scada_metrics::MasterMetrics;
use tokio::signal;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about = "SCADA master daemon", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(
        long,
        value_name = "DIR",
        default_value = "target/historian",
        help = "Directory for the NDJSON historian sink"
    )]
    historian_dir: PathBuf,

    #[arg(long, help = "Disable the Prometheus exporter")]
    no_metrics: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/master.toml"));
    candidates.push(PathBuf::from("configs/master.dev.toml"));
    let config = MasterConfig::load(&candidates)?;

    init_tracing("scada-masterd", &config.logging)?;
    info!(nodes = config.nodes.len(), http = %config.http_listen, "configuration loaded");

    let metrics = MasterMetrics::new()?;
    let exporter = if cli.no_metrics {
        info!("metrics exporter disabled");
        None
    } else {
        Some(metrics.serve(config.metrics_listen).await?)
    };

    let sink = Arc::new(NdjsonSink::new(&cli.historian_dir)?);
    let master = MasterRuntime::new(config, sink)
        .with_metrics(metrics)
        .spawn()
        .await?;

    info!("daemon running; waiting for termination signal");
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");

    master.shutdown().await;
    if let Some(exporter) = exporter {
        if let Err(err) = exporter.shutdown().await {
            warn!(error = %err, "metrics exporter shutdown error");
        }
    }
    Ok(())
}
