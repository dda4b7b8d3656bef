//! ---
//! scada_section: "04-rtu-runtime"
//! scada_subsection: "binary"
//! scada_type: "source"
//! scada_scope: "code"
//! scada_description: "Binary entrypoint for one RTU node service."
//! scada_version: "v0.1.0"
//! scada_owner: "tbd"
//! ---
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use scada_common::config::RtuConfig;
use scada_common::logging::init_tracing;
use scada_rtu::RtuRuntime;
use tokio::signal;
use tracing::info;

#[derive(Debug, Parser)]
#[command(author, version, about = "SCADA RTU node service", long_about = None)]
struct Cli {
    #[arg(
        long,
        env = "SCADA_NODE_ID",
        value_name = "ID",
        help = "Node identity from the catalogue, e.g. GEN-001"
    )]
    node_id: String,

    #[arg(
        long,
        env = "SCADA_MASTER_IP",
        default_value = "10.0.0.1",
        help = "Master address authorised on every protocol"
    )]
    master_ip: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = RtuConfig::for_node(&cli.node_id)?;
    init_tracing(&format!("scada-rtud-{}", cli.node_id.to_lowercase()), &config.logging)?;
    info!(node = %cli.node_id, master = %cli.master_ip, "starting rtu");

    let handle = RtuRuntime::new(config, cli.master_ip).spawn().await?;

    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");
    handle.shutdown(Duration::from_secs(5)).await;
    Ok(())
}
