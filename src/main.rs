//! machine-api-operator entry point
//!
//! Starts the MachineSet, MachineHealthCheck, machine, and nodelink
//! controllers plus the health/metrics server, and runs them until
//! shutdown.

use std::net::SocketAddr;
use std::process;
use std::sync::Arc;

use clap::Parser;
use kube::Client;
use tracing::error;
use tracing_subscriber::EnvFilter;

use machine_api::controller::{
    run_health_check_controller, run_machine_controller, run_machine_set_controller,
    run_node_link_controller, HealthCheckContext, MachineContext, MachineSetContext,
    NodeLinkContext,
};
use machine_api::error::Result;
use machine_api::server::run_server;

#[derive(Parser)]
#[command(name = "machine-api-operator")]
#[command(about = "Controllers managing the lifecycle of Machines backing cluster nodes", long_about = None)]
#[command(version)]
struct Cli {
    /// Address for the health and metrics endpoints
    #[arg(long, default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Skip remediation of control-plane machines instead of deleting them
    #[arg(long)]
    protect_control_plane: bool,
}

async fn run(cli: Cli) -> Result<()> {
    let client = Client::try_default().await?;

    let machine_set_ctx = Arc::new(MachineSetContext::new(client.clone()));
    let mut health_check_ctx = HealthCheckContext::new(client.clone());
    health_check_ctx.protect_control_plane = cli.protect_control_plane;
    let health_check_ctx = Arc::new(health_check_ctx);
    let machine_ctx = Arc::new(MachineContext {
        client: client.clone(),
    });
    let node_link_ctx = Arc::new(NodeLinkContext { client });

    tokio::try_join!(
        run_machine_set_controller(machine_set_ctx),
        run_health_check_controller(health_check_ctx),
        run_machine_controller(machine_ctx),
        run_node_link_controller(node_link_ctx),
        run_server(cli.metrics_addr),
    )?;

    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!("Operator failed: {:?}", e);
        process::exit(1);
    }
}
