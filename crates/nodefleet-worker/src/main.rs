//! `nodefleet-worker`: serves one fleet node.
//!
//! Waits for orchestrators to connect and runs the tasks they send until
//! interrupted.

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use nodefleet_worker::WorkerServer;

#[derive(Parser, Debug)]
#[command(name = "nodefleet-worker", version, about = "Execute NodeFleet tasks")]
struct Cli {
    /// Listen address
    #[arg(short, long, env = "NODEFLEET_WORKER_BIND", default_value = "0.0.0.0:7979")]
    bind: SocketAddr,

    /// Name announced to orchestrators (default: worker-<random>)
    #[arg(short, long)]
    name: Option<String>,

    /// Log at DEBUG unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level.to_string())),
        )
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("cannot install logger: {e}"))?;

    let name = cli.name.unwrap_or_else(|| {
        let id = uuid::Uuid::new_v4().simple().to_string();
        format!("worker-{}", &id[..8])
    });

    let server = WorkerServer::bind(cli.bind, name.clone())
        .await
        .with_context(|| format!("cannot listen on {}", cli.bind))?;
    info!(%name, address = %server.local_addr()?, "Worker ready");

    server
        .run_until(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    info!(%name, "Worker shut down");
    Ok(())
}
