// Main entry point for the backup archiver server

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use server_core::common::types::ServerMode;
use server_core::kernel::scripts::{ShellScriptRunner, SystemMountManager};
use server_core::kernel::{
    Capabilities, MemoryContinuousLog, MemoryIndex, MemoryStorage, ServerKernel,
    SimulatedArchiver,
};
use server_core::server::{run_batch, run_server};
use server_core::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "server", about = "Backup archiver server")]
struct Args {
    /// Run in batch mode: read commands from stdin, write results to stdout
    #[arg(long)]
    batch: bool,

    /// Override the server mode (MASTER or SLAVE)
    #[arg(long)]
    mode: Option<ServerMode>,

    /// Override the listen port
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,server_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    // Load configuration
    let mut config = Config::from_env().context("Failed to load configuration")?;
    if let Some(mode) = args.mode {
        config.mode = mode;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    tracing::info!(mode = %config.mode, "Configuration loaded");

    // Wire the capability seams. The in-memory index is the default
    // backend; external index/storage/archiver implementations plug in
    // here.
    let storage = MemoryStorage::new().into_shared();
    let capabilities = Capabilities {
        index: MemoryIndex::new().into_shared(),
        storage: storage.clone(),
        archiver: Arc::new(SimulatedArchiver::with_storage(storage)),
        continuous: Arc::new(MemoryContinuousLog::new()),
        scripts: Arc::new(ShellScriptRunner),
        mounts: Arc::new(SystemMountManager),
    };

    let kernel =
        ServerKernel::build(config, capabilities).context("Failed to build server kernel")?;

    if args.batch {
        run_batch(kernel).await
    } else {
        run_server(kernel).await
    }
}
