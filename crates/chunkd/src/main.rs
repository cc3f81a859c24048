mod cli;
mod memstore;

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use chunkd_server::{Chunkserver, Config};

use crate::cli::Cli;
use crate::memstore::{MemChunkStore, MemReplicator};

/// The first interrupt starts a graceful stop: the master connection
/// unregisters and drains, the acceptor stops taking work and the pools
/// join their workers. A second interrupt gives up on the drain.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        info!("interrupt - unregistering from master and draining jobs");
        shutdown.cancel();
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("second interrupt - exiting without draining");
            std::process::exit(130);
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => {
            let mut config = Config::default();
            config.validate();
            config
        }
    };
    if let Some(master_host) = cli.master_host {
        config.master_host = master_host;
    }
    if let Some(listen_port) = cli.listen_port {
        config.listen_port = listen_port;
    }
    if let Some(data_path) = cli.data_path {
        config.data_path = data_path;
    }

    info!(
        "chunkd {} starting (master {}:{})",
        env!("CARGO_PKG_VERSION"),
        config.master_host,
        config.master_port
    );

    let store = Arc::new(MemChunkStore::new());
    let replicator = Arc::new(MemReplicator::new(store.clone()));
    let shutdown = CancellationToken::new();

    let server = Chunkserver::start(config, store, replicator, shutdown.clone()).await?;
    spawn_signal_handler(shutdown);

    server.wait().await;
    info!("chunkd stopped");
    Ok(())
}
