//! Tierio Master
//!
//! This binary provides the block master service for a tiered storage
//! cluster: it mints block container ids, tracks block locations and worker
//! lifecycles, and journals metadata transitions for recovery.

mod service;

use anyhow::{Context, Result};
use clap::Parser;
use service::{spawn_lost_worker_detector, ClientService, WorkerService};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tierio_block_master::{BlockMaster, Journal, JournalEntry, JournalLog, MemoryJournal};
use tierio_common::Config;
use tierio_proto::master::block_master_client_service_server::BlockMasterClientServiceServer;
use tierio_proto::master::block_master_worker_service_server::BlockMasterWorkerServiceServer;
use tonic::transport::Server;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "tierio-master")]
#[command(about = "Tierio Block Master")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/tierio/master.toml")]
    config: String,

    /// Listen address for gRPC (overrides the config file)
    #[arg(short, long)]
    listen: Option<String>,

    /// Journal directory (overrides the config file)
    #[arg(long)]
    journal_dir: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn load_config(path: &str) -> Config {
    match std::fs::read_to_string(path) {
        Ok(config_str) => toml::from_str(&config_str).unwrap_or_else(|e| {
            warn!("failed to parse config file {}: {}; using defaults", path, e);
            Config::default()
        }),
        Err(_) => {
            warn!("config file {} not found; using defaults", path);
            Config::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Tierio Master");

    let mut config = load_config(&args.config);
    if let Some(journal_dir) = args.journal_dir {
        config.journal.dir = Some(journal_dir);
    }

    // Open the journal and collect any entries to recover.
    let (journal, recovered): (Arc<dyn Journal>, Vec<JournalEntry>) = match &config.journal.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating journal directory {}", dir.display()))?;
            let log = JournalLog::open(dir.join("master.log")).context("opening journal log")?;
            let entries = log.replay().context("replaying journal log")?;
            (Arc::new(log), entries)
        }
        None => {
            warn!("no journal directory configured; metadata will not survive a restart");
            (Arc::new(MemoryJournal::new()), Vec::new())
        }
    };

    let master = Arc::new(BlockMaster::new(&config.master, journal));

    // Recover under safe mode so no lookup observes a half-replayed state.
    master.safe_mode().enter();
    for entry in &recovered {
        master.process_journal_entry(entry);
    }
    if !recovered.is_empty() {
        info!("replayed {} journal entries", recovered.len());
    }
    master.safe_mode().leave();

    let detector = spawn_lost_worker_detector(
        Arc::clone(&master),
        Duration::from_millis(config.master.heartbeat_interval_ms),
    );

    let addr = match &args.listen {
        Some(listen) => listen
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid listen address {}: {}", listen, e))?,
        None => config.network.grpc_listen,
    };

    info!("Starting gRPC server on {}", addr);

    Server::builder()
        .add_service(BlockMasterClientServiceServer::new(ClientService::new(
            Arc::clone(&master),
        )))
        .add_service(BlockMasterWorkerServiceServer::new(WorkerService::new(
            Arc::clone(&master),
        )))
        .serve_with_shutdown(addr, async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down...");
        })
        .await?;

    detector.abort();
    info!("Tierio Master shut down gracefully");

    Ok(())
}
