//! docrepl Server - replication receiver node
//!
//! Opens one storage partition per shard, starts a transaction merger per
//! partition and accepts incoming replication connections until Ctrl-C.

mod config;

use clap::Parser;
use config::ServerConfig;
use docrepl_core::replication::{MergerApplier, PartitionWorkers, ReplicationListener};
use docrepl_core::storage::{LmdbStorage, MemoryStorage, Storage};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// docrepl Server CLI arguments
#[derive(Parser, Debug)]
#[command(name = "docrepl-server")]
#[command(about = "docrepl replication receiver", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Node tag reported in replies
    #[arg(long)]
    node_tag: Option<String>,

    /// Address for incoming replication
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Number of storage partitions
    #[arg(long)]
    partitions: Option<usize>,

    /// Data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Keep partitions in memory
    #[arg(long)]
    in_memory: bool,

    /// Enable debug logging
    #[arg(long, short = 'v')]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

impl Args {
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(tag) = &self.node_tag {
            config.replication.node_tag = tag.clone();
        }
        if let Some(bind) = self.bind {
            config.replication.bind_addr = bind;
        }
        if let Some(partitions) = self.partitions {
            config.replication.partition_count = partitions;
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = dir.clone();
        }
        if self.in_memory {
            config.in_memory = true;
        }
    }
}

fn init_tracing(verbose: bool, json: bool) {
    let default_filter = if verbose {
        "docrepl_server=debug,docrepl_core=debug"
    } else {
        "docrepl_server=info,docrepl_core=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose, args.log_json);

    let mut config = ServerConfig::load(args.config.as_deref())?;
    config.apply_env()?;
    args.apply(&mut config);
    config.validate()?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .thread_name("docrepl-worker")
        .enable_all()
        .build()?;

    rt.block_on(async_main(config))
}

fn open_partitions(config: &ServerConfig) -> anyhow::Result<Vec<Arc<dyn Storage>>> {
    let count = config.replication.partition_count;
    if config.in_memory {
        info!("Using {} in-memory partitions", count);
        return Ok((0..count)
            .map(|_| Arc::new(MemoryStorage::new()) as Arc<dyn Storage>)
            .collect());
    }

    std::fs::create_dir_all(&config.data_dir)?;
    let mut partitions: Vec<Arc<dyn Storage>> = Vec::with_capacity(count);
    for partition in 0..count {
        let dir = config.partition_dir(partition);
        partitions.push(Arc::new(LmdbStorage::open(&dir, config.map_size)?));
    }
    info!(
        "Opened {} LMDB partitions under {}",
        count,
        config.data_dir.display()
    );
    Ok(partitions)
}

async fn async_main(config: ServerConfig) -> anyhow::Result<()> {
    let partitions = open_partitions(&config)?;
    let replication = Arc::new(config.replication);

    let applier = Arc::new(MergerApplier::start(partitions, &replication.merger)?);
    let workers = Arc::new(PartitionWorkers::spawn(
        applier.clone(),
        replication.partition_count,
        replication.partition_queue_capacity,
    ));

    let cancel = CancellationToken::new();
    let listener = ReplicationListener::new(replication.clone(), workers.clone(), cancel.clone());
    let bound = listener.bind().await?;

    let signal = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Shutdown signal received"),
                Err(e) => {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                    return;
                }
            }
            cancel.cancel();
        })
    };

    listener.serve(bound).await?;
    signal.abort();

    let stats = listener.stats();
    info!(
        "Replication listener stopped: {} connections accepted, {} failed, {} refused",
        stats.connections_accepted, stats.connections_failed, stats.connections_rejected
    );

    drop(listener);
    match Arc::try_unwrap(workers) {
        Ok(workers) => workers.shutdown().await,
        Err(_) => warn!("Partition workers still shared at shutdown"),
    }

    for (partition, stats) in applier.stats().iter().enumerate() {
        info!(
            "Partition {}: {} commands in {} transactions, {} failed",
            partition, stats.commands_executed, stats.transactions_committed, stats.commands_failed
        );
    }
    Ok(())
}
