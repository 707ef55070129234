//! Operator surface: run a node, trigger maintenance, repartition.

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use thiserror::Error;

use crate::cluster::{
    ClusterCrdtStorage, ConnectionFactory, DiscoveryError, DiscoveryService, FileDiscovery,
    StaticDiscovery,
};
use crate::config::{self, Config, ConfigError};
use crate::core::Lww;
use crate::net::{CrdtServer, RemoteCrdtStorage};
use crate::storage::{LocalCrdtStorage, StoreError};

/// Key and state types served by the node binary: utf-8 keys, opaque
/// byte states under last-writer-wins.
type NodeKey = String;
type NodeState = Vec<u8>;

#[derive(Debug, Parser)]
#[command(name = "shale", version, about = "replicated crdt key-value storage node")]
pub struct Cli {
    /// More logging (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Configuration file (JSON).
    #[arg(short, long, default_value = "shale.json", global = true)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the storage node: WAL, chunk store, wire server, schedulers.
    Start,
    /// Run one consolidation pass and exit.
    Consolidate,
    /// Run one irrelevant-chunk cleanup pass and exit.
    Cleanup,
    /// Drain a partition's content and re-upload it through the cluster.
    Repartition {
        /// Partition id to drain.
        #[arg(long)]
        source: String,
    },
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error("startup failed: {0}")]
    Startup(StoreError),
    #[error("runtime failure: {0}")]
    Runtime(StoreError),
}

impl CliError {
    /// 1 for startup problems, 2 for unrecoverable runtime failures.
    pub fn exit_code(&self) -> u8 {
        match self {
            CliError::Config(_) | CliError::Discovery(_) | CliError::Startup(_) => 1,
            CliError::Runtime(_) => 2,
        }
    }
}

pub fn parse_from<I, T>(args: I) -> Cli
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    Cli::parse_from(args)
}

fn load_config(cli: &Cli) -> Result<Config, CliError> {
    if !cli.config.exists() {
        tracing::warn!(
            "config file {:?} not found, running with defaults",
            cli.config
        );
        return Ok(Config::default());
    }
    Ok(config::load(&cli.config)?)
}

fn open_storage(config: &Config) -> Result<LocalCrdtStorage<NodeKey, NodeState>, CliError> {
    LocalCrdtStorage::open(Arc::new(Lww), config.local_storage()).map_err(CliError::Startup)
}

pub fn run(cli: Cli) -> Result<(), CliError> {
    let config = load_config(&cli)?;

    match cli.command {
        Command::Start => {
            let storage = open_storage(&config)?;
            let background = storage.start_background();
            let server = CrdtServer::new(Arc::new(storage.clone()), config.server())
                .start()
                .map_err(CliError::Startup)?;
            tracing::info!(addr = %server.local_addr(), "node started");
            server.wait();
            background.shutdown();
            Ok(())
        }
        Command::Consolidate => {
            let storage = open_storage(&config)?;
            let merged = storage.consolidate().map_err(CliError::Runtime)?;
            tracing::info!(merged, "consolidation pass finished");
            Ok(())
        }
        Command::Cleanup => {
            let storage = open_storage(&config)?;
            let removed = storage.cleanup_irrelevant().map_err(CliError::Runtime)?;
            tracing::info!(removed, "cleanup pass finished");
            Ok(())
        }
        Command::Repartition { source } => {
            let cluster = build_cluster(&config);
            let discovery = build_discovery(&config)?;
            let handle = cluster
                .start(discovery.as_ref(), config.cluster.force_start)
                .map_err(CliError::Runtime)?;
            let moved = cluster.repartition(&source).map_err(CliError::Runtime)?;
            tracing::info!(source = %source, moved, "repartition finished");
            handle.shutdown();
            Ok(())
        }
    }
}

fn build_cluster(config: &Config) -> ClusterCrdtStorage<NodeKey, NodeState, String> {
    let remote = config.remote_storage();
    let factory: ConnectionFactory<NodeKey, NodeState, String> =
        Arc::new(move |partition, addr| {
            let addr = addr.ok_or_else(|| StoreError::NotFound {
                what: format!("address for partition {partition}"),
            })?;
            Ok(Arc::new(RemoteCrdtStorage::<NodeKey, NodeState>::new(
                addr,
                remote.clone(),
            )))
        });
    ClusterCrdtStorage::new(Arc::new(Lww), factory)
}

fn build_discovery(
    config: &Config,
) -> Result<Box<dyn DiscoveryService<String>>, CliError> {
    match &config.cluster.scheme_file {
        Some(path) => Ok(Box::new(FileDiscovery::new(
            path,
            Duration::from_millis(config.net.reconnect_interval_ms),
        ))),
        None => Ok(Box::new(StaticDiscovery::new(config.partition_scheme()?))),
    }
}
