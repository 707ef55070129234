//! Node configuration: JSON file with defaults for every field.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cluster::{PartitionScheme, RendezvousPartitionGroup, DEFAULT_BUCKETS};
use crate::net::{CrdtServerConfig, RemoteStorageConfig};
use crate::storage::wal::WalRollPolicy;
use crate::storage::{FsyncPolicy, LocalStorageConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config parse failed at {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("config invalid: {reason}")]
    Invalid { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageSection,
    pub wal: WalSection,
    pub consolidate: ConsolidateSection,
    pub cleanup: CleanupSection,
    pub cluster: ClusterSection,
    pub net: NetSection,
    pub fsync: FsyncSection,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageSection::default(),
            wal: WalSection::default(),
            consolidate: ConsolidateSection::default(),
            cleanup: CleanupSection::default(),
            cluster: ClusterSection::default(),
            net: NetSection::default(),
            fsync: FsyncSection::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub path: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/chunks"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalSection {
    pub path: PathBuf,
    pub roll_bytes: u64,
    pub roll_entries: u64,
    pub roll_age_ms: u64,
}

impl Default for WalSection {
    fn default() -> Self {
        let roll = WalRollPolicy::default();
        Self {
            path: PathBuf::from("data/wal"),
            roll_bytes: roll.max_bytes,
            roll_entries: roll.max_entries,
            roll_age_ms: roll.max_age_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidateSection {
    pub interval_ms: u64,
    pub initial_delay_ms: u64,
    pub hot_chunks: usize,
}

impl Default for ConsolidateSection {
    fn default() -> Self {
        Self {
            interval_ms: 60_000,
            initial_delay_ms: 10_000,
            hot_chunks: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupSection {
    /// 0 disables the periodic pass; cleanup stays operator-triggered.
    pub interval_ms: u64,
}

impl Default for CleanupSection {
    fn default() -> Self {
        Self { interval_ms: 0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupSection {
    pub partitions: Vec<String>,
    pub replication: usize,
    pub min_active: usize,
    pub active: bool,
}

impl Default for GroupSection {
    fn default() -> Self {
        Self {
            partitions: Vec::new(),
            replication: 1,
            min_active: 1,
            active: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    pub buckets: usize,
    pub groups: Vec<GroupSection>,
    pub addresses: BTreeMap<String, String>,
    /// Start serving even if the initial cluster ping is incomplete.
    pub force_start: bool,
    /// When set, schemes come from this file instead of the sections
    /// above.
    pub scheme_file: Option<PathBuf>,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            buckets: DEFAULT_BUCKETS,
            groups: Vec::new(),
            addresses: BTreeMap::new(),
            force_start: false,
            scheme_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetSection {
    pub listen_addr: String,
    pub connect_timeout_ms: u64,
    pub reconnect_interval_ms: u64,
    pub packet_size: usize,
}

impl Default for NetSection {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7400".to_string(),
            connect_timeout_ms: 10_000,
            reconnect_interval_ms: 1_000,
            packet_size: 1 << 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FsyncSection {
    pub uploads: bool,
    pub directories: bool,
    pub appends: bool,
}

impl Default for FsyncSection {
    fn default() -> Self {
        let policy = FsyncPolicy::default();
        Self {
            uploads: policy.uploads,
            directories: policy.directories,
            appends: policy.appends,
        }
    }
}

pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let bytes = fs::read(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config: Config = serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    config.validate()?;
    Ok(config)
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.cluster.buckets.is_power_of_two() {
            return Err(ConfigError::Invalid {
                reason: format!(
                    "cluster.buckets must be a power of two, got {}",
                    self.cluster.buckets
                ),
            });
        }
        for group in &self.cluster.groups {
            if group.partitions.is_empty() {
                return Err(ConfigError::Invalid {
                    reason: "cluster group without partitions".to_string(),
                });
            }
            if group.replication == 0 {
                return Err(ConfigError::Invalid {
                    reason: "cluster group with zero replication".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn fsync_policy(&self) -> FsyncPolicy {
        FsyncPolicy {
            uploads: self.fsync.uploads,
            directories: self.fsync.directories,
            appends: self.fsync.appends,
        }
    }

    pub fn local_storage(&self) -> LocalStorageConfig {
        let fsync = self.fsync_policy();
        let mut local = LocalStorageConfig::new(&self.storage.path, &self.wal.path);
        local.wal.roll = WalRollPolicy {
            max_bytes: self.wal.roll_bytes,
            max_entries: self.wal.roll_entries,
            max_age_ms: self.wal.roll_age_ms,
        };
        local.wal.fsync = fsync;
        local.wal.max_entry_bytes = self.net.packet_size;
        local.chunk.fsync = fsync;
        local.chunk.max_entry_bytes = self.net.packet_size;
        local.chunk.hot_chunks = self.consolidate.hot_chunks;
        local.consolidate_interval = Duration::from_millis(self.consolidate.interval_ms);
        local.consolidate_initial_delay =
            Duration::from_millis(self.consolidate.initial_delay_ms);
        local.cleanup_interval = (self.cleanup.interval_ms > 0)
            .then(|| Duration::from_millis(self.cleanup.interval_ms));
        local
    }

    pub fn server(&self) -> CrdtServerConfig {
        CrdtServerConfig {
            listen_addr: self.net.listen_addr.clone(),
            max_frame_bytes: self.net.packet_size,
            ..CrdtServerConfig::default()
        }
    }

    pub fn remote_storage(&self) -> RemoteStorageConfig {
        RemoteStorageConfig {
            connect_timeout: Duration::from_millis(self.net.connect_timeout_ms),
            max_frame_bytes: self.net.packet_size,
        }
    }

    /// The statically-configured scheme (used when no scheme file is
    /// given).
    pub fn partition_scheme(&self) -> Result<PartitionScheme<String>, ConfigError> {
        if self.cluster.groups.is_empty() {
            return Err(ConfigError::Invalid {
                reason: "no cluster groups configured".to_string(),
            });
        }
        let groups = self
            .cluster
            .groups
            .iter()
            .map(|section| {
                let partitions: BTreeSet<String> =
                    section.partitions.iter().cloned().collect();
                RendezvousPartitionGroup::new(partitions, section.replication)
                    .with_min_active(section.min_active)
                    .with_active(section.active)
            })
            .collect();
        Ok(PartitionScheme::new(groups)
            .with_addresses(self.cluster.addresses.clone())
            .with_buckets(self.cluster.buckets))
    }
}
