//! Sharded, replicated storage over a discovered set of nodes.

pub mod discovery;
pub mod partition;
pub mod storage;

pub use discovery::{load_scheme, DiscoveryError, DiscoveryService, FileDiscovery, StaticDiscovery};
pub use partition::{
    PartitionId, PartitionScheme, RendezvousPartitionGroup, RendezvousSharder, DEFAULT_BUCKETS,
};
pub use storage::{ClusterCrdtStorage, ClusterHandle, ConnectionFactory};
