//! Storage interface shared by the local node, the wire client and the
//! cluster composite.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::core::{CodecError, CrdtData, CrdtTombstone};

pub mod chunk;
pub mod local;
pub mod merge;
pub mod record;
pub mod wal;

pub use chunk::ChunkStore;
pub use local::{LocalCrdtStorage, LocalStorageConfig, LocalStorageHandle};

/// Finite stream of merged data records, ascending by key.
pub type DataStream<K, S> = Box<dyn Iterator<Item = Result<CrdtData<K, S>, StoreError>> + Send>;

/// Durability knobs. Defaults are the safe ones; tests turn them off for
/// speed.
#[derive(Clone, Copy, Debug)]
pub struct FsyncPolicy {
    /// fsync chunk files before the commit rename.
    pub uploads: bool,
    /// fsync directories after renames.
    pub directories: bool,
    /// fsync the WAL segment after every append.
    pub appends: bool,
}

impl Default for FsyncPolicy {
    fn default() -> Self {
        Self {
            uploads: true,
            directories: true,
            appends: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error at {path:?}: {source}")]
    Io {
        path: Option<PathBuf>,
        #[source]
        source: io::Error,
    },
    #[error("protocol violation: {reason}")]
    Protocol { reason: String },
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("incomplete cluster: {reason}")]
    IncompleteCluster { reason: String },
    #[error("chunks already locked by another consolidation")]
    ChunksAlreadyLocked,
    #[error("another take is already outstanding")]
    TakeInProgress,
    #[error("size mismatch: expected {expected} bytes, got {got}")]
    SizeMismatch { expected: u64, got: u64 },
    #[error("not found: {what}")]
    NotFound { what: String },
    #[error("handshake rejected: {message}")]
    Handshake { message: String },
    #[error("remote error: {message}")]
    Remote { message: String },
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StoreError::Io {
            path: Some(path.into()),
            source,
        }
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        StoreError::Protocol {
            reason: reason.into(),
        }
    }

    /// Whether a retry without operator intervention may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Io { .. }
                | StoreError::IncompleteCluster { .. }
                | StoreError::ChunksAlreadyLocked
                | StoreError::TakeInProgress
                | StoreError::Remote { .. }
        )
    }
}

/// Receiving end of an `upload` stream. Keys must arrive strictly
/// ascending; `close` makes everything pushed so far durable and visible.
pub trait UploadSink<K, S>: Send {
    fn push(&mut self, data: CrdtData<K, S>) -> Result<(), StoreError>;
    fn close(self: Box<Self>) -> Result<(), StoreError>;
}

/// Receiving end of a `remove` stream, same ordering contract.
pub trait RemoveSink<K>: Send {
    fn push(&mut self, tombstone: CrdtTombstone<K>) -> Result<(), StoreError>;
    fn close(self: Box<Self>) -> Result<(), StoreError>;
}

/// Destructive read. Dropping the session without `commit` leaves the data
/// in place; `commit` deletes exactly what the stream covered.
pub trait TakeSession<K, S>: Send {
    fn next(&mut self) -> Option<Result<CrdtData<K, S>, StoreError>>;
    fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// The five storage operations, implemented by the local node, the remote
/// client and the cluster fan-out alike.
pub trait CrdtStore<K, S>: Send + Sync {
    fn upload(&self) -> Result<Box<dyn UploadSink<K, S>>, StoreError>;
    fn download(&self, since: u64) -> Result<DataStream<K, S>, StoreError>;
    fn take(&self) -> Result<Box<dyn TakeSession<K, S>>, StoreError>;
    fn remove(&self) -> Result<Box<dyn RemoveSink<K>>, StoreError>;
    fn ping(&self) -> Result<(), StoreError>;
}
