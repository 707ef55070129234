#![forbid(unsafe_code)]

//! Replicated conflict-free key-value storage: a write-ahead log in front
//! of append-only chunk files, served over a framed wire protocol and
//! sharded across a discovered cluster with rendezvous hashing.

pub mod cli;
pub mod cluster;
pub mod config;
pub mod core;
pub mod metrics;
pub mod net;
pub mod storage;
pub mod telemetry;

pub use crate::core::{
    decode_entry, encode_entry, merge_entries, CodecError, CrdtData, CrdtEntry, CrdtFunction,
    CrdtKey, CrdtState, CrdtTombstone, Lww,
};
pub use crate::metrics::{MetricsSnapshot, StoreMetrics};
pub use crate::storage::{
    ChunkStore, CrdtStore, DataStream, FsyncPolicy, LocalCrdtStorage, LocalStorageConfig,
    RemoveSink, StoreError, TakeSession, UploadSink,
};

pub type Result<T> = std::result::Result<T, StoreError>;
