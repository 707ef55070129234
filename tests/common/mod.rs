//! Shared fixtures for the integration suites.
#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use shale::storage::{
    CrdtStore, DataStream, LocalCrdtStorage, LocalStorageConfig, RemoveSink, StoreError,
    TakeSession, UploadSink,
};
use shale::{CrdtData, CrdtTombstone, FsyncPolicy, Lww};

pub fn fsync_off() -> FsyncPolicy {
    FsyncPolicy {
        uploads: false,
        directories: false,
        appends: false,
    }
}

pub fn storage_config(root: &Path) -> LocalStorageConfig {
    let mut config = LocalStorageConfig::new(root.join("chunks"), root.join("wal"));
    config.wal.fsync = fsync_off();
    config.chunk.fsync = fsync_off();
    config
}

pub fn open_store(root: &Path) -> LocalCrdtStorage<u64, String> {
    LocalCrdtStorage::open(Arc::new(Lww), storage_config(root)).expect("open local storage")
}

pub fn upload<S: CrdtStore<u64, String> + ?Sized>(store: &S, batch: &[(u64, u64, &str)]) {
    let mut sink = store.upload().expect("open upload");
    for (key, ts, state) in batch {
        sink.push(CrdtData::new(*key, *ts, state.to_string()))
            .expect("push");
    }
    sink.close().expect("close upload");
}

pub fn remove<S: CrdtStore<u64, String> + ?Sized>(store: &S, batch: &[(u64, u64)]) {
    let mut sink = store.remove().expect("open remove");
    for (key, ts) in batch {
        sink.push(CrdtTombstone::new(*key, *ts)).expect("push");
    }
    sink.close().expect("close remove");
}

pub fn download<S: CrdtStore<u64, String> + ?Sized>(
    store: &S,
    since: u64,
) -> Vec<(u64, u64, String)> {
    store
        .download(since)
        .expect("open download")
        .map(|item| item.expect("download item"))
        .map(|d| (d.key, d.timestamp, d.state))
        .collect()
}

/// A storage endpoint with a kill switch, standing in for a crashed node.
pub struct FlakyStore {
    inner: Arc<dyn CrdtStore<u64, String>>,
    dead: Arc<AtomicBool>,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn CrdtStore<u64, String>>) -> (Self, Arc<AtomicBool>) {
        let dead = Arc::new(AtomicBool::new(false));
        (
            Self {
                inner,
                dead: Arc::clone(&dead),
            },
            dead,
        )
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.dead.load(Ordering::SeqCst) {
            return Err(StoreError::Io {
                path: None,
                source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "node down"),
            });
        }
        Ok(())
    }
}

impl CrdtStore<u64, String> for FlakyStore {
    fn upload(&self) -> Result<Box<dyn UploadSink<u64, String>>, StoreError> {
        self.check()?;
        self.inner.upload()
    }

    fn download(&self, since: u64) -> Result<DataStream<u64, String>, StoreError> {
        self.check()?;
        self.inner.download(since)
    }

    fn take(&self) -> Result<Box<dyn TakeSession<u64, String>>, StoreError> {
        self.check()?;
        self.inner.take()
    }

    fn remove(&self) -> Result<Box<dyn RemoveSink<u64>>, StoreError> {
        self.check()?;
        self.inner.remove()
    }

    fn ping(&self) -> Result<(), StoreError> {
        self.check()?;
        self.inner.ping()
    }
}
