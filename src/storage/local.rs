//! Local storage node: WAL for ingest, chunk store for reads, background
//! maintenance threads.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{after, tick, Receiver, Sender};

use crate::core::{CrdtData, CrdtEntry, CrdtFunction, CrdtKey, CrdtState, CrdtTombstone};
use crate::metrics::{MetricsSnapshot, StoreMetrics};

use super::chunk::{ChunkStore, ChunkStoreOptions};
use super::wal::{FileWal, WalDrainer, WalOptions};
use super::{CrdtStore, DataStream, RemoveSink, StoreError, TakeSession, UploadSink};

#[derive(Clone, Debug)]
pub struct LocalStorageConfig {
    pub storage_path: PathBuf,
    pub wal_path: PathBuf,
    pub wal: WalOptions,
    pub chunk: ChunkStoreOptions,
    /// Background drain retry cadence; acked writes drain synchronously.
    pub drain_interval: Duration,
    pub consolidate_interval: Duration,
    pub consolidate_initial_delay: Duration,
    /// `None` disables periodic cleanup; it can still be triggered
    /// explicitly.
    pub cleanup_interval: Option<Duration>,
}

impl LocalStorageConfig {
    pub fn new(storage_path: impl Into<PathBuf>, wal_path: impl Into<PathBuf>) -> Self {
        Self {
            storage_path: storage_path.into(),
            wal_path: wal_path.into(),
            wal: WalOptions::default(),
            chunk: ChunkStoreOptions::default(),
            drain_interval: Duration::from_secs(1),
            consolidate_interval: Duration::from_secs(60),
            consolidate_initial_delay: Duration::from_secs(10),
            cleanup_interval: None,
        }
    }
}

/// A single CRDT storage endpoint over local disk. `upload`/`remove`
/// stream into the WAL; `download`/`take` stream from the chunk store.
pub struct LocalCrdtStorage<K, S> {
    wal: Arc<FileWal<K, S>>,
    chunks: ChunkStore<K, S>,
    drainer: Arc<WalDrainer<K, S>>,
    config: LocalStorageConfig,
    metrics: Arc<StoreMetrics>,
}

impl<K, S> Clone for LocalCrdtStorage<K, S> {
    fn clone(&self) -> Self {
        Self {
            wal: Arc::clone(&self.wal),
            chunks: self.chunks.clone(),
            drainer: Arc::clone(&self.drainer),
            config: self.config.clone(),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

impl<K: CrdtKey, S: CrdtState> LocalCrdtStorage<K, S> {
    /// Open both subsystems and replay whatever a previous process left in
    /// the WAL before serving.
    pub fn open(
        function: Arc<dyn CrdtFunction<S>>,
        config: LocalStorageConfig,
    ) -> Result<Self, StoreError> {
        let metrics = Arc::new(StoreMetrics::default());
        let chunks = ChunkStore::open(
            &config.storage_path,
            function,
            config.chunk,
            Arc::clone(&metrics),
        )?;
        let wal = Arc::new(FileWal::open(
            &config.wal_path,
            config.wal,
            Arc::clone(&metrics),
        )?);
        let drainer = Arc::new(WalDrainer::new(
            &config.wal_path,
            chunks.clone(),
            config.wal.max_entry_bytes,
            Arc::clone(&metrics),
        ));

        let recovered = drainer.drain_once()?;
        if recovered > 0 {
            tracing::info!(segments = recovered, "recovered wal segments on startup");
        }

        Ok(Self {
            wal,
            chunks,
            drainer,
            config,
            metrics,
        })
    }

    pub fn chunks(&self) -> &ChunkStore<K, S> {
        &self.chunks
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn consolidate(&self) -> Result<bool, StoreError> {
        self.chunks.consolidate()
    }

    pub fn cleanup_irrelevant(&self) -> Result<usize, StoreError> {
        self.chunks.cleanup_irrelevant()
    }

    /// Rotate the current segment and drain everything finalized, making
    /// every acked write visible to `download`.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.wal.rotate()?;
        self.drainer.drain_once()?;
        Ok(())
    }

    /// Spawn the drain retry loop, the consolidation scheduler and the
    /// optional cleanup scheduler.
    pub fn start_background(&self) -> LocalStorageHandle {
        let (shutdown_tx, shutdown_rx) = crossbeam::channel::bounded::<()>(0);
        let mut joins = Vec::new();

        {
            let drainer = Arc::clone(&self.drainer);
            let ticker = tick(self.config.drain_interval);
            let shutdown = shutdown_rx.clone();
            joins.push(thread::spawn(move || run_drain_loop(drainer, ticker, shutdown)));
        }

        {
            let chunks = self.chunks.clone();
            let initial = after(self.config.consolidate_initial_delay);
            let interval = self.config.consolidate_interval;
            let shutdown = shutdown_rx.clone();
            joins.push(thread::spawn(move || {
                run_maintenance_loop("consolidate", initial, interval, shutdown, move || {
                    chunks.consolidate().map(|did| did as usize)
                })
            }));
        }

        if let Some(cleanup_interval) = self.config.cleanup_interval {
            let chunks = self.chunks.clone();
            let initial = after(cleanup_interval);
            let shutdown = shutdown_rx.clone();
            joins.push(thread::spawn(move || {
                run_maintenance_loop("cleanup", initial, cleanup_interval, shutdown, move || {
                    chunks.cleanup_irrelevant()
                })
            }));
        }

        LocalStorageHandle {
            shutdown: Some(shutdown_tx),
            joins,
        }
    }
}

fn run_drain_loop<K: CrdtKey, S: CrdtState>(
    drainer: Arc<WalDrainer<K, S>>,
    ticker: Receiver<std::time::Instant>,
    shutdown: Receiver<()>,
) {
    let mut backoff = Duration::from_millis(0);
    loop {
        crossbeam::select! {
            recv(shutdown) -> _ => break,
            recv(ticker) -> _ => {
                if !backoff.is_zero() {
                    // Retry after a failure without hammering the disk.
                    crossbeam::select! {
                        recv(shutdown) -> _ => break,
                        recv(after(backoff)) -> _ => {}
                    }
                }
                match drainer.drain_once() {
                    Ok(_) => backoff = Duration::from_millis(0),
                    Err(err) => {
                        backoff = (backoff * 2 + Duration::from_millis(100))
                            .min(Duration::from_secs(30));
                        tracing::warn!("wal drain failed, retrying: {}", err);
                    }
                }
            }
        }
    }
}

fn run_maintenance_loop(
    what: &'static str,
    initial: Receiver<std::time::Instant>,
    interval: Duration,
    shutdown: Receiver<()>,
    mut run: impl FnMut() -> Result<usize, StoreError>,
) {
    crossbeam::select! {
        recv(shutdown) -> _ => return,
        recv(initial) -> _ => {}
    }
    let ticker = tick(interval);
    loop {
        match run() {
            Ok(0) => {}
            Ok(n) => tracing::debug!(task = what, affected = n, "maintenance pass complete"),
            Err(StoreError::ChunksAlreadyLocked) => {
                tracing::debug!(task = what, "chunks locked, backing off")
            }
            Err(err) => tracing::warn!(task = what, "maintenance pass failed: {}", err),
        }
        crossbeam::select! {
            recv(shutdown) -> _ => break,
            recv(ticker) -> _ => {}
        }
    }
}

pub struct LocalStorageHandle {
    shutdown: Option<Sender<()>>,
    joins: Vec<JoinHandle<()>>,
}

impl LocalStorageHandle {
    pub fn shutdown(mut self) {
        self.shutdown.take();
        for join in self.joins.drain(..) {
            let _ = join.join();
        }
    }
}

impl Drop for LocalStorageHandle {
    fn drop(&mut self) {
        self.shutdown.take();
        for join in self.joins.drain(..) {
            let _ = join.join();
        }
    }
}

impl<K: CrdtKey, S: CrdtState> CrdtStore<K, S> for LocalCrdtStorage<K, S> {
    fn upload(&self) -> Result<Box<dyn UploadSink<K, S>>, StoreError> {
        Ok(Box::new(LocalUploadSink {
            storage: self.clone(),
        }))
    }

    fn download(&self, since: u64) -> Result<DataStream<K, S>, StoreError> {
        let stream = self.chunks.download(since)?;
        let metrics = Arc::clone(&self.metrics);
        Ok(Box::new(stream.inspect(move |item| {
            if item.is_ok() {
                StoreMetrics::record(&metrics.downloaded_items);
            }
        })))
    }

    fn take(&self) -> Result<Box<dyn TakeSession<K, S>>, StoreError> {
        self.flush()?;
        let inner = self.chunks.take()?;
        Ok(Box::new(LocalTakeSession {
            inner,
            metrics: Arc::clone(&self.metrics),
        }))
    }

    fn remove(&self) -> Result<Box<dyn RemoveSink<K>>, StoreError> {
        Ok(Box::new(LocalRemoveSink {
            storage: self.clone(),
        }))
    }

    fn ping(&self) -> Result<(), StoreError> {
        for dir in [&self.config.storage_path, &self.config.wal_path] {
            let meta = fs::metadata(dir).map_err(|source| StoreError::io(dir, source))?;
            if !meta.is_dir() {
                return Err(StoreError::NotFound {
                    what: format!("storage directory {}", dir.display()),
                });
            }
        }
        Ok(())
    }
}

struct LocalUploadSink<K: CrdtKey, S: CrdtState> {
    storage: LocalCrdtStorage<K, S>,
}

impl<K: CrdtKey, S: CrdtState> UploadSink<K, S> for LocalUploadSink<K, S> {
    fn push(&mut self, data: CrdtData<K, S>) -> Result<(), StoreError> {
        self.storage.wal.append(&CrdtEntry::Data(data))?;
        StoreMetrics::record(&self.storage.metrics.uploaded_items);
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<(), StoreError> {
        self.storage.flush()
    }
}

struct LocalRemoveSink<K: CrdtKey, S: CrdtState> {
    storage: LocalCrdtStorage<K, S>,
}

impl<K: CrdtKey, S: CrdtState> RemoveSink<K> for LocalRemoveSink<K, S> {
    fn push(&mut self, tombstone: CrdtTombstone<K>) -> Result<(), StoreError> {
        self.storage.wal.append(&CrdtEntry::Tombstone(tombstone))?;
        StoreMetrics::record(&self.storage.metrics.removed_items);
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<(), StoreError> {
        self.storage.flush()
    }
}

struct LocalTakeSession<K, S> {
    inner: Box<dyn TakeSession<K, S>>,
    metrics: Arc<StoreMetrics>,
}

impl<K: CrdtKey, S: CrdtState> TakeSession<K, S> for LocalTakeSession<K, S> {
    fn next(&mut self) -> Option<Result<CrdtData<K, S>, StoreError>> {
        let item = self.inner.next();
        if matches!(item, Some(Ok(_))) {
            StoreMetrics::record(&self.metrics.taken_items);
        }
        item
    }

    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.inner.commit()
    }
}
