//! Append-only, content-addressed chunk storage with background
//! consolidation and irrelevant-chunk cleanup.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::core::{CrdtData, CrdtEntry, CrdtFunction, CrdtKey, CrdtState, CrdtTombstone};
use crate::metrics::StoreMetrics;

use super::merge::{extract_after, EntryStream, KWayMerge};
use super::{DataStream, FsyncPolicy, RemoveSink, StoreError, TakeSession, UploadSink};

pub mod consolidate;
pub mod file;
pub mod set;

use consolidate::ConsolidationStrategy;
pub use consolidate::SegmentKind;
pub use file::ChunkMeta;
use file::{open_entries, parse_chunk_file_name, read_meta, ChunkEntries, ChunkWriter};
pub use set::{ChunkHandle, ChunkLock, ChunkLocker};

#[derive(Clone, Copy, Debug)]
pub struct ChunkStoreOptions {
    pub fsync: FsyncPolicy,
    /// Upper bound for one serialized entry; larger frames are corruption.
    pub max_entry_bytes: usize,
    /// Newest chunks considered the hot consolidation segment.
    pub hot_chunks: usize,
}

impl Default for ChunkStoreOptions {
    fn default() -> Self {
        Self {
            fsync: FsyncPolicy::default(),
            max_entry_bytes: 1 << 24,
            hot_chunks: 8,
        }
    }
}

struct Inner<K, S> {
    dir: PathBuf,
    function: Arc<dyn CrdtFunction<S>>,
    options: ChunkStoreOptions,
    next_id: AtomicU64,
    chunks: Mutex<BTreeMap<u64, Arc<ChunkHandle<K>>>>,
    locker: Arc<ChunkLocker>,
    take_outstanding: AtomicBool,
    /// Consolidation and irrelevant-chunk cleanup never overlap.
    maintenance: AtomicBool,
    strategy: ConsolidationStrategy,
    metrics: Arc<StoreMetrics>,
}

pub struct ChunkStore<K, S> {
    inner: Arc<Inner<K, S>>,
}

impl<K, S> Clone for ChunkStore<K, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: CrdtKey, S: CrdtState> ChunkStore<K, S> {
    pub fn open(
        dir: impl Into<PathBuf>,
        function: Arc<dyn CrdtFunction<S>>,
        options: ChunkStoreOptions,
        metrics: Arc<StoreMetrics>,
    ) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StoreError::io(&dir, source))?;

        let mut chunks = BTreeMap::new();
        let mut max_id = 0u64;
        let listing = fs::read_dir(&dir).map_err(|source| StoreError::io(&dir, source))?;
        for dirent in listing {
            let dirent = dirent.map_err(|source| StoreError::io(&dir, source))?;
            let path = dirent.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.ends_with(".tmp") {
                // Orphan from a crashed upload or an uncommitted
                // consolidation.
                tracing::info!("removing orphan chunk file {:?}", path);
                let _ = fs::remove_file(&path);
                continue;
            }
            let Some(id) = parse_chunk_file_name(name) else {
                tracing::warn!("ignoring unrecognized file in chunk dir: {:?}", path);
                continue;
            };
            let meta = read_meta::<K>(&path, id, options.max_entry_bytes)?;
            max_id = max_id.max(id);
            chunks.insert(id, Arc::new(ChunkHandle::new(meta, path)));
        }

        Ok(Self {
            inner: Arc::new(Inner {
                dir,
                function,
                options,
                next_id: AtomicU64::new(max_id + 1),
                chunks: Mutex::new(chunks),
                locker: Arc::new(ChunkLocker::default()),
                take_outstanding: AtomicBool::new(false),
                maintenance: AtomicBool::new(false),
                strategy: ConsolidationStrategy::new(options.hot_chunks),
                metrics,
            }),
        })
    }

    pub fn chunk_count(&self) -> usize {
        self.inner.chunks.lock().expect("chunk set lock poisoned").len()
    }

    pub fn chunk_ids(&self) -> BTreeSet<u64> {
        self.inner
            .chunks
            .lock()
            .expect("chunk set lock poisoned")
            .keys()
            .copied()
            .collect()
    }

    pub fn function(&self) -> Arc<dyn CrdtFunction<S>> {
        Arc::clone(&self.inner.function)
    }

    fn snapshot(&self) -> Vec<Arc<ChunkHandle<K>>> {
        self.inner
            .chunks
            .lock()
            .expect("chunk set lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    fn merged_entries(
        &self,
        handles: &[Arc<ChunkHandle<K>>],
    ) -> Result<KWayMerge<K, S>, StoreError> {
        let mut sources: Vec<EntryStream<K, S>> = Vec::with_capacity(handles.len());
        for handle in handles {
            let entries =
                open_entries::<K, S>(&handle.path, self.inner.options.max_entry_bytes)?;
            sources.push(Box::new(HandleEntries {
                _handle: Arc::clone(handle),
                entries,
            }));
        }
        KWayMerge::new(Arc::clone(&self.inner.function), sources)
    }

    /// Open sink for a stream of data entries in strictly ascending key
    /// order; the chunk appears atomically when the sink closes. An empty
    /// upload closes cleanly with no chunk added.
    pub fn upload(&self) -> Result<Box<dyn UploadSink<K, S>>, StoreError> {
        Ok(Box::new(ChunkUploadSink {
            store: self.clone(),
            writer: None,
        }))
    }

    /// Tombstone counterpart of `upload`.
    pub fn remove(&self) -> Result<Box<dyn RemoveSink<K>>, StoreError> {
        Ok(Box::new(ChunkRemoveSink {
            store: self.clone(),
            writer: None,
        }))
    }

    /// Merged view of all chunks with entries newer than `since`,
    /// ascending by key. Restart by reissuing.
    pub fn download(&self, since: u64) -> Result<DataStream<K, S>, StoreError> {
        let merged = self.merged_entries(&self.snapshot())?;
        let function = Arc::clone(&self.inner.function);
        Ok(Box::new(merged.filter_map(move |item| match item {
            Ok(entry) => extract_after(function.as_ref(), entry, since).map(Ok),
            Err(err) => Some(Err(err)),
        })))
    }

    /// Destructive read: `download(0)` plus, on commit, deletion of every
    /// chunk that was present when the take began. At most one take may be
    /// outstanding.
    pub fn take(&self) -> Result<Box<dyn TakeSession<K, S>>, StoreError> {
        if self.inner.take_outstanding.swap(true, Ordering::SeqCst) {
            return Err(StoreError::TakeInProgress);
        }
        match self.take_inner() {
            Ok(session) => Ok(session),
            Err(err) => {
                self.inner.take_outstanding.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    fn take_inner(&self) -> Result<Box<dyn TakeSession<K, S>>, StoreError> {
        let handles = self.snapshot();
        let ids: BTreeSet<u64> = handles.iter().map(|h| h.id()).collect();
        let lock = self.inner.locker.try_lock(ids.clone())?;
        let merged = self.merged_entries(&handles)?;
        let function = Arc::clone(&self.inner.function);
        let stream = merged.filter_map(move |item| match item {
            Ok(entry) => extract_after(function.as_ref(), entry, 0).map(Ok),
            Err(err) => Some(Err(err)),
        });
        Ok(Box::new(ChunkTakeSession {
            store: self.clone(),
            stream: Box::new(stream),
            ids,
            _lock: lock,
        }))
    }

    /// Merge a selected set of chunks into one, swap atomically, and leave
    /// the inputs to be unlinked once readers release.
    pub fn consolidate(&self) -> Result<bool, StoreError> {
        if self.inner.maintenance.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        let result = self.consolidate_inner();
        self.inner.maintenance.store(false, Ordering::SeqCst);
        result
    }

    fn consolidate_inner(&self) -> Result<bool, StoreError> {
        let chunks = self.snapshot();
        let (kind, selected) = self.inner.strategy.select(&chunks);
        if selected.len() < 2 {
            return Ok(false);
        }
        let ids: BTreeSet<u64> = selected.iter().map(|h| h.id()).collect();
        let lock = self.inner.locker.try_lock(ids)?;
        tracing::debug!(
            segment = kind.as_str(),
            inputs = selected.len(),
            "consolidating chunks"
        );

        let merged = self.merged_entries(&selected)?;
        let new_id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let mut writer =
            ChunkWriter::<K, S>::create(&self.inner.dir, new_id, self.inner.options.max_entry_bytes)?;
        for entry in merged {
            writer.append(&entry?)?;
        }
        if writer.count() == 0 {
            return Ok(false);
        }

        let sealed = writer.seal(&self.inner.options.fsync)?;
        let (meta, path) = sealed.commit(&self.inner.options.fsync)?;
        {
            let mut map = self.inner.chunks.lock().expect("chunk set lock poisoned");
            map.insert(new_id, Arc::new(ChunkHandle::new(meta, path)));
            for id in lock.ids() {
                if let Some(old) = map.remove(id) {
                    old.retire();
                }
            }
        }
        StoreMetrics::record_n(&self.inner.metrics.chunks_consolidated, selected.len() as u64);
        StoreMetrics::record(&self.inner.metrics.chunks_written);
        Ok(true)
    }

    /// Remove chunks whose every entry is superseded by tombstones living
    /// in other chunks. Separate from consolidation and never concurrent
    /// with it.
    pub fn cleanup_irrelevant(&self) -> Result<usize, StoreError> {
        if self.inner.maintenance.swap(true, Ordering::SeqCst) {
            return Ok(0);
        }
        let result = self.cleanup_inner();
        self.inner.maintenance.store(false, Ordering::SeqCst);
        result
    }

    fn cleanup_inner(&self) -> Result<usize, StoreError> {
        let chunks = self.snapshot();
        if chunks.len() < 2 {
            return Ok(0);
        }

        let mut ceilings: BTreeMap<K, TombstoneCeiling> = BTreeMap::new();
        for handle in &chunks {
            let entries =
                open_entries::<K, S>(&handle.path, self.inner.options.max_entry_bytes)?;
            for entry in entries {
                if let CrdtEntry::Tombstone(tombstone) = entry? {
                    ceilings
                        .entry(tombstone.key)
                        .or_default()
                        .observe(tombstone.timestamp, handle.id());
                }
            }
        }
        if ceilings.is_empty() {
            return Ok(0);
        }

        let mut removed = 0usize;
        for handle in &chunks {
            if self.inner.locker.is_locked(handle.id()) {
                continue;
            }
            let entries =
                open_entries::<K, S>(&handle.path, self.inner.options.max_entry_bytes)?;
            let mut irrelevant = true;
            for entry in entries {
                let entry = entry?;
                let superseded = ceilings
                    .get(entry.key())
                    .and_then(|ceiling| ceiling.max_excluding(handle.id()))
                    .is_some_and(|ceiling| ceiling >= entry.timestamp());
                if !superseded {
                    irrelevant = false;
                    break;
                }
            }
            if !irrelevant {
                continue;
            }
            let Ok(_lock) = self
                .inner
                .locker
                .try_lock(BTreeSet::from([handle.id()]))
            else {
                continue;
            };
            let mut map = self.inner.chunks.lock().expect("chunk set lock poisoned");
            if let Some(old) = map.remove(&handle.id()) {
                old.retire();
                removed += 1;
                tracing::debug!(chunk = handle.id(), "removed irrelevant chunk");
            }
        }

        StoreMetrics::record_n(&self.inner.metrics.chunks_cleaned, removed as u64);
        Ok(removed)
    }

    /// Write one pre-sorted, pre-collapsed batch as a chunk. Used by the
    /// WAL drainer and tests; returns false for an empty batch.
    pub(crate) fn write_entries(&self, entries: &[CrdtEntry<K, S>]) -> Result<bool, StoreError> {
        if entries.is_empty() {
            return Ok(false);
        }
        let new_id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let mut writer =
            ChunkWriter::<K, S>::create(&self.inner.dir, new_id, self.inner.options.max_entry_bytes)?;
        for entry in entries {
            writer.append(entry)?;
        }
        let sealed = writer.seal(&self.inner.options.fsync)?;
        let (meta, path) = sealed.commit(&self.inner.options.fsync)?;
        self.inner
            .chunks
            .lock()
            .expect("chunk set lock poisoned")
            .insert(new_id, Arc::new(ChunkHandle::new(meta, path)));
        StoreMetrics::record(&self.inner.metrics.chunks_written);
        Ok(true)
    }
}

/// Keeps the chunk handle alive for as long as the reader is open, so a
/// retired chunk's file outlives every snapshot that references it.
struct HandleEntries<K: CrdtKey, S: CrdtState> {
    _handle: Arc<ChunkHandle<K>>,
    entries: ChunkEntries<K, S>,
}

impl<K: CrdtKey, S: CrdtState> Iterator for HandleEntries<K, S> {
    type Item = Result<CrdtEntry<K, S>, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next()
    }
}

#[derive(Debug, Default)]
struct TombstoneCeiling {
    best_ts: u64,
    best_chunk: u64,
    second_ts: Option<u64>,
    seen: bool,
}

impl TombstoneCeiling {
    fn observe(&mut self, ts: u64, chunk: u64) {
        if !self.seen {
            self.best_ts = ts;
            self.best_chunk = chunk;
            self.seen = true;
            return;
        }
        if chunk == self.best_chunk {
            self.best_ts = self.best_ts.max(ts);
            return;
        }
        if ts > self.best_ts {
            self.second_ts = Some(self.best_ts);
            self.best_ts = ts;
            self.best_chunk = chunk;
        } else {
            self.second_ts = Some(self.second_ts.map_or(ts, |s| s.max(ts)));
        }
    }

    fn max_excluding(&self, chunk: u64) -> Option<u64> {
        if !self.seen {
            return None;
        }
        if chunk != self.best_chunk {
            Some(self.best_ts)
        } else {
            self.second_ts
        }
    }
}

struct ChunkUploadSink<K: CrdtKey, S: CrdtState> {
    store: ChunkStore<K, S>,
    writer: Option<ChunkWriter<K, S>>,
}

impl<K: CrdtKey, S: CrdtState> ChunkUploadSink<K, S> {
    fn writer(&mut self) -> Result<&mut ChunkWriter<K, S>, StoreError> {
        if self.writer.is_none() {
            let id = self.store.inner.next_id.fetch_add(1, Ordering::SeqCst);
            self.writer = Some(ChunkWriter::create(
                &self.store.inner.dir,
                id,
                self.store.inner.options.max_entry_bytes,
            )?);
        }
        Ok(self.writer.as_mut().expect("writer just created"))
    }
}

impl<K: CrdtKey, S: CrdtState> UploadSink<K, S> for ChunkUploadSink<K, S> {
    fn push(&mut self, data: CrdtData<K, S>) -> Result<(), StoreError> {
        self.writer()?.append(&CrdtEntry::Data(data))
    }

    fn close(mut self: Box<Self>) -> Result<(), StoreError> {
        let Some(writer) = self.writer.take() else {
            return Ok(());
        };
        let sealed = writer.seal(&self.store.inner.options.fsync)?;
        let (meta, path) = sealed.commit(&self.store.inner.options.fsync)?;
        self.store
            .inner
            .chunks
            .lock()
            .expect("chunk set lock poisoned")
            .insert(meta.id, Arc::new(ChunkHandle::new(meta, path)));
        StoreMetrics::record(&self.store.inner.metrics.chunks_written);
        Ok(())
    }
}

struct ChunkRemoveSink<K: CrdtKey, S: CrdtState> {
    store: ChunkStore<K, S>,
    writer: Option<ChunkWriter<K, S>>,
}

impl<K: CrdtKey, S: CrdtState> RemoveSink<K> for ChunkRemoveSink<K, S> {
    fn push(&mut self, tombstone: CrdtTombstone<K>) -> Result<(), StoreError> {
        if self.writer.is_none() {
            let id = self.store.inner.next_id.fetch_add(1, Ordering::SeqCst);
            self.writer = Some(ChunkWriter::create(
                &self.store.inner.dir,
                id,
                self.store.inner.options.max_entry_bytes,
            )?);
        }
        let writer = self.writer.as_mut().expect("writer just created");
        writer.append(&CrdtEntry::Tombstone(tombstone))
    }

    fn close(mut self: Box<Self>) -> Result<(), StoreError> {
        let Some(writer) = self.writer.take() else {
            return Ok(());
        };
        let sealed = writer.seal(&self.store.inner.options.fsync)?;
        let (meta, path) = sealed.commit(&self.store.inner.options.fsync)?;
        self.store
            .inner
            .chunks
            .lock()
            .expect("chunk set lock poisoned")
            .insert(meta.id, Arc::new(ChunkHandle::new(meta, path)));
        StoreMetrics::record(&self.store.inner.metrics.chunks_written);
        Ok(())
    }
}

struct ChunkTakeSession<K: CrdtKey, S: CrdtState> {
    store: ChunkStore<K, S>,
    stream: Box<dyn Iterator<Item = Result<CrdtData<K, S>, StoreError>> + Send>,
    ids: BTreeSet<u64>,
    _lock: ChunkLock,
}

impl<K: CrdtKey, S: CrdtState> TakeSession<K, S> for ChunkTakeSession<K, S> {
    fn next(&mut self) -> Option<Result<CrdtData<K, S>, StoreError>> {
        self.stream.next()
    }

    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut map = self
            .store
            .inner
            .chunks
            .lock()
            .expect("chunk set lock poisoned");
        for id in &self.ids {
            if let Some(old) = map.remove(id) {
                old.retire();
            }
        }
        Ok(())
    }
}

impl<K: CrdtKey, S: CrdtState> Drop for ChunkTakeSession<K, S> {
    fn drop(&mut self) {
        self.store
            .inner
            .take_outstanding
            .store(false, Ordering::SeqCst);
    }
}
