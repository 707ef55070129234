//! Write-ahead log: rolling segments absorbing writes before the drainer
//! consolidates them into chunks.

use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::core::{encode_entry, CrdtEntry, CrdtKey, CrdtState};
use crate::metrics::StoreMetrics;

use super::{FsyncPolicy, StoreError};

pub mod drainer;
pub mod segment;

pub use drainer::WalDrainer;
pub use segment::WalRollPolicy;

use segment::{finalized_path, parse_segment_file_name, SegmentWriter, FINAL_SUFFIX};

#[derive(Clone, Copy, Debug)]
pub struct WalOptions {
    pub roll: WalRollPolicy,
    pub fsync: FsyncPolicy,
    pub max_entry_bytes: usize,
}

impl Default for WalOptions {
    fn default() -> Self {
        Self {
            roll: WalRollPolicy::default(),
            fsync: FsyncPolicy::default(),
            max_entry_bytes: 1 << 24,
        }
    }
}

struct WriterState {
    generation: u64,
    next_sequence: u64,
    current: Option<SegmentWriter>,
}

/// Append side of the WAL. One writer owns the current segment; rotation
/// hands finalized segments over to the drainer.
pub struct FileWal<K, S> {
    dir: PathBuf,
    options: WalOptions,
    state: Mutex<WriterState>,
    metrics: Arc<StoreMetrics>,
    _marker: PhantomData<fn() -> (K, S)>,
}

impl<K: CrdtKey, S: CrdtState> FileWal<K, S> {
    /// Open the WAL directory, finalizing any segment a previous process
    /// left behind, and start a fresh generation.
    pub fn open(
        dir: impl Into<PathBuf>,
        options: WalOptions,
        metrics: Arc<StoreMetrics>,
    ) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StoreError::io(&dir, source))?;

        let mut max_generation = 0u64;
        let listing = fs::read_dir(&dir).map_err(|source| StoreError::io(&dir, source))?;
        for dirent in listing {
            let dirent = dirent.map_err(|source| StoreError::io(&dir, source))?;
            let path = dirent.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some((generation, _sequence, finalized)) = parse_segment_file_name(name) else {
                continue;
            };
            max_generation = max_generation.max(generation);
            if !finalized {
                // Crash leftover: the writer died with this segment open.
                // Finalize it so the drainer replays whatever survived.
                let final_path = finalized_path(&path);
                tracing::info!("finalizing leftover wal segment {:?}", path);
                fs::rename(&path, &final_path)
                    .map_err(|source| StoreError::io(&final_path, source))?;
            }
        }

        Ok(Self {
            dir,
            options,
            state: Mutex::new(WriterState {
                generation: max_generation + 1,
                next_sequence: 0,
                current: None,
            }),
            metrics,
            _marker: PhantomData,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Durably append one entry. Out-of-timestamp-order writes to the same
    /// key are fine; the drainer's merge normalizes them.
    pub fn append(&self, entry: &CrdtEntry<K, S>) -> Result<(), StoreError> {
        let payload = encode_entry(entry)?;
        let mut state = self.state.lock().expect("wal writer lock poisoned");

        let needs_roll = state
            .current
            .as_ref()
            .is_some_and(|writer| writer.should_roll(&self.options.roll, payload.len() as u64));
        if needs_roll {
            self.finalize_locked(&mut state)?;
        }
        if state.current.is_none() {
            let writer =
                SegmentWriter::create(&self.dir, state.generation, state.next_sequence)?;
            state.next_sequence += 1;
            state.current = Some(writer);
        }

        let writer = state
            .current
            .as_mut()
            .expect("current segment just ensured");
        writer.append(&payload, self.options.max_entry_bytes, &self.options.fsync)?;
        StoreMetrics::record(&self.metrics.wal_records_appended);
        Ok(())
    }

    /// Finalize the current segment, if any, making it visible to the
    /// drainer. Returns whether a segment was handed over.
    pub fn rotate(&self) -> Result<bool, StoreError> {
        let mut state = self.state.lock().expect("wal writer lock poisoned");
        self.finalize_locked(&mut state)
    }

    fn finalize_locked(&self, state: &mut WriterState) -> Result<bool, StoreError> {
        let Some(writer) = state.current.take() else {
            return Ok(false);
        };
        if writer.is_empty() {
            state.current = Some(writer);
            return Ok(false);
        }
        writer.finalize(&self.options.fsync)?;
        Ok(true)
    }

    /// Finalized segments in write order.
    pub fn finalized_segments(&self) -> Result<Vec<PathBuf>, StoreError> {
        finalized_segments_in(&self.dir)
    }
}

pub(crate) fn finalized_segments_in(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let mut segments = Vec::new();
    let listing = fs::read_dir(dir).map_err(|source| StoreError::io(dir, source))?;
    for dirent in listing {
        let dirent = dirent.map_err(|source| StoreError::io(dir, source))?;
        let path = dirent.path();
        let is_final = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| name.ends_with(FINAL_SUFFIX));
        if is_final {
            segments.push(path);
        }
    }
    segments.sort();
    Ok(segments)
}
