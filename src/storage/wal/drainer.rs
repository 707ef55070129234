//! Uploads finalized WAL segments into the chunk store.

use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::core::{decode_entry, CrdtEntry, CrdtKey, CrdtState};
use crate::metrics::StoreMetrics;

use super::super::chunk::ChunkStore;
use super::super::merge::collapse_sorted;
use super::super::record::RecordReader;
use super::super::StoreError;
use super::finalized_segments_in;

/// Drains finalized segments in lexical (write) order: sort by key, merge
/// duplicate keys, upload as one chunk, delete the segment. Replays after
/// a crash are safe because chunk-store merges are idempotent.
pub struct WalDrainer<K, S> {
    wal_dir: PathBuf,
    chunks: ChunkStore<K, S>,
    max_entry_bytes: usize,
    /// One drain at a time, whether from the background loop or a flush.
    drain_serial: Mutex<()>,
    metrics: Arc<StoreMetrics>,
}

impl<K: CrdtKey, S: CrdtState> WalDrainer<K, S> {
    pub fn new(
        wal_dir: impl Into<PathBuf>,
        chunks: ChunkStore<K, S>,
        max_entry_bytes: usize,
        metrics: Arc<StoreMetrics>,
    ) -> Self {
        Self {
            wal_dir: wal_dir.into(),
            chunks,
            max_entry_bytes,
            drain_serial: Mutex::new(()),
            metrics,
        }
    }

    /// Process every finalized segment currently on disk. Returns how many
    /// segments were uploaded and deleted. A failing segment stays in
    /// place for the next attempt.
    pub fn drain_once(&self) -> Result<usize, StoreError> {
        let _serial = self.drain_serial.lock().expect("drain lock poisoned");

        let segments = finalized_segments_in(&self.wal_dir)?;
        let mut drained = 0usize;
        for path in segments {
            self.drain_segment(&path)?;
            drained += 1;
        }
        Ok(drained)
    }

    fn drain_segment(&self, path: &Path) -> Result<(), StoreError> {
        let entries = read_segment_entries::<K, S>(path, self.max_entry_bytes)?;
        if entries.is_empty() {
            tracing::info!("discarding empty wal segment {:?}", path);
        } else {
            let collapsed = collapse_sorted(self.chunks.function().as_ref(), entries);
            self.chunks.write_entries(&collapsed)?;
        }

        fs::remove_file(path).map_err(|source| StoreError::io(path, source))?;
        StoreMetrics::record(&self.metrics.wal_segments_drained);
        tracing::debug!("drained wal segment {:?}", path);
        Ok(())
    }
}

/// Read a segment's records, discarding a torn tail. Segments are small
/// enough (bounded by the roll policy) to sort in memory.
pub(crate) fn read_segment_entries<K: CrdtKey, S: CrdtState>(
    path: &Path,
    max_entry_bytes: usize,
) -> Result<Vec<CrdtEntry<K, S>>, StoreError> {
    let file = File::open(path).map_err(|source| StoreError::io(path, source))?;
    let mut reader = RecordReader::new(BufReader::new(file), max_entry_bytes);

    let mut entries = Vec::new();
    loop {
        match reader.read_next() {
            Ok(Some(payload)) => entries.push(decode_entry::<K, S>(&payload)?),
            Ok(None) => break,
            Err(err) if err.is_torn_tail() => {
                tracing::warn!(
                    "discarding torn tail of wal segment {:?} after {} records: {}",
                    path,
                    entries.len(),
                    err
                );
                break;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(entries)
}
