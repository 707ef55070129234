//! Streaming k-way merge over sorted entry sources.
//!
//! Every source must yield entries in strictly ascending key order; the
//! merge combines equal keys with the CRDT function so the output is again
//! strictly ascending. Used for chunk reads, consolidation and cluster
//! replica reduction.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use crate::core::{merge_entries, CrdtData, CrdtEntry, CrdtFunction};

use super::StoreError;

pub type EntryStream<K, S> = Box<dyn Iterator<Item = Result<CrdtEntry<K, S>, StoreError>> + Send>;

struct HeapEntry<K, S> {
    entry: CrdtEntry<K, S>,
    source: usize,
}

impl<K: Ord, S> PartialEq for HeapEntry<K, S> {
    fn eq(&self, other: &Self) -> bool {
        self.entry.key() == other.entry.key() && self.source == other.source
    }
}

impl<K: Ord, S> Eq for HeapEntry<K, S> {}

impl<K: Ord, S> PartialOrd for HeapEntry<K, S> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K: Ord, S> Ord for HeapEntry<K, S> {
    // Reversed so the BinaryHeap surfaces the smallest key first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .entry
            .key()
            .cmp(self.entry.key())
            .then_with(|| other.source.cmp(&self.source))
    }
}

pub struct KWayMerge<K, S> {
    function: Arc<dyn CrdtFunction<S>>,
    sources: Vec<EntryStream<K, S>>,
    heap: BinaryHeap<HeapEntry<K, S>>,
    failed: bool,
}

impl<K: Ord, S> KWayMerge<K, S> {
    pub fn new(
        function: Arc<dyn CrdtFunction<S>>,
        sources: Vec<EntryStream<K, S>>,
    ) -> Result<Self, StoreError> {
        let mut merge = Self {
            function,
            sources,
            heap: BinaryHeap::new(),
            failed: false,
        };
        for source in 0..merge.sources.len() {
            merge.refill(source)?;
        }
        Ok(merge)
    }

    fn refill(&mut self, source: usize) -> Result<(), StoreError> {
        match self.sources[source].next() {
            Some(Ok(entry)) => {
                self.heap.push(HeapEntry { entry, source });
                Ok(())
            }
            Some(Err(err)) => Err(err),
            None => Ok(()),
        }
    }
}

impl<K: Ord, S> Iterator for KWayMerge<K, S> {
    type Item = Result<CrdtEntry<K, S>, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let top = self.heap.pop()?;
        if let Err(err) = self.refill(top.source) {
            self.failed = true;
            return Some(Err(err));
        }

        let mut merged = top.entry;
        loop {
            let same_key = matches!(self.heap.peek(), Some(next) if next.entry.key() == merged.key());
            if !same_key {
                break;
            }
            let Some(next) = self.heap.pop() else {
                break;
            };
            if let Err(err) = self.refill(next.source) {
                self.failed = true;
                return Some(Err(err));
            }
            merged = merge_entries(self.function.as_ref(), merged, next.entry);
        }
        Some(Ok(merged))
    }
}

/// Post-merge filter for `download(since)`: drop tombstones, drop entries
/// at or below the watermark, trim delta states via `extract`.
pub fn extract_after<K, S>(
    function: &dyn CrdtFunction<S>,
    entry: CrdtEntry<K, S>,
    since: u64,
) -> Option<CrdtData<K, S>> {
    let data = entry.into_data()?;
    if since > 0 && data.timestamp <= since {
        return None;
    }
    let state = function.extract(&data.state, since)?;
    Some(CrdtData::new(data.key, data.timestamp, state))
}

/// In-memory variant for WAL segments: stable-sort by key, then collapse
/// duplicates. Stable order keeps the resolution independent of how the
/// writes interleaved inside the segment.
pub fn collapse_sorted<K: Ord, S>(
    function: &dyn CrdtFunction<S>,
    mut entries: Vec<CrdtEntry<K, S>>,
) -> Vec<CrdtEntry<K, S>> {
    entries.sort_by(|a, b| a.key().cmp(b.key()));
    let mut collapsed: Vec<CrdtEntry<K, S>> = Vec::with_capacity(entries.len());
    let mut current: Option<CrdtEntry<K, S>> = None;
    for entry in entries {
        current = Some(match current.take() {
            Some(prev) if prev.key() == entry.key() => merge_entries(function, prev, entry),
            Some(prev) => {
                collapsed.push(prev);
                entry
            }
            None => entry,
        });
    }
    if let Some(last) = current {
        collapsed.push(last);
    }
    collapsed
}
