//! Chunk selection for consolidation.
//!
//! Alternates between two policies: the *hot segment* (the few most
//! recently written chunks, high overlap, cheap) and the *cold segment*
//! (the long tail of old chunks, large output, reclaims space). The flip
//! is process-local and resets on restart.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::set::ChunkHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentKind {
    Hot,
    Cold,
}

impl SegmentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SegmentKind::Hot => "hot",
            SegmentKind::Cold => "cold",
        }
    }
}

#[derive(Debug)]
pub struct ConsolidationStrategy {
    /// How many of the newest chunks form the hot segment.
    hot_chunks: usize,
    next_cold: AtomicBool,
}

impl ConsolidationStrategy {
    pub fn new(hot_chunks: usize) -> Self {
        Self {
            hot_chunks: hot_chunks.max(2),
            next_cold: AtomicBool::new(false),
        }
    }

    /// Pick the chunks for the next consolidation from `chunks`, which
    /// must be sorted by ascending id (write order). Fewer than two
    /// selected chunks means there is nothing worth merging.
    pub fn select<K>(&self, chunks: &[Arc<ChunkHandle<K>>]) -> (SegmentKind, Vec<Arc<ChunkHandle<K>>>) {
        let cold = self.next_cold.fetch_xor(true, Ordering::Relaxed);
        if cold {
            let tail = chunks.len().saturating_sub(self.hot_chunks);
            let selected: Vec<_> = chunks[..tail].to_vec();
            if selected.len() >= 2 {
                return (SegmentKind::Cold, selected);
            }
            // Cold tail too short; fall through to the whole set so small
            // stores still converge.
            return (SegmentKind::Cold, chunks.to_vec());
        }

        let start = chunks.len().saturating_sub(self.hot_chunks);
        (SegmentKind::Hot, chunks[start..].to_vec())
    }
}
