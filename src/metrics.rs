//! Operation counters exposed as a plain snapshot struct.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct StoreMetrics {
    pub uploaded_items: AtomicU64,
    pub downloaded_items: AtomicU64,
    pub taken_items: AtomicU64,
    pub removed_items: AtomicU64,
    pub repartitioned_items: AtomicU64,
    pub chunks_written: AtomicU64,
    pub chunks_consolidated: AtomicU64,
    pub chunks_cleaned: AtomicU64,
    pub wal_records_appended: AtomicU64,
    pub wal_segments_drained: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub uploaded_items: u64,
    pub downloaded_items: u64,
    pub taken_items: u64,
    pub removed_items: u64,
    pub repartitioned_items: u64,
    pub chunks_written: u64,
    pub chunks_consolidated: u64,
    pub chunks_cleaned: u64,
    pub wal_records_appended: u64,
    pub wal_segments_drained: u64,
}

impl StoreMetrics {
    pub fn record(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_n(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uploaded_items: self.uploaded_items.load(Ordering::Relaxed),
            downloaded_items: self.downloaded_items.load(Ordering::Relaxed),
            taken_items: self.taken_items.load(Ordering::Relaxed),
            removed_items: self.removed_items.load(Ordering::Relaxed),
            repartitioned_items: self.repartitioned_items.load(Ordering::Relaxed),
            chunks_written: self.chunks_written.load(Ordering::Relaxed),
            chunks_consolidated: self.chunks_consolidated.load(Ordering::Relaxed),
            chunks_cleaned: self.chunks_cleaned.load(Ordering::Relaxed),
            wal_records_appended: self.wal_records_appended.load(Ordering::Relaxed),
            wal_segments_drained: self.wal_segments_drained.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let metrics = StoreMetrics::default();
        StoreMetrics::record(&metrics.uploaded_items);
        StoreMetrics::record_n(&metrics.chunks_written, 3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.uploaded_items, 1);
        assert_eq!(snapshot.chunks_written, 3);
        assert_eq!(snapshot.taken_items, 0);
    }
}
