//! WAL segment files: naming, append, rotation.
//!
//! A segment is named `<generation>.<sequence>.wal` (generation and
//! sequence as zero-padded hex, so lexical order is write order) and is
//! renamed with a `.final` suffix when rotated. Finalized segments belong
//! to the drainer.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

use super::super::record::encode_record;
use super::super::{FsyncPolicy, StoreError};

pub(crate) const SEGMENT_SUFFIX: &str = ".wal";
pub(crate) const FINAL_SUFFIX: &str = ".wal.final";

/// Roll conditions; any satisfied condition finalizes the current segment
/// before the next append.
#[derive(Clone, Copy, Debug)]
pub struct WalRollPolicy {
    pub max_bytes: u64,
    pub max_entries: u64,
    pub max_age_ms: u64,
}

impl Default for WalRollPolicy {
    fn default() -> Self {
        Self {
            max_bytes: 4 << 20,
            max_entries: 16_384,
            max_age_ms: 60_000,
        }
    }
}

pub(crate) fn segment_file_name(generation: u64, sequence: u64) -> String {
    format!("{generation:016x}.{sequence:08x}{SEGMENT_SUFFIX}")
}

/// Parse `<gen>.<seq>.wal[.final]`; returns (generation, sequence, final).
pub(crate) fn parse_segment_file_name(name: &str) -> Option<(u64, u64, bool)> {
    let (stem, finalized) = match name.strip_suffix(FINAL_SUFFIX) {
        Some(stem) => (stem, true),
        None => (name.strip_suffix(SEGMENT_SUFFIX)?, false),
    };
    let (generation, sequence) = stem.split_once('.')?;
    let generation = u64::from_str_radix(generation, 16).ok()?;
    let sequence = u64::from_str_radix(sequence, 16).ok()?;
    Some((generation, sequence, finalized))
}

pub(crate) struct SegmentWriter {
    path: PathBuf,
    file: File,
    bytes_written: u64,
    entries_written: u64,
    created: Instant,
}

impl SegmentWriter {
    pub(crate) fn create(dir: &Path, generation: u64, sequence: u64) -> Result<Self, StoreError> {
        let path = dir.join(segment_file_name(generation, sequence));
        let file = OpenOptions::new()
            .append(true)
            .create_new(true)
            .open(&path)
            .map_err(|source| StoreError::io(&path, source))?;
        Ok(Self {
            path,
            file,
            bytes_written: 0,
            entries_written: 0,
            created: Instant::now(),
        })
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries_written == 0
    }

    pub(crate) fn should_roll(&self, policy: &WalRollPolicy, next_len: u64) -> bool {
        if self.entries_written == 0 {
            return false;
        }
        if policy.max_bytes > 0 && self.bytes_written.saturating_add(next_len) > policy.max_bytes {
            return true;
        }
        if policy.max_entries > 0 && self.entries_written >= policy.max_entries {
            return true;
        }
        if policy.max_age_ms > 0 && self.created.elapsed().as_millis() as u64 >= policy.max_age_ms {
            return true;
        }
        false
    }

    /// Append one framed record; returns only after the record is durable
    /// when `fsync.appends` is set.
    pub(crate) fn append(
        &mut self,
        payload: &[u8],
        max_entry_bytes: usize,
        fsync: &FsyncPolicy,
    ) -> Result<(), StoreError> {
        let record = encode_record(payload, max_entry_bytes).map_err(StoreError::from)?;
        self.file
            .write_all(&record)
            .map_err(|source| StoreError::io(&self.path, source))?;
        if fsync.appends {
            self.file
                .sync_all()
                .map_err(|source| StoreError::io(&self.path, source))?;
        }
        self.bytes_written += record.len() as u64;
        self.entries_written += 1;
        Ok(())
    }

    /// Close and rename with the terminal suffix; ownership of the file
    /// passes to the drainer.
    pub(crate) fn finalize(self, fsync: &FsyncPolicy) -> Result<PathBuf, StoreError> {
        self.file
            .sync_all()
            .map_err(|source| StoreError::io(&self.path, source))?;
        let final_path = finalized_path(&self.path);
        fs::rename(&self.path, &final_path)
            .map_err(|source| StoreError::io(&final_path, source))?;
        if fsync.directories {
            if let Some(dir) = final_path.parent() {
                let handle = File::open(dir).map_err(|source| StoreError::io(dir, source))?;
                handle
                    .sync_all()
                    .map_err(|source| StoreError::io(dir, source))?;
            }
        }
        Ok(final_path)
    }
}

pub(crate) fn finalized_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(".final");
    path.with_file_name(name)
}
