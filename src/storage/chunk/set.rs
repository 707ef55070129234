//! Chunk handles with deferred deletion, and the consolidation locker.

use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::super::StoreError;
use super::file::ChunkMeta;

/// One immutable chunk file. Readers hold an `Arc` to the handle for the
/// duration of a read; a retired handle unlinks its file when the last
/// reference drops, so deletion waits for open readers.
#[derive(Debug)]
pub struct ChunkHandle<K> {
    pub meta: ChunkMeta<K>,
    pub path: PathBuf,
    retired: AtomicBool,
}

impl<K> ChunkHandle<K> {
    pub fn new(meta: ChunkMeta<K>, path: PathBuf) -> Self {
        Self {
            meta,
            path,
            retired: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.meta.id
    }

    /// Mark for deletion once all readers release.
    pub fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }
}

impl<K> Drop for ChunkHandle<K> {
    fn drop(&mut self) {
        if self.retired.load(Ordering::Acquire) {
            if let Err(err) = fs::remove_file(&self.path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("failed to delete retired chunk {:?}: {}", self.path, err);
                }
            }
        }
    }
}

/// Guards chunks participating in a consolidation or an outstanding take.
/// Overlapping selections observe the lock and back off.
#[derive(Debug, Default)]
pub struct ChunkLocker {
    locked: Mutex<BTreeSet<u64>>,
}

impl ChunkLocker {
    pub fn try_lock(self: &Arc<Self>, ids: BTreeSet<u64>) -> Result<ChunkLock, StoreError> {
        let mut locked = self.locked.lock().expect("chunk locker poisoned");
        if ids.iter().any(|id| locked.contains(id)) {
            return Err(StoreError::ChunksAlreadyLocked);
        }
        locked.extend(ids.iter().copied());
        Ok(ChunkLock {
            locker: Arc::clone(self),
            ids,
        })
    }

    pub fn is_locked(&self, id: u64) -> bool {
        self.locked
            .lock()
            .expect("chunk locker poisoned")
            .contains(&id)
    }

    fn release(&self, ids: &BTreeSet<u64>) {
        let mut locked = self.locked.lock().expect("chunk locker poisoned");
        for id in ids {
            locked.remove(id);
        }
    }
}

/// RAII lock over a set of chunk ids.
#[derive(Debug)]
pub struct ChunkLock {
    locker: Arc<ChunkLocker>,
    ids: BTreeSet<u64>,
}

impl ChunkLock {
    pub fn ids(&self) -> &BTreeSet<u64> {
        &self.ids
    }
}

impl Drop for ChunkLock {
    fn drop(&mut self) {
        self.locker.release(&self.ids);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlapping_lock_backs_off() {
        let locker = Arc::new(ChunkLocker::default());
        let held = locker
            .try_lock(BTreeSet::from([1, 2, 3]))
            .expect("first lock");

        let err = locker.try_lock(BTreeSet::from([3, 4])).unwrap_err();
        assert!(matches!(err, StoreError::ChunksAlreadyLocked));

        let disjoint = locker.try_lock(BTreeSet::from([4, 5])).expect("disjoint");
        drop(disjoint);
        drop(held);

        assert!(!locker.is_locked(3));
        locker.try_lock(BTreeSet::from([3, 4])).expect("after release");
    }
}
