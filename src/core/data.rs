//! CRDT entries: data records and tombstones.

use super::function::CrdtFunction;

/// A keyed CRDT state together with the timestamp of its latest mutation.
///
/// The timestamp is monotonic within a key across merges; the state is
/// mutated only by the merge function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CrdtData<K, S> {
    pub key: K,
    pub timestamp: u64,
    pub state: S,
}

impl<K, S> CrdtData<K, S> {
    pub fn new(key: K, timestamp: u64, state: S) -> Self {
        Self {
            key,
            timestamp,
            state,
        }
    }
}

/// Deletion marker: removes data whose timestamp is `<=` the tombstone's.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CrdtTombstone<K> {
    pub key: K,
    pub timestamp: u64,
}

impl<K> CrdtTombstone<K> {
    pub fn new(key: K, timestamp: u64) -> Self {
        Self { key, timestamp }
    }
}

/// What actually lives in WAL segments and chunk files.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CrdtEntry<K, S> {
    Data(CrdtData<K, S>),
    Tombstone(CrdtTombstone<K>),
}

impl<K, S> CrdtEntry<K, S> {
    pub fn key(&self) -> &K {
        match self {
            CrdtEntry::Data(data) => &data.key,
            CrdtEntry::Tombstone(tombstone) => &tombstone.key,
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            CrdtEntry::Data(data) => data.timestamp,
            CrdtEntry::Tombstone(tombstone) => tombstone.timestamp,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, CrdtEntry::Tombstone(_))
    }

    pub fn into_data(self) -> Option<CrdtData<K, S>> {
        match self {
            CrdtEntry::Data(data) => Some(data),
            CrdtEntry::Tombstone(_) => None,
        }
    }
}

/// Resolve two entries for the same key into one.
///
/// Data merges via the CRDT function with the maximum timestamp.
/// Tombstones dominate data with a lower-or-equal timestamp; data with a
/// higher timestamp dominates tombstones.
pub fn merge_entries<K: Ord, S>(
    function: &dyn CrdtFunction<S>,
    a: CrdtEntry<K, S>,
    b: CrdtEntry<K, S>,
) -> CrdtEntry<K, S> {
    debug_assert!(a.key() == b.key());
    match (a, b) {
        (CrdtEntry::Data(a), CrdtEntry::Data(b)) => {
            let timestamp = a.timestamp.max(b.timestamp);
            let state = function.merge(&a.state, a.timestamp, &b.state, b.timestamp);
            CrdtEntry::Data(CrdtData::new(a.key, timestamp, state))
        }
        (CrdtEntry::Tombstone(a), CrdtEntry::Tombstone(b)) => {
            let timestamp = a.timestamp.max(b.timestamp);
            CrdtEntry::Tombstone(CrdtTombstone::new(a.key, timestamp))
        }
        (CrdtEntry::Data(data), CrdtEntry::Tombstone(tombstone))
        | (CrdtEntry::Tombstone(tombstone), CrdtEntry::Data(data)) => {
            if tombstone.timestamp >= data.timestamp {
                CrdtEntry::Tombstone(tombstone)
            } else {
                CrdtEntry::Data(data)
            }
        }
    }
}
