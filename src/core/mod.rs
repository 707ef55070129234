//! CRDT data model: entries, the merge contract and the entry codec.

use std::fmt::Debug;
use std::hash::Hash;

pub mod codec;
pub mod data;
pub mod function;

pub use codec::{decode_entry, encode_data, encode_entry, CodecError};
pub use data::{merge_entries, CrdtData, CrdtEntry, CrdtTombstone};
pub use function::{CrdtFunction, Lww};

/// Key requirements: total order for chunk layout and k-way merges, a hash
/// for the rendezvous sharder, and a CBOR encoding for the wire and disk
/// formats.
pub trait CrdtKey:
    Ord
    + Hash
    + Clone
    + Debug
    + Send
    + Sync
    + 'static
    + minicbor::Encode<()>
    + for<'b> minicbor::Decode<'b, ()>
{
}

impl<T> CrdtKey for T where
    T: Ord
        + Hash
        + Clone
        + Debug
        + Send
        + Sync
        + 'static
        + minicbor::Encode<()>
        + for<'b> minicbor::Decode<'b, ()>
{
}

/// State requirements: a CBOR encoding; everything else is up to the merge
/// function.
pub trait CrdtState:
    Clone + Debug + Send + Sync + 'static + minicbor::Encode<()> + for<'b> minicbor::Decode<'b, ()>
{
}

impl<T> CrdtState for T where
    T: Clone
        + Debug
        + Send
        + Sync
        + 'static
        + minicbor::Encode<()>
        + for<'b> minicbor::Decode<'b, ()>
{
}
