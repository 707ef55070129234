//! Binary entry encoding (CBOR).
//!
//! Every entry is a CBOR array: `[0, key, timestamp, state]` for data,
//! `[1, key, timestamp]` for a tombstone. The same bytes travel through
//! WAL records, chunk bodies and wire bulk frames, so the encoding is
//! stable across minor versions.

use std::convert::Infallible;

use minicbor::{Decoder, Encoder};
use thiserror::Error;

use super::data::{CrdtData, CrdtEntry, CrdtTombstone};
use super::{CrdtKey, CrdtState};

const TAG_DATA: u8 = 0;
const TAG_TOMBSTONE: u8 = 1;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("cbor encode: {0}")]
    Encode(#[from] minicbor::encode::Error<Infallible>),
    #[error("cbor decode: {0}")]
    Decode(#[from] minicbor::decode::Error),
    #[error("indefinite-length CBOR not allowed")]
    IndefiniteLength,
    #[error("unknown entry tag {0}")]
    UnknownTag(u8),
    #[error("entry array has {got} elements, expected {expected}")]
    BadArity { expected: u64, got: u64 },
    #[error("trailing bytes after entry")]
    TrailingBytes,
}

pub fn encode_entry<K: CrdtKey, S: CrdtState>(
    entry: &CrdtEntry<K, S>,
) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    let mut e = Encoder::new(&mut buf);
    match entry {
        CrdtEntry::Data(data) => {
            e.array(4)?
                .u8(TAG_DATA)?
                .encode(&data.key)?
                .u64(data.timestamp)?
                .encode(&data.state)?;
        }
        CrdtEntry::Tombstone(tombstone) => {
            e.array(3)?
                .u8(TAG_TOMBSTONE)?
                .encode(&tombstone.key)?
                .u64(tombstone.timestamp)?;
        }
    }
    Ok(buf)
}

pub fn encode_data<K: CrdtKey, S: CrdtState>(
    data: &CrdtData<K, S>,
) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    let mut e = Encoder::new(&mut buf);
    e.array(4)?
        .u8(TAG_DATA)?
        .encode(&data.key)?
        .u64(data.timestamp)?
        .encode(&data.state)?;
    Ok(buf)
}

pub fn decode_entry<K: CrdtKey, S: CrdtState>(
    bytes: &[u8],
) -> Result<CrdtEntry<K, S>, CodecError> {
    let mut d = Decoder::new(bytes);
    let len = d.array()?.ok_or(CodecError::IndefiniteLength)?;
    let tag = d.u8()?;
    let entry = match tag {
        TAG_DATA => {
            if len != 4 {
                return Err(CodecError::BadArity {
                    expected: 4,
                    got: len,
                });
            }
            let key: K = d.decode()?;
            let timestamp = d.u64()?;
            let state: S = d.decode()?;
            CrdtEntry::Data(CrdtData::new(key, timestamp, state))
        }
        TAG_TOMBSTONE => {
            if len != 3 {
                return Err(CodecError::BadArity {
                    expected: 3,
                    got: len,
                });
            }
            let key: K = d.decode()?;
            let timestamp = d.u64()?;
            CrdtEntry::Tombstone(CrdtTombstone::new(key, timestamp))
        }
        other => return Err(CodecError::UnknownTag(other)),
    };
    if d.position() != bytes.len() {
        return Err(CodecError::TrailingBytes);
    }
    Ok(entry)
}
