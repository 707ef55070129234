//! On-disk record framing for WAL segments and chunk bodies.
//!
//! Layout: `len:u32 LE || crc32c:u32 LE || payload`. The checksum covers
//! the payload only; a record that stops short of its declared length is
//! a torn write, a record whose checksum disagrees is corruption, and
//! recovery treats both as the start of a discardable tail.

use std::io::{ErrorKind, Read, Write};

use crc32c::crc32c;
use thiserror::Error;

use super::StoreError;

pub const RECORD_PREFIX_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("record length is zero")]
    ZeroLength,
    #[error("record of {got} bytes exceeds limit {limit}")]
    Oversize { limit: usize, got: usize },
    #[error("record checksum mismatch: want {want:#010x} got {got:#010x}")]
    ChecksumMismatch { want: u32, got: u32 },
    #[error("record prefix truncated")]
    TruncatedPrefix,
    #[error("record payload truncated")]
    TruncatedPayload,
}

impl RecordError {
    /// Everything except a genuine I/O failure reads as a torn write; WAL
    /// recovery drops the tail from the first such record on.
    pub fn is_torn_tail(&self) -> bool {
        !matches!(self, RecordError::Io(_))
    }
}

impl From<RecordError> for StoreError {
    fn from(err: RecordError) -> Self {
        match err {
            RecordError::Io(source) => StoreError::Io { path: None, source },
            other => StoreError::protocol(other.to_string()),
        }
    }
}

pub fn encode_record(payload: &[u8], limit: usize) -> Result<Vec<u8>, RecordError> {
    if payload.is_empty() {
        return Err(RecordError::ZeroLength);
    }
    if payload.len() > limit || u32::try_from(payload.len()).is_err() {
        return Err(RecordError::Oversize {
            limit,
            got: payload.len(),
        });
    }

    let mut prefix = [0u8; RECORD_PREFIX_LEN];
    prefix[..4].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    prefix[4..].copy_from_slice(&crc32c(payload).to_le_bytes());

    let mut record = Vec::with_capacity(RECORD_PREFIX_LEN + payload.len());
    record.extend_from_slice(&prefix);
    record.extend_from_slice(payload);
    Ok(record)
}

pub struct RecordReader<R> {
    input: R,
    limit: usize,
}

impl<R: Read> RecordReader<R> {
    pub fn new(input: R, limit: usize) -> Self {
        Self { input, limit }
    }

    /// Next payload, `Ok(None)` on a clean end of input.
    pub fn read_next(&mut self) -> Result<Option<Vec<u8>>, RecordError> {
        let mut prefix = [0u8; RECORD_PREFIX_LEN];
        if !self.fill_prefix(&mut prefix)? {
            return Ok(None);
        }

        let len = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        let want = u32::from_le_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]);
        if len == 0 {
            return Err(RecordError::ZeroLength);
        }
        if len > self.limit {
            return Err(RecordError::Oversize {
                limit: self.limit,
                got: len,
            });
        }

        let mut payload = vec![0u8; len];
        self.input.read_exact(&mut payload).map_err(|err| {
            if err.kind() == ErrorKind::UnexpectedEof {
                RecordError::TruncatedPayload
            } else {
                RecordError::Io(err)
            }
        })?;

        let got = crc32c(&payload);
        if got != want {
            return Err(RecordError::ChecksumMismatch { want, got });
        }
        Ok(Some(payload))
    }

    /// False only when the input ends exactly on a record boundary.
    fn fill_prefix(&mut self, prefix: &mut [u8; RECORD_PREFIX_LEN]) -> Result<bool, RecordError> {
        let mut have = 0usize;
        while have < prefix.len() {
            match self.input.read(&mut prefix[have..]) {
                Ok(0) if have == 0 => return Ok(false),
                Ok(0) => return Err(RecordError::TruncatedPrefix),
                Ok(n) => have += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Ok(true)
    }
}

pub struct RecordWriter<W> {
    output: W,
    limit: usize,
}

impl<W: Write> RecordWriter<W> {
    pub fn new(output: W, limit: usize) -> Self {
        Self { output, limit }
    }

    /// Returns the on-disk size of the record, prefix included.
    pub fn append(&mut self, payload: &[u8]) -> Result<usize, RecordError> {
        let record = encode_record(payload, self.limit)?;
        self.output.write_all(&record)?;
        Ok(record.len())
    }

    pub fn into_inner(self) -> W {
        self.output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn records_of(buf: Vec<u8>, limit: usize) -> RecordReader<Cursor<Vec<u8>>> {
        RecordReader::new(Cursor::new(buf), limit)
    }

    #[test]
    fn writes_then_reads_back_in_order() {
        let mut buf = Vec::new();
        {
            let mut writer = RecordWriter::new(&mut buf, 256);
            writer.append(b"segment-entry-one").unwrap();
            writer.append(b"two").unwrap();
        }
        let mut reader = records_of(buf, 256);
        assert_eq!(reader.read_next().unwrap().unwrap(), b"segment-entry-one");
        assert_eq!(reader.read_next().unwrap().unwrap(), b"two");
        assert!(reader.read_next().unwrap().is_none());
    }

    #[test]
    fn flipped_payload_bit_fails_the_checksum() {
        let mut record = encode_record(b"wal-record-0001", 64).unwrap();
        record[RECORD_PREFIX_LEN + 2] ^= 0x10;

        let err = records_of(record, 64).read_next().unwrap_err();
        assert!(matches!(err, RecordError::ChecksumMismatch { .. }));
        assert!(err.is_torn_tail());
    }

    #[test]
    fn cut_payload_reads_as_torn_tail() {
        let mut record = encode_record(b"0123456789abcdef", 64).unwrap();
        record.truncate(record.len() - 7);

        let err = records_of(record, 64).read_next().unwrap_err();
        assert!(matches!(err, RecordError::TruncatedPayload));
        assert!(err.is_torn_tail());
    }

    #[test]
    fn cut_prefix_reads_as_torn_tail() {
        let record = encode_record(b"xyz", 64).unwrap();

        let err = records_of(record[..5].to_vec(), 64).read_next().unwrap_err();
        assert!(matches!(err, RecordError::TruncatedPrefix));
        assert!(err.is_torn_tail());
    }

    #[test]
    fn limit_applies_on_both_sides() {
        assert!(matches!(
            encode_record(&[9u8; 40], 32),
            Err(RecordError::Oversize { .. })
        ));

        let record = encode_record(&[9u8; 40], 64).unwrap();
        let err = records_of(record, 32).read_next().unwrap_err();
        assert!(matches!(err, RecordError::Oversize { .. }));
    }

    #[test]
    fn empty_payload_is_rejected() {
        assert!(matches!(encode_record(b"", 32), Err(RecordError::ZeroLength)));
    }
}
