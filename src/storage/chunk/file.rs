//! Chunk file layout and streaming reader/writer.
//!
//! A chunk is named by its decimal id. Layout:
//!
//! ```text
//! magic "SHCK" | version u16 | flags u16 | count u32 | body_len u64
//! body: repeated framed entries (ascending keys, no duplicates)
//! footer: one framed CBOR array [min_key, max_key]
//! ```
//!
//! The writer streams entries into `<id>.tmp`, patches `count`/`body_len`
//! on seal, and the commit rename makes the chunk visible. A crash before
//! the rename leaves only a `.tmp` orphan.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use minicbor::{Decoder, Encoder};

use crate::core::{decode_entry, encode_entry, CodecError, CrdtEntry, CrdtKey, CrdtState};

use super::super::record::{RecordReader, RecordWriter, RECORD_PREFIX_LEN};
use super::super::{FsyncPolicy, StoreError};

pub(crate) const CHUNK_MAGIC: &[u8; 4] = b"SHCK";
pub(crate) const CHUNK_FORMAT_VERSION: u16 = 1;
pub(crate) const CHUNK_PREAMBLE_LEN: usize = 4 + 2 + 2 + 4 + 8;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkMeta<K> {
    pub id: u64,
    pub count: u32,
    pub body_len: u64,
    pub min_key: K,
    pub max_key: K,
}

pub fn chunk_file_name(id: u64) -> String {
    id.to_string()
}

pub fn parse_chunk_file_name(name: &str) -> Option<u64> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}

fn encode_preamble(count: u32, body_len: u64) -> [u8; CHUNK_PREAMBLE_LEN] {
    let mut buf = [0u8; CHUNK_PREAMBLE_LEN];
    buf[..4].copy_from_slice(CHUNK_MAGIC);
    buf[4..6].copy_from_slice(&CHUNK_FORMAT_VERSION.to_le_bytes());
    buf[6..8].copy_from_slice(&0u16.to_le_bytes());
    buf[8..12].copy_from_slice(&count.to_le_bytes());
    buf[12..20].copy_from_slice(&body_len.to_le_bytes());
    buf
}

fn decode_preamble(buf: &[u8; CHUNK_PREAMBLE_LEN], path: &Path) -> Result<(u32, u64), StoreError> {
    if &buf[..4] != CHUNK_MAGIC {
        return Err(StoreError::protocol(format!(
            "bad chunk magic in {}",
            path.display()
        )));
    }
    let version = u16::from_le_bytes([buf[4], buf[5]]);
    if version != CHUNK_FORMAT_VERSION {
        return Err(StoreError::protocol(format!(
            "unsupported chunk format version {version} in {}",
            path.display()
        )));
    }
    let count = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
    let body_len = u64::from_le_bytes([
        buf[12], buf[13], buf[14], buf[15], buf[16], buf[17], buf[18], buf[19],
    ]);
    Ok((count, body_len))
}

fn encode_bounds<K: CrdtKey>(min: &K, max: &K) -> Result<Vec<u8>, CodecError> {
    let mut buf = Vec::new();
    let mut e = Encoder::new(&mut buf);
    e.array(2)?.encode(min)?.encode(max)?;
    Ok(buf)
}

fn decode_bounds<K: CrdtKey>(bytes: &[u8]) -> Result<(K, K), CodecError> {
    let mut d = Decoder::new(bytes);
    let len = d.array()?.ok_or(CodecError::IndefiniteLength)?;
    if len != 2 {
        return Err(CodecError::BadArity {
            expected: 2,
            got: len,
        });
    }
    let min: K = d.decode()?;
    let max: K = d.decode()?;
    Ok((min, max))
}

/// Streams entries into a temp file; `seal` finalizes it, the returned
/// [`SealedChunk`] commits via atomic rename.
pub struct ChunkWriter<K, S> {
    id: u64,
    tmp_path: PathBuf,
    final_path: PathBuf,
    writer: Option<RecordWriter<BufWriter<File>>>,
    count: u32,
    body_len: u64,
    min_key: Option<K>,
    last_key: Option<K>,
    done: bool,
    _state: PhantomData<fn() -> S>,
}

impl<K: CrdtKey, S: CrdtState> ChunkWriter<K, S> {
    pub fn create(dir: &Path, id: u64, max_entry_bytes: usize) -> Result<Self, StoreError> {
        let final_path = dir.join(chunk_file_name(id));
        let tmp_path = dir.join(format!("{id}.tmp"));
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)
            .map_err(|source| StoreError::io(&tmp_path, source))?;
        file.write_all(&encode_preamble(0, 0))
            .map_err(|source| StoreError::io(&tmp_path, source))?;

        Ok(Self {
            id,
            tmp_path,
            final_path,
            writer: Some(RecordWriter::new(BufWriter::new(file), max_entry_bytes)),
            count: 0,
            body_len: 0,
            min_key: None,
            last_key: None,
            done: false,
            _state: PhantomData,
        })
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn append(&mut self, entry: &CrdtEntry<K, S>) -> Result<(), StoreError> {
        if let Some(last) = &self.last_key {
            if entry.key() <= last {
                return Err(StoreError::protocol(format!(
                    "chunk keys must be strictly ascending, got {:?} after {:?}",
                    entry.key(),
                    last
                )));
            }
        }

        let payload = encode_entry(entry)?;
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| StoreError::protocol("chunk writer already sealed"))?;
        let written = writer
            .append(&payload)
            .map_err(|err| StoreError::from(err))?;

        self.body_len += written as u64;
        self.count += 1;
        if self.min_key.is_none() {
            self.min_key = Some(entry.key().clone());
        }
        self.last_key = Some(entry.key().clone());
        Ok(())
    }

    pub fn seal(mut self, fsync: &FsyncPolicy) -> Result<SealedChunk<K>, StoreError> {
        let writer = self
            .writer
            .take()
            .ok_or_else(|| StoreError::protocol("chunk writer already sealed"))?;
        let (min_key, max_key) = match (self.min_key.take(), self.last_key.take()) {
            (Some(min), Some(max)) => (min, max),
            _ => return Err(StoreError::protocol("refusing to seal an empty chunk")),
        };

        let mut writer = writer;
        let bounds = encode_bounds(&min_key, &max_key).map_err(StoreError::from)?;
        writer.append(&bounds).map_err(StoreError::from)?;

        let buffered = writer.into_inner();
        let mut file = buffered
            .into_inner()
            .map_err(|err| StoreError::io(&self.tmp_path, err.into_error()))?;
        file.seek(SeekFrom::Start(0))
            .map_err(|source| StoreError::io(&self.tmp_path, source))?;
        file.write_all(&encode_preamble(self.count, self.body_len))
            .map_err(|source| StoreError::io(&self.tmp_path, source))?;
        if fsync.uploads {
            file.sync_all()
                .map_err(|source| StoreError::io(&self.tmp_path, source))?;
        }

        self.done = true;
        Ok(SealedChunk {
            meta: ChunkMeta {
                id: self.id,
                count: self.count,
                body_len: self.body_len,
                min_key,
                max_key,
            },
            tmp_path: self.tmp_path.clone(),
            final_path: self.final_path.clone(),
            committed: false,
        })
    }
}

impl<K, S> Drop for ChunkWriter<K, S> {
    fn drop(&mut self) {
        if !self.done {
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}

#[derive(Debug)]
pub struct SealedChunk<K> {
    pub meta: ChunkMeta<K>,
    tmp_path: PathBuf,
    final_path: PathBuf,
    committed: bool,
}

impl<K> SealedChunk<K> {
    /// Atomic rename into place. The chunk becomes durable and visible to
    /// directory scans from here on.
    pub fn commit(mut self, fsync: &FsyncPolicy) -> Result<(ChunkMeta<K>, PathBuf), StoreError>
    where
        K: Clone,
    {
        fs::rename(&self.tmp_path, &self.final_path)
            .map_err(|source| StoreError::io(&self.final_path, source))?;
        if fsync.directories {
            if let Some(dir) = self.final_path.parent() {
                let handle = File::open(dir).map_err(|source| StoreError::io(dir, source))?;
                handle
                    .sync_all()
                    .map_err(|source| StoreError::io(dir, source))?;
            }
        }
        self.committed = true;
        Ok((self.meta.clone(), self.final_path.clone()))
    }
}

impl<K> Drop for SealedChunk<K> {
    fn drop(&mut self) {
        if !self.committed {
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}

pub fn read_meta<K: CrdtKey>(
    path: &Path,
    id: u64,
    max_entry_bytes: usize,
) -> Result<ChunkMeta<K>, StoreError> {
    let mut file = File::open(path).map_err(|source| StoreError::io(path, source))?;
    let mut preamble = [0u8; CHUNK_PREAMBLE_LEN];
    file.read_exact(&mut preamble)
        .map_err(|source| StoreError::io(path, source))?;
    let (count, body_len) = decode_preamble(&preamble, path)?;
    if count == 0 {
        return Err(StoreError::protocol(format!(
            "chunk {} has zero entries",
            path.display()
        )));
    }

    let file_len = file
        .metadata()
        .map_err(|source| StoreError::io(path, source))?
        .len();
    let footer_offset = CHUNK_PREAMBLE_LEN as u64 + body_len;
    if file_len < footer_offset + RECORD_PREFIX_LEN as u64 {
        return Err(StoreError::SizeMismatch {
            expected: footer_offset + RECORD_PREFIX_LEN as u64,
            got: file_len,
        });
    }

    file.seek(SeekFrom::Start(footer_offset))
        .map_err(|source| StoreError::io(path, source))?;
    let mut reader = RecordReader::new(BufReader::new(file), max_entry_bytes);
    let footer = reader
        .read_next()
        .map_err(StoreError::from)?
        .ok_or_else(|| StoreError::protocol(format!("chunk {} missing footer", path.display())))?;
    let (min_key, max_key) = decode_bounds::<K>(&footer)?;

    Ok(ChunkMeta {
        id,
        count,
        body_len,
        min_key,
        max_key,
    })
}

/// Sequential reader over a chunk body.
pub struct ChunkEntries<K, S> {
    path: PathBuf,
    reader: RecordReader<BufReader<File>>,
    remaining_bytes: u64,
    failed: bool,
    _marker: PhantomData<fn() -> (K, S)>,
}

pub fn open_entries<K: CrdtKey, S: CrdtState>(
    path: &Path,
    max_entry_bytes: usize,
) -> Result<ChunkEntries<K, S>, StoreError> {
    let mut file = File::open(path).map_err(|source| StoreError::io(path, source))?;
    let mut preamble = [0u8; CHUNK_PREAMBLE_LEN];
    file.read_exact(&mut preamble)
        .map_err(|source| StoreError::io(path, source))?;
    let (_count, body_len) = decode_preamble(&preamble, path)?;

    Ok(ChunkEntries {
        path: path.to_path_buf(),
        reader: RecordReader::new(BufReader::new(file), max_entry_bytes),
        remaining_bytes: body_len,
        failed: false,
        _marker: PhantomData,
    })
}

impl<K: CrdtKey, S: CrdtState> Iterator for ChunkEntries<K, S> {
    type Item = Result<CrdtEntry<K, S>, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.remaining_bytes == 0 {
            return None;
        }
        let payload = match self.reader.read_next() {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                self.failed = true;
                return Some(Err(StoreError::SizeMismatch {
                    expected: self.remaining_bytes,
                    got: 0,
                }));
            }
            Err(err) => {
                self.failed = true;
                return Some(Err(StoreError::protocol(format!(
                    "corrupt chunk {}: {err}",
                    self.path.display()
                ))));
            }
        };

        let record_len = (RECORD_PREFIX_LEN + payload.len()) as u64;
        self.remaining_bytes = self.remaining_bytes.saturating_sub(record_len);

        match decode_entry::<K, S>(&payload) {
            Ok(entry) => Some(Ok(entry)),
            Err(err) => {
                self.failed = true;
                Some(Err(err.into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CrdtData, CrdtTombstone};
    use tempfile::TempDir;

    fn fsync_off() -> FsyncPolicy {
        FsyncPolicy {
            uploads: false,
            directories: false,
            appends: false,
        }
    }

    fn entry(key: u64, ts: u64) -> CrdtEntry<u64, String> {
        CrdtEntry::Data(CrdtData::new(key, ts, format!("v{key}")))
    }

    #[test]
    fn write_seal_commit_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let mut writer = ChunkWriter::<u64, String>::create(dir.path(), 7, 1 << 20).unwrap();
        writer.append(&entry(1, 10)).unwrap();
        writer.append(&entry(2, 10)).unwrap();
        writer
            .append(&CrdtEntry::Tombstone(CrdtTombstone::new(3, 4)))
            .unwrap();

        let sealed = writer.seal(&fsync_off()).unwrap();
        let (meta, path) = sealed.commit(&fsync_off()).unwrap();
        assert_eq!(meta.count, 3);
        assert_eq!(meta.min_key, 1);
        assert_eq!(meta.max_key, 3);

        let read_back = read_meta::<u64>(&path, 7, 1 << 20).unwrap();
        assert_eq!(read_back, meta);

        let entries: Vec<_> = open_entries::<u64, String>(&path, 1 << 20)
            .unwrap()
            .map(Result::unwrap)
            .collect();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0], entry(1, 10));
        assert_eq!(
            entries[2],
            CrdtEntry::Tombstone(CrdtTombstone::new(3, 4))
        );
    }

    #[test]
    fn non_ascending_keys_rejected() {
        let dir = TempDir::new().unwrap();
        let mut writer = ChunkWriter::<u64, String>::create(dir.path(), 1, 1 << 20).unwrap();
        writer.append(&entry(5, 1)).unwrap();
        let err = writer.append(&entry(5, 2)).unwrap_err();
        assert!(matches!(err, StoreError::Protocol { .. }));
        let err = writer.append(&entry(4, 2)).unwrap_err();
        assert!(matches!(err, StoreError::Protocol { .. }));
    }

    #[test]
    fn dropped_writer_removes_temp_file() {
        let dir = TempDir::new().unwrap();
        {
            let mut writer = ChunkWriter::<u64, String>::create(dir.path(), 2, 1 << 20).unwrap();
            writer.append(&entry(1, 1)).unwrap();
        }
        assert!(!dir.path().join("2.tmp").exists());
        assert!(!dir.path().join("2").exists());
    }

    #[test]
    fn sealed_but_uncommitted_chunk_is_discarded() {
        let dir = TempDir::new().unwrap();
        {
            let mut writer = ChunkWriter::<u64, String>::create(dir.path(), 3, 1 << 20).unwrap();
            writer.append(&entry(1, 1)).unwrap();
            let _sealed = writer.seal(&fsync_off()).unwrap();
        }
        assert!(!dir.path().join("3.tmp").exists());
        assert!(!dir.path().join("3").exists());
    }

    #[test]
    fn empty_chunk_refuses_to_seal() {
        let dir = TempDir::new().unwrap();
        let writer = ChunkWriter::<u64, String>::create(dir.path(), 4, 1 << 20).unwrap();
        let err = writer.seal(&fsync_off()).unwrap_err();
        assert!(matches!(err, StoreError::Protocol { .. }));
    }

    #[test]
    fn rewriting_read_entries_is_byte_identical() {
        let dir = TempDir::new().unwrap();
        let mut writer = ChunkWriter::<u64, String>::create(dir.path(), 10, 1 << 20).unwrap();
        for key in 0..50u64 {
            writer.append(&entry(key, key + 1)).unwrap();
        }
        let (_, first_path) = writer
            .seal(&fsync_off())
            .unwrap()
            .commit(&fsync_off())
            .unwrap();

        let mut rewriter = ChunkWriter::<u64, String>::create(dir.path(), 11, 1 << 20).unwrap();
        for item in open_entries::<u64, String>(&first_path, 1 << 20).unwrap() {
            rewriter.append(&item.unwrap()).unwrap();
        }
        let (_, second_path) = rewriter
            .seal(&fsync_off())
            .unwrap()
            .commit(&fsync_off())
            .unwrap();

        assert_eq!(
            fs::read(&first_path).unwrap(),
            fs::read(&second_path).unwrap()
        );
    }

    #[test]
    fn chunk_name_parsing() {
        assert_eq!(parse_chunk_file_name("42"), Some(42));
        assert_eq!(parse_chunk_file_name("42.tmp"), None);
        assert_eq!(parse_chunk_file_name(""), None);
        assert_eq!(parse_chunk_file_name("abc"), None);
    }
}
