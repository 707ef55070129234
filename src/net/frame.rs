//! Wire framing: `varuint32 length || payload`.
//!
//! A zero-length frame terminates a bulk entry stream; control messages
//! are never empty.

use std::io::{Read, Write};

use crate::storage::StoreError;

const MAX_VARU32_BYTES: usize = 5;

pub fn encode_varu32(buf: &mut Vec<u8>, mut value: u32) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

pub struct MessageReader<R> {
    reader: R,
    max_frame_bytes: usize,
}

impl<R: Read> MessageReader<R> {
    pub fn new(reader: R, max_frame_bytes: usize) -> Self {
        Self {
            reader,
            max_frame_bytes,
        }
    }

    fn read_byte(&mut self) -> Result<Option<u8>, StoreError> {
        let mut byte = [0u8; 1];
        loop {
            match self.reader.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(byte[0])),
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(StoreError::Io {
                    path: None,
                    source: err,
                }),
            }
        }
    }

    /// `Ok(None)` is a clean peer close before the next frame;
    /// `Ok(Some(vec![]))` is an end-of-stream marker.
    pub fn read_frame(&mut self) -> Result<Option<Vec<u8>>, StoreError> {
        let mut length = 0u32;
        let mut shift = 0u32;
        for i in 0..=MAX_VARU32_BYTES {
            if i == MAX_VARU32_BYTES {
                return Err(StoreError::protocol("frame length varint too long"));
            }
            let byte = match self.read_byte()? {
                Some(byte) => byte,
                None if i == 0 => return Ok(None),
                None => return Err(StoreError::protocol("truncated frame length")),
            };
            let bits = (byte & 0x7f) as u32;
            if shift == 28 && bits > 0x0f {
                return Err(StoreError::protocol("frame length varint overflow"));
            }
            length |= bits << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }

        let length = length as usize;
        if length > self.max_frame_bytes {
            return Err(StoreError::protocol(format!(
                "frame of {length} bytes exceeds packet size {}",
                self.max_frame_bytes
            )));
        }
        let mut payload = vec![0u8; length];
        self.reader
            .read_exact(&mut payload)
            .map_err(|source| StoreError::Io { path: None, source })?;
        Ok(Some(payload))
    }
}

pub struct MessageWriter<W> {
    writer: W,
    max_frame_bytes: usize,
}

impl<W: Write> MessageWriter<W> {
    pub fn new(writer: W, max_frame_bytes: usize) -> Self {
        Self {
            writer,
            max_frame_bytes,
        }
    }

    pub fn write_frame(&mut self, payload: &[u8]) -> Result<(), StoreError> {
        if payload.len() > self.max_frame_bytes {
            return Err(StoreError::protocol(format!(
                "refusing to send frame of {} bytes over packet size {}",
                payload.len(),
                self.max_frame_bytes
            )));
        }
        let mut header = Vec::with_capacity(MAX_VARU32_BYTES);
        encode_varu32(&mut header, payload.len() as u32);
        self.writer
            .write_all(&header)
            .map_err(|source| StoreError::Io { path: None, source })?;
        self.writer
            .write_all(payload)
            .map_err(|source| StoreError::Io { path: None, source })?;
        Ok(())
    }

    /// The end-of-stream marker for bulk entry streams.
    pub fn write_end_of_stream(&mut self) -> Result<(), StoreError> {
        self.write_frame(&[])
    }

    pub fn flush(&mut self) -> Result<(), StoreError> {
        self.writer
            .flush()
            .map_err(|source| StoreError::Io { path: None, source })
    }
}
