//! Wire client: a `CrdtStore` backed by a remote node.
//!
//! One connection per operation: connect, handshake, run the request
//! state machine, close.

use std::io::{BufReader, BufWriter};
use std::marker::PhantomData;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::core::{decode_entry, encode_data, encode_entry, CrdtData, CrdtEntry, CrdtKey, CrdtState, CrdtTombstone};
use crate::storage::{CrdtStore, DataStream, RemoveSink, StoreError, TakeSession, UploadSink};

use super::frame::{MessageReader, MessageWriter};
use super::proto::{
    decode_response, encode_request, CrdtRequest, CrdtResponse, PROTOCOL_VERSION,
};

#[derive(Clone, Debug)]
pub struct RemoteStorageConfig {
    pub connect_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl Default for RemoteStorageConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            max_frame_bytes: 1 << 24,
        }
    }
}

pub struct RemoteCrdtStorage<K, S> {
    addr: String,
    config: RemoteStorageConfig,
    _marker: PhantomData<fn() -> (K, S)>,
}

impl<K, S> Clone for RemoteCrdtStorage<K, S> {
    fn clone(&self) -> Self {
        Self {
            addr: self.addr.clone(),
            config: self.config.clone(),
            _marker: PhantomData,
        }
    }
}

struct Connection {
    reader: MessageReader<BufReader<TcpStream>>,
    writer: MessageWriter<BufWriter<TcpStream>>,
}

impl Connection {
    fn send(&mut self, request: &CrdtRequest) -> Result<(), StoreError> {
        let payload = encode_request(request)?;
        self.writer.write_frame(&payload)?;
        self.writer.flush()
    }

    fn read_response(&mut self) -> Result<CrdtResponse, StoreError> {
        let frame = self
            .reader
            .read_frame()?
            .ok_or_else(|| StoreError::protocol("connection closed awaiting response"))?;
        Ok(decode_response(&frame)?)
    }

    fn expect(&mut self, expected: &CrdtResponse) -> Result<(), StoreError> {
        match self.read_response()? {
            ref response if response == expected => Ok(()),
            CrdtResponse::ServerError { message } => Err(StoreError::Remote { message }),
            other => Err(StoreError::protocol(format!(
                "expected {expected:?}, got {other:?}"
            ))),
        }
    }
}

impl<K: CrdtKey, S: CrdtState> RemoteCrdtStorage<K, S> {
    pub fn new(addr: impl Into<String>, config: RemoteStorageConfig) -> Self {
        Self {
            addr: addr.into(),
            config,
            _marker: PhantomData,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        let addrs: Vec<SocketAddr> = self
            .addr
            .to_socket_addrs()
            .map_err(|source| StoreError::Io { path: None, source })?
            .collect();
        let addr = addrs.first().ok_or_else(|| StoreError::NotFound {
            what: format!("address {}", self.addr),
        })?;
        let stream = TcpStream::connect_timeout(addr, self.config.connect_timeout)
            .map_err(|source| StoreError::Io { path: None, source })?;
        let read_half = stream
            .try_clone()
            .map_err(|source| StoreError::Io { path: None, source })?;

        let mut connection = Connection {
            reader: MessageReader::new(BufReader::new(read_half), self.config.max_frame_bytes),
            writer: MessageWriter::new(BufWriter::new(stream), self.config.max_frame_bytes),
        };

        connection.send(&CrdtRequest::Handshake {
            version: PROTOCOL_VERSION,
        })?;
        match connection.read_response()? {
            CrdtResponse::Handshake { failure: None } => Ok(connection),
            CrdtResponse::Handshake {
                failure: Some(failure),
            } => Err(StoreError::Handshake {
                message: format!(
                    "server requires at least {}: {}",
                    failure.minimal_version, failure.message
                ),
            }),
            CrdtResponse::ServerError { message } => Err(StoreError::Remote { message }),
            other => Err(StoreError::protocol(format!(
                "expected handshake response, got {other:?}"
            ))),
        }
    }
}

impl<K: CrdtKey, S: CrdtState> CrdtStore<K, S> for RemoteCrdtStorage<K, S> {
    fn upload(&self) -> Result<Box<dyn UploadSink<K, S>>, StoreError> {
        let mut connection = self.connect()?;
        connection.send(&CrdtRequest::Upload)?;
        Ok(Box::new(RemoteUploadSink {
            connection,
            _marker: PhantomData::<fn() -> (K, S)>,
        }))
    }

    fn download(&self, since: u64) -> Result<DataStream<K, S>, StoreError> {
        let mut connection = self.connect()?;
        connection.send(&CrdtRequest::Download { since })?;
        connection.expect(&CrdtResponse::DownloadStarted)?;
        Ok(Box::new(RemoteDataStream::<K, S> {
            connection,
            done: false,
            _marker: PhantomData,
        }))
    }

    fn take(&self) -> Result<Box<dyn TakeSession<K, S>>, StoreError> {
        let mut connection = self.connect()?;
        connection.send(&CrdtRequest::Take)?;
        connection.expect(&CrdtResponse::TakeStarted)?;
        Ok(Box::new(RemoteTakeSession {
            stream: RemoteDataStream::<K, S> {
                connection,
                done: false,
                _marker: PhantomData,
            },
        }))
    }

    fn remove(&self) -> Result<Box<dyn RemoveSink<K>>, StoreError> {
        let mut connection = self.connect()?;
        connection.send(&CrdtRequest::Remove)?;
        Ok(Box::new(RemoteRemoveSink::<K, S> {
            connection,
            _marker: PhantomData,
        }))
    }

    fn ping(&self) -> Result<(), StoreError> {
        let mut connection = self.connect()?;
        connection.send(&CrdtRequest::Ping)?;
        connection.expect(&CrdtResponse::Pong)
    }
}

struct RemoteUploadSink<K, S> {
    connection: Connection,
    _marker: PhantomData<fn() -> (K, S)>,
}

impl<K: CrdtKey, S: CrdtState> UploadSink<K, S> for RemoteUploadSink<K, S> {
    fn push(&mut self, data: CrdtData<K, S>) -> Result<(), StoreError> {
        let payload = encode_data(&data)?;
        self.connection.writer.write_frame(&payload)
    }

    fn close(mut self: Box<Self>) -> Result<(), StoreError> {
        self.connection.writer.write_end_of_stream()?;
        self.connection.writer.flush()?;
        self.connection.expect(&CrdtResponse::UploadAck)
    }
}

struct RemoteRemoveSink<K, S> {
    connection: Connection,
    _marker: PhantomData<fn() -> (K, S)>,
}

impl<K: CrdtKey, S: CrdtState> RemoveSink<K> for RemoteRemoveSink<K, S> {
    fn push(&mut self, tombstone: CrdtTombstone<K>) -> Result<(), StoreError> {
        let payload = encode_entry::<K, S>(&CrdtEntry::Tombstone(tombstone))?;
        self.connection.writer.write_frame(&payload)
    }

    fn close(mut self: Box<Self>) -> Result<(), StoreError> {
        self.connection.writer.write_end_of_stream()?;
        self.connection.writer.flush()?;
        self.connection.expect(&CrdtResponse::RemoveAck)
    }
}

struct RemoteDataStream<K, S> {
    connection: Connection,
    done: bool,
    _marker: PhantomData<fn() -> (K, S)>,
}

impl<K: CrdtKey, S: CrdtState> RemoteDataStream<K, S> {
    fn next_data(&mut self) -> Result<Option<CrdtData<K, S>>, StoreError> {
        if self.done {
            return Ok(None);
        }
        let frame = self
            .connection
            .reader
            .read_frame()?
            .ok_or_else(|| StoreError::protocol("stream ended without end-of-stream"))?;
        if frame.is_empty() {
            self.done = true;
            return Ok(None);
        }
        match decode_entry::<K, S>(&frame) {
            Ok(CrdtEntry::Data(data)) => Ok(Some(data)),
            Ok(CrdtEntry::Tombstone(_)) => {
                Err(StoreError::protocol("tombstone in download stream"))
            }
            Err(entry_err) => {
                // The server may abort a started stream with a control
                // frame carrying the error.
                match decode_response(&frame) {
                    Ok(CrdtResponse::ServerError { message }) => {
                        Err(StoreError::Remote { message })
                    }
                    _ => Err(entry_err.into()),
                }
            }
        }
    }
}

impl<K: CrdtKey, S: CrdtState> Iterator for RemoteDataStream<K, S> {
    type Item = Result<CrdtData<K, S>, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_data() {
            Ok(Some(data)) => Some(Ok(data)),
            Ok(None) => None,
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

struct RemoteTakeSession<K, S> {
    stream: RemoteDataStream<K, S>,
}

impl<K: CrdtKey, S: CrdtState> TakeSession<K, S> for RemoteTakeSession<K, S> {
    fn next(&mut self) -> Option<Result<CrdtData<K, S>, StoreError>> {
        self.stream.next()
    }

    fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        // The server commits only after the whole stream and the explicit
        // ack, so drain any remainder first.
        while let Some(item) = self.stream.next() {
            item?;
        }
        self.stream.connection.send(&CrdtRequest::TakeAck)
    }
}
