//! Wire server: accept loop and per-connection request handling.

use std::io::{BufReader, BufWriter};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::core::{decode_entry, encode_data, CrdtEntry, CrdtKey, CrdtState};
use crate::storage::{CrdtStore, StoreError};

use super::frame::{MessageReader, MessageWriter};
use super::proto::{
    decode_request, encode_response, CrdtRequest, CrdtResponse, HandshakeFailure,
    PROTOCOL_VERSION,
};

#[derive(Clone, Debug)]
pub struct CrdtServerConfig {
    pub listen_addr: String,
    /// Upper bound for one wire frame (`net.packet_size`).
    pub max_frame_bytes: usize,
    pub max_connections: usize,
}

impl Default for CrdtServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:0".to_string(),
            max_frame_bytes: 1 << 24,
            max_connections: 256,
        }
    }
}

pub struct CrdtServer<K, S> {
    storage: Arc<dyn CrdtStore<K, S>>,
    config: CrdtServerConfig,
}

pub struct CrdtServerHandle {
    shutdown: Arc<AtomicBool>,
    join: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl CrdtServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.join.join();
    }

    /// Block until the accept loop ends (a shutdown from another handle
    /// clone or process teardown).
    pub fn wait(self) {
        let _ = self.join.join();
    }
}

impl<K: CrdtKey, S: CrdtState> CrdtServer<K, S> {
    pub fn new(storage: Arc<dyn CrdtStore<K, S>>, config: CrdtServerConfig) -> Self {
        Self { storage, config }
    }

    pub fn start(self) -> Result<CrdtServerHandle, StoreError> {
        let listener = TcpListener::bind(&self.config.listen_addr)
            .map_err(|source| StoreError::Io { path: None, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| StoreError::Io { path: None, source })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| StoreError::Io { path: None, source })?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let runtime = ServerRuntime {
            storage: self.storage,
            config: self.config,
            shutdown: Arc::clone(&shutdown),
            active_connections: Arc::new(AtomicUsize::new(0)),
        };
        tracing::info!(addr = %local_addr, "crdt server listening");
        let join = thread::spawn(move || run_accept_loop(listener, runtime));

        Ok(CrdtServerHandle {
            shutdown,
            join,
            local_addr,
        })
    }
}

struct ServerRuntime<K, S> {
    storage: Arc<dyn CrdtStore<K, S>>,
    config: CrdtServerConfig,
    shutdown: Arc<AtomicBool>,
    active_connections: Arc<AtomicUsize>,
}

fn run_accept_loop<K: CrdtKey, S: CrdtState>(listener: TcpListener, runtime: ServerRuntime<K, S>) {
    loop {
        if runtime.shutdown.load(Ordering::Relaxed) {
            break;
        }
        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(25));
                continue;
            }
            Err(err) => {
                tracing::warn!("accept failed: {}", err);
                thread::sleep(Duration::from_millis(100));
                continue;
            }
        };

        let active = runtime.active_connections.fetch_add(1, Ordering::SeqCst);
        if active >= runtime.config.max_connections {
            runtime.active_connections.fetch_sub(1, Ordering::SeqCst);
            tracing::warn!(%peer, "rejecting connection, server at capacity");
            drop(stream);
            continue;
        }

        if stream.set_nonblocking(false).is_err() {
            runtime.active_connections.fetch_sub(1, Ordering::SeqCst);
            continue;
        }

        let storage = Arc::clone(&runtime.storage);
        let config = runtime.config.clone();
        let counter = Arc::clone(&runtime.active_connections);
        thread::spawn(move || {
            if let Err(err) = serve_connection(stream, storage, &config) {
                tracing::debug!(%peer, "connection ended with error: {}", err);
            }
            counter.fetch_sub(1, Ordering::SeqCst);
        });
    }
}

fn serve_connection<K: CrdtKey, S: CrdtState>(
    stream: TcpStream,
    storage: Arc<dyn CrdtStore<K, S>>,
    config: &CrdtServerConfig,
) -> Result<(), StoreError> {
    let read_half = stream
        .try_clone()
        .map_err(|source| StoreError::Io { path: None, source })?;
    let mut reader = MessageReader::new(BufReader::new(read_half), config.max_frame_bytes);
    let mut writer = MessageWriter::new(BufWriter::new(stream), config.max_frame_bytes);

    match handle_session(&mut reader, &mut writer, storage) {
        Ok(()) => Ok(()),
        Err(err) => {
            // Best effort: tell the peer why before dropping the
            // connection. Peers mid-bulk-stream surface it as an early
            // stream termination.
            let response = CrdtResponse::ServerError {
                message: err.to_string(),
            };
            if let Ok(payload) = encode_response(&response) {
                let _ = writer.write_frame(&payload);
                let _ = writer.flush();
            }
            Err(err)
        }
    }
}

fn send<W: std::io::Write>(
    writer: &mut MessageWriter<W>,
    response: &CrdtResponse,
) -> Result<(), StoreError> {
    let payload = encode_response(response)?;
    writer.write_frame(&payload)?;
    writer.flush()
}

fn handle_session<R, W, K, S>(
    reader: &mut MessageReader<R>,
    writer: &mut MessageWriter<W>,
    storage: Arc<dyn CrdtStore<K, S>>,
) -> Result<(), StoreError>
where
    R: std::io::Read,
    W: std::io::Write,
    K: CrdtKey,
    S: CrdtState,
{
    let first = reader
        .read_frame()?
        .ok_or_else(|| StoreError::protocol("connection closed before handshake"))?;
    let CrdtRequest::Handshake { version } = decode_request(&first)? else {
        return Err(StoreError::protocol("handshake expected"));
    };
    if version.major != PROTOCOL_VERSION.major {
        send(
            writer,
            &CrdtResponse::Handshake {
                failure: Some(HandshakeFailure {
                    minimal_version: PROTOCOL_VERSION,
                    message: format!(
                        "unsupported protocol version {version}, server speaks {PROTOCOL_VERSION}"
                    ),
                }),
            },
        )?;
        return Ok(());
    }
    send(writer, &CrdtResponse::Handshake { failure: None })?;

    let Some(frame) = reader.read_frame()? else {
        // Handshake-only connection; the peer just probed us.
        return Ok(());
    };
    match decode_request(&frame)? {
        CrdtRequest::Upload => handle_upload(reader, writer, storage),
        CrdtRequest::Download { since } => handle_download(writer, storage, since),
        CrdtRequest::Take => handle_take(reader, writer, storage),
        CrdtRequest::Remove => handle_remove(reader, writer, storage),
        CrdtRequest::Ping => {
            storage.ping()?;
            send(writer, &CrdtResponse::Pong)
        }
        CrdtRequest::Handshake { .. } => {
            Err(StoreError::protocol("handshake already performed"))
        }
        CrdtRequest::TakeAck => Err(StoreError::protocol("unexpected take-ack")),
    }
}

fn handle_upload<R, W, K, S>(
    reader: &mut MessageReader<R>,
    writer: &mut MessageWriter<W>,
    storage: Arc<dyn CrdtStore<K, S>>,
) -> Result<(), StoreError>
where
    R: std::io::Read,
    W: std::io::Write,
    K: CrdtKey,
    S: CrdtState,
{
    let mut sink = storage.upload()?;
    loop {
        let frame = reader
            .read_frame()?
            .ok_or_else(|| StoreError::protocol("upload stream ended without end-of-stream"))?;
        if frame.is_empty() {
            break;
        }
        match decode_entry::<K, S>(&frame)? {
            CrdtEntry::Data(data) => sink.push(data)?,
            CrdtEntry::Tombstone(_) => {
                return Err(StoreError::protocol("tombstone in upload stream"))
            }
        }
    }
    sink.close()?;
    send(writer, &CrdtResponse::UploadAck)
}

fn handle_remove<R, W, K, S>(
    reader: &mut MessageReader<R>,
    writer: &mut MessageWriter<W>,
    storage: Arc<dyn CrdtStore<K, S>>,
) -> Result<(), StoreError>
where
    R: std::io::Read,
    W: std::io::Write,
    K: CrdtKey,
    S: CrdtState,
{
    let mut sink = storage.remove()?;
    loop {
        let frame = reader
            .read_frame()?
            .ok_or_else(|| StoreError::protocol("remove stream ended without end-of-stream"))?;
        if frame.is_empty() {
            break;
        }
        match decode_entry::<K, S>(&frame)? {
            CrdtEntry::Tombstone(tombstone) => sink.push(tombstone)?,
            CrdtEntry::Data(_) => {
                return Err(StoreError::protocol("data entry in remove stream"))
            }
        }
    }
    sink.close()?;
    send(writer, &CrdtResponse::RemoveAck)
}

fn handle_download<W, K, S>(
    writer: &mut MessageWriter<W>,
    storage: Arc<dyn CrdtStore<K, S>>,
    since: u64,
) -> Result<(), StoreError>
where
    W: std::io::Write,
    K: CrdtKey,
    S: CrdtState,
{
    let stream = storage.download(since)?;
    send(writer, &CrdtResponse::DownloadStarted)?;
    for item in stream {
        let data = item?;
        let payload = encode_data(&data)?;
        writer.write_frame(&payload)?;
    }
    writer.write_end_of_stream()?;
    writer.flush()
}

fn handle_take<R, W, K, S>(
    reader: &mut MessageReader<R>,
    writer: &mut MessageWriter<W>,
    storage: Arc<dyn CrdtStore<K, S>>,
) -> Result<(), StoreError>
where
    R: std::io::Read,
    W: std::io::Write,
    K: CrdtKey,
    S: CrdtState,
{
    let mut session = storage.take()?;
    send(writer, &CrdtResponse::TakeStarted)?;
    while let Some(item) = session.next() {
        let data = item?;
        let payload = encode_data(&data)?;
        writer.write_frame(&payload)?;
    }
    writer.write_end_of_stream()?;
    writer.flush()?;

    // Only an explicit ack commits the deletion half of the take; a
    // connection drop leaves the data in place.
    let frame = reader
        .read_frame()?
        .ok_or_else(|| StoreError::protocol("connection closed before take-ack"))?;
    match decode_request(&frame)? {
        CrdtRequest::TakeAck => session.commit(),
        other => Err(StoreError::protocol(format!(
            "expected take-ack, got {other:?}"
        ))),
    }
}
