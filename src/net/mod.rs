//! Wire protocol: framing, message schemas, server and client.

pub mod client;
pub mod frame;
pub mod proto;
pub mod server;

pub use client::{RemoteCrdtStorage, RemoteStorageConfig};
pub use proto::{CrdtRequest, CrdtResponse, HandshakeFailure, Version, PROTOCOL_VERSION};
pub use server::{CrdtServer, CrdtServerConfig, CrdtServerHandle};
