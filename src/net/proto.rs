//! Control message schemas and their CBOR encoding.
//!
//! Every control message is a CBOR array `[type-string, body-array]`.
//! Unknown types, wrong arities and trailing bytes are protocol errors;
//! forward compatibility lives in the handshake version, not in lenient
//! parsing.

use std::convert::Infallible;
use std::fmt;

use minicbor::{Decoder, Encoder};
use thiserror::Error;

use crate::storage::StoreError;

pub const PROTOCOL_VERSION: Version = Version { major: 1, minor: 0 };

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

impl Version {
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CrdtRequest {
    Handshake { version: Version },
    Upload,
    Download { since: u64 },
    Take,
    TakeAck,
    Remove,
    Ping,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeFailure {
    pub minimal_version: Version,
    pub message: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CrdtResponse {
    Handshake { failure: Option<HandshakeFailure> },
    UploadAck,
    DownloadStarted,
    TakeStarted,
    RemoveAck,
    Pong,
    ServerError { message: String },
}

#[derive(Debug, Error)]
pub enum ProtoEncodeError {
    #[error("cbor encode: {0}")]
    Cbor(#[from] minicbor::encode::Error<Infallible>),
}

#[derive(Debug, Error)]
pub enum ProtoDecodeError {
    #[error("cbor decode: {0}")]
    Cbor(#[from] minicbor::decode::Error),
    #[error("indefinite-length CBOR not allowed")]
    IndefiniteLength,
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
    #[error("message body has {got} elements, expected {expected}")]
    BadArity { expected: u64, got: u64 },
    #[error("trailing bytes after message body")]
    TrailingBytes,
}

impl From<ProtoEncodeError> for StoreError {
    fn from(err: ProtoEncodeError) -> Self {
        StoreError::protocol(err.to_string())
    }
}

impl From<ProtoDecodeError> for StoreError {
    fn from(err: ProtoDecodeError) -> Self {
        StoreError::protocol(err.to_string())
    }
}

fn message(tag: &str, arity: u64) -> Result<Vec<u8>, ProtoEncodeError> {
    let mut buf = Vec::new();
    let mut e = Encoder::new(&mut buf);
    e.array(2)?.str(tag)?.array(arity)?;
    Ok(buf)
}

pub fn encode_request(request: &CrdtRequest) -> Result<Vec<u8>, ProtoEncodeError> {
    match request {
        CrdtRequest::Handshake { version } => {
            let mut buf = message("HANDSHAKE", 2)?;
            let mut e = Encoder::new(&mut buf);
            e.u32(version.major)?.u32(version.minor)?;
            Ok(buf)
        }
        CrdtRequest::Upload => message("UPLOAD", 0),
        CrdtRequest::Download { since } => {
            let mut buf = message("DOWNLOAD", 1)?;
            let mut e = Encoder::new(&mut buf);
            e.u64(*since)?;
            Ok(buf)
        }
        CrdtRequest::Take => message("TAKE", 0),
        CrdtRequest::TakeAck => message("TAKE_ACK", 0),
        CrdtRequest::Remove => message("REMOVE", 0),
        CrdtRequest::Ping => message("PING", 0),
    }
}

pub fn encode_response(response: &CrdtResponse) -> Result<Vec<u8>, ProtoEncodeError> {
    match response {
        CrdtResponse::Handshake { failure } => {
            let mut buf = Vec::new();
            let mut e = Encoder::new(&mut buf);
            e.array(2)?.str("HANDSHAKE")?;
            match failure {
                None => {
                    e.array(1)?.null()?;
                }
                Some(failure) => {
                    e.array(1)?
                        .array(3)?
                        .u32(failure.minimal_version.major)?
                        .u32(failure.minimal_version.minor)?
                        .str(&failure.message)?;
                }
            }
            Ok(buf)
        }
        CrdtResponse::UploadAck => message("UPLOAD_ACK", 0),
        CrdtResponse::DownloadStarted => message("DOWNLOAD_STARTED", 0),
        CrdtResponse::TakeStarted => message("TAKE_STARTED", 0),
        CrdtResponse::RemoveAck => message("REMOVE_ACK", 0),
        CrdtResponse::Pong => message("PONG", 0),
        CrdtResponse::ServerError { message: text } => {
            let mut buf = message("SERVER_ERROR", 1)?;
            let mut e = Encoder::new(&mut buf);
            e.str(text)?;
            Ok(buf)
        }
    }
}

struct MessageDecoder<'b> {
    decoder: Decoder<'b>,
    len: usize,
    body_arity: u64,
}

fn open_message<'b>(bytes: &'b [u8]) -> Result<(String, MessageDecoder<'b>), ProtoDecodeError> {
    let mut d = Decoder::new(bytes);
    let outer = d.array()?.ok_or(ProtoDecodeError::IndefiniteLength)?;
    if outer != 2 {
        return Err(ProtoDecodeError::BadArity {
            expected: 2,
            got: outer,
        });
    }
    let tag = d.str()?.to_string();
    let body_arity = d.array()?.ok_or(ProtoDecodeError::IndefiniteLength)?;
    Ok((
        tag,
        MessageDecoder {
            decoder: d,
            len: bytes.len(),
            body_arity,
        },
    ))
}

impl<'b> MessageDecoder<'b> {
    fn expect_arity(&self, expected: u64) -> Result<(), ProtoDecodeError> {
        if self.body_arity != expected {
            return Err(ProtoDecodeError::BadArity {
                expected,
                got: self.body_arity,
            });
        }
        Ok(())
    }

    fn finish(self) -> Result<(), ProtoDecodeError> {
        if self.decoder.position() != self.len {
            return Err(ProtoDecodeError::TrailingBytes);
        }
        Ok(())
    }
}

pub fn decode_request(bytes: &[u8]) -> Result<CrdtRequest, ProtoDecodeError> {
    let (tag, mut msg) = open_message(bytes)?;
    let request = match tag.as_str() {
        "HANDSHAKE" => {
            msg.expect_arity(2)?;
            let major = msg.decoder.u32()?;
            let minor = msg.decoder.u32()?;
            CrdtRequest::Handshake {
                version: Version::new(major, minor),
            }
        }
        "UPLOAD" => {
            msg.expect_arity(0)?;
            CrdtRequest::Upload
        }
        "DOWNLOAD" => {
            msg.expect_arity(1)?;
            let since = msg.decoder.u64()?;
            CrdtRequest::Download { since }
        }
        "TAKE" => {
            msg.expect_arity(0)?;
            CrdtRequest::Take
        }
        "TAKE_ACK" => {
            msg.expect_arity(0)?;
            CrdtRequest::TakeAck
        }
        "REMOVE" => {
            msg.expect_arity(0)?;
            CrdtRequest::Remove
        }
        "PING" => {
            msg.expect_arity(0)?;
            CrdtRequest::Ping
        }
        other => return Err(ProtoDecodeError::UnknownMessageType(other.to_string())),
    };
    msg.finish()?;
    Ok(request)
}

pub fn decode_response(bytes: &[u8]) -> Result<CrdtResponse, ProtoDecodeError> {
    let (tag, mut msg) = open_message(bytes)?;
    let response = match tag.as_str() {
        "HANDSHAKE" => {
            msg.expect_arity(1)?;
            let failure = match msg.decoder.datatype()? {
                minicbor::data::Type::Null => {
                    msg.decoder.null()?;
                    None
                }
                _ => {
                    let inner = msg
                        .decoder
                        .array()?
                        .ok_or(ProtoDecodeError::IndefiniteLength)?;
                    if inner != 3 {
                        return Err(ProtoDecodeError::BadArity {
                            expected: 3,
                            got: inner,
                        });
                    }
                    let major = msg.decoder.u32()?;
                    let minor = msg.decoder.u32()?;
                    let text = msg.decoder.str()?.to_string();
                    Some(HandshakeFailure {
                        minimal_version: Version::new(major, minor),
                        message: text,
                    })
                }
            };
            CrdtResponse::Handshake { failure }
        }
        "UPLOAD_ACK" => {
            msg.expect_arity(0)?;
            CrdtResponse::UploadAck
        }
        "DOWNLOAD_STARTED" => {
            msg.expect_arity(0)?;
            CrdtResponse::DownloadStarted
        }
        "TAKE_STARTED" => {
            msg.expect_arity(0)?;
            CrdtResponse::TakeStarted
        }
        "REMOVE_ACK" => {
            msg.expect_arity(0)?;
            CrdtResponse::RemoveAck
        }
        "PONG" => {
            msg.expect_arity(0)?;
            CrdtResponse::Pong
        }
        "SERVER_ERROR" => {
            msg.expect_arity(1)?;
            let text = msg.decoder.str()?.to_string();
            CrdtResponse::ServerError { message: text }
        }
        other => return Err(ProtoDecodeError::UnknownMessageType(other.to_string())),
    };
    msg.finish()?;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_roundtrip() {
        let requests = [
            CrdtRequest::Handshake {
                version: Version::new(1, 0),
            },
            CrdtRequest::Upload,
            CrdtRequest::Download { since: 12345 },
            CrdtRequest::Take,
            CrdtRequest::TakeAck,
            CrdtRequest::Remove,
            CrdtRequest::Ping,
        ];
        for request in requests {
            let bytes = encode_request(&request).unwrap();
            assert_eq!(decode_request(&bytes).unwrap(), request);
        }
    }

    #[test]
    fn responses_roundtrip() {
        let responses = [
            CrdtResponse::Handshake { failure: None },
            CrdtResponse::Handshake {
                failure: Some(HandshakeFailure {
                    minimal_version: Version::new(2, 1),
                    message: "too old".to_string(),
                }),
            },
            CrdtResponse::UploadAck,
            CrdtResponse::DownloadStarted,
            CrdtResponse::TakeStarted,
            CrdtResponse::RemoveAck,
            CrdtResponse::Pong,
            CrdtResponse::ServerError {
                message: "boom".to_string(),
            },
        ];
        for response in responses {
            let bytes = encode_response(&response).unwrap();
            assert_eq!(decode_response(&bytes).unwrap(), response);
        }
    }

    #[test]
    fn unknown_type_rejected() {
        let bytes = message("NONSENSE", 0).unwrap();
        assert!(matches!(
            decode_request(&bytes),
            Err(ProtoDecodeError::UnknownMessageType(_))
        ));
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut bytes = encode_request(&CrdtRequest::Ping).unwrap();
        bytes.push(0);
        assert!(matches!(
            decode_request(&bytes),
            Err(ProtoDecodeError::TrailingBytes)
        ));
    }

    #[test]
    fn version_ordering() {
        assert!(Version::new(1, 1) > Version::new(1, 0));
        assert!(Version::new(2, 0) > Version::new(1, 9));
        assert_eq!(Version::new(1, 0).to_string(), "1.0");
    }
}
