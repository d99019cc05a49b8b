//! Wire protocol between a remote binding and its worker process.
//!
//! Each frame is a 4-byte big-endian length followed by a JSON payload. There
//! is deliberately no request carrying a callback: engine messages cross the
//! process boundary only through [`Request::DrainMessages`].

use std::io::{self, Read, Write};
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api::EngineOffsets;
use crate::settings::LogLevels;
use crate::values::VarValues;

pub const PROTOCOL_VERSION: u32 = 1;

/// Largest accepted frame payload, in bytes.
pub const MAX_MESSAGE_SIZE: usize = 64 << 20;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Message of {size} bytes exceeds the frame limit")]
    MessageTooLarge { size: usize },

    #[error("Expected {expected} response, got {got}")]
    Unexpected { expected: &'static str, got: String },
}

impl ProtocolError {
    /// True when the peer is gone rather than misbehaving.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ProtocolError::ConnectionClosed => true,
            ProtocolError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    Hello { version: u32 },
    SetLogLevels { levels: LogLevels },
    Initialize { config_path: PathBuf },
    Update { dt: f64 },
    Finish,
    Offsets,
    GetValues { name: String },
    SetValues { name: String, values: VarValues },
    DrainMessages,
    Dispose,
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Hello { .. } => "hello",
            Request::SetLogLevels { .. } => "set_log_levels",
            Request::Initialize { .. } => "initialize",
            Request::Update { .. } => "update",
            Request::Finish => "finish",
            Request::Offsets => "offsets",
            Request::GetValues { .. } => "get_values",
            Request::SetValues { .. } => "set_values",
            Request::DrainMessages => "drain_messages",
            Request::Dispose => "dispose",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Response {
    Hello { version: u32 },
    Ok,
    Code { code: i32 },
    Offsets { offsets: EngineOffsets },
    Values { values: VarValues },
    Messages { lines: Vec<String> },
    Error { message: String },
}

impl Response {
    pub fn kind(&self) -> &'static str {
        match self {
            Response::Hello { .. } => "hello",
            Response::Ok => "ok",
            Response::Code { .. } => "code",
            Response::Offsets { .. } => "offsets",
            Response::Values { .. } => "values",
            Response::Messages { .. } => "messages",
            Response::Error { .. } => "error",
        }
    }
}

/// Serialize to JSON without framing.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    Ok(serde_json::to_vec(message)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Read one length-prefixed frame. EOF before the prefix is `ConnectionClosed`.
pub fn read_message<R: Read>(reader: &mut R) -> Result<Vec<u8>, ProtocolError> {
    let mut prefix = [0u8; 4];
    if let Err(e) = reader.read_exact(&mut prefix) {
        return Err(if e.kind() == io::ErrorKind::UnexpectedEof {
            ProtocolError::ConnectionClosed
        } else {
            e.into()
        });
    }
    let size = u32::from_be_bytes(prefix) as usize;
    if size > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge { size });
    }
    // Grow with the bytes actually received instead of trusting the prefix.
    let mut payload = Vec::with_capacity(size.min(64 * 1024));
    reader.by_ref().take(size as u64).read_to_end(&mut payload)?;
    if payload.len() < size {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
    }
    Ok(payload)
}

pub fn write_message<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), ProtocolError> {
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: payload.len(),
        });
    }
    let size = payload.len() as u32;
    writer.write_all(&size.to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

pub fn send<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<(), ProtocolError> {
    write_message(writer, &encode(message)?)
}

pub fn receive<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T, ProtocolError> {
    decode(&read_message(reader)?)
}
