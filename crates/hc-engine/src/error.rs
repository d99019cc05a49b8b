//! Engine binding errors.
//!
//! Lifecycle calls report engine failures as [`crate::ReturnCode`]s; these
//! errors cover everything else (variable access, worker plumbing, loading).

use std::path::PathBuf;

use thiserror::Error;

use crate::handle::EngineState;
use crate::protocol::ProtocolError;
use crate::values::VarType;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Failed to load engine library {path}: {message}")]
    LibraryLoad { path: PathBuf, message: String },

    #[error("Engine library is missing symbol '{symbol}': {message}")]
    MissingSymbol {
        symbol: &'static str,
        message: String,
    },

    #[error("Invalid name for foreign call: {name:?}")]
    InvalidName { name: String },

    #[error("Unknown engine variable '{name}' (code {code})")]
    UnknownVariable { name: String, code: i32 },

    #[error("Engine variable '{name}' has unsupported element type code {code}")]
    UnsupportedType { name: String, code: i32 },

    #[error("Engine variable '{name}' is a {actual:?} variable, got {given:?} values")]
    TypeMismatch {
        name: String,
        actual: VarType,
        given: VarType,
    },

    #[error("Engine variable '{name}' reports invalid length {len}")]
    InvalidLength { name: String, len: i64 },

    #[error("Engine variable '{name}' holds {expected} values, got {given}")]
    LengthMismatch {
        name: String,
        expected: usize,
        given: usize,
    },

    #[error("Engine call on variable '{name}' failed with code {code}")]
    VariableCall { name: String, code: i32 },

    #[error("Operation '{operation}' not allowed while engine is {state}")]
    InvalidState {
        operation: &'static str,
        state: EngineState,
    },

    #[error("Live message channel cannot cross a process boundary; poll messages instead")]
    LiveChannelUnavailable,

    #[error("Failed to start worker {program}: {source}")]
    WorkerSpawn {
        program: PathBuf,
        source: std::io::Error,
    },

    #[error("Worker {program} exited before connecting ({status})")]
    WorkerExited { program: PathBuf, status: String },

    #[error("Worker {program} did not connect within {timeout_ms} ms")]
    WorkerConnectTimeout { program: PathBuf, timeout_ms: u64 },

    #[error("Worker error: {message}")]
    Remote { message: String },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = EngineError::UnknownVariable {
            name: "Flow1/weirs/w1/crest_level".to_string(),
            code: 2,
        };
        assert!(err.to_string().contains("crest_level"));

        let err = EngineError::InvalidState {
            operation: "update",
            state: EngineState::Disposed,
        };
        assert!(err.to_string().contains("disposed"));
    }
}
