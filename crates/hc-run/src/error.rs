//! Error types for running a coupled model.

use std::path::PathBuf;

use hc_config::ConfigError;
use hc_core::ModelStatus;
use hc_engine::{EngineError, ReturnCode};

use crate::progress::RunPhase;

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Model '{model}' failed validation: {}", issues.join("; "))]
    Validation { model: String, issues: Vec<String> },

    #[error("Engine {call} failed with code {code} (model was {previous_status})")]
    EngineCall {
        call: &'static str,
        previous_status: ModelStatus,
        code: ReturnCode,
    },

    #[error("Engine reported time step {step}; it must be positive and finite")]
    InvalidTimeStep { step: f64 },

    #[error("Engine update succeeded but time stayed at offset {offset}")]
    Stalled { offset: f64 },

    #[error("No engine backend available: {reason}")]
    NoBackend { reason: String },

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Export failed: {message}")]
    Export { message: String },

    #[error("Cannot {phase} while model is {status}")]
    InvalidPhase {
        phase: RunPhase,
        status: ModelStatus,
    },

    #[error("Unexpected failure during {phase}: {message}")]
    Panicked { phase: RunPhase, message: String },

    #[error("Failed to read settings file: {path}")]
    SettingsRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid settings file {path}: {source}")]
    SettingsFormat {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunError {
    /// Raw engine code of an `EngineCall` failure.
    pub fn code(&self) -> Option<ReturnCode> {
        match self {
            RunError::EngineCall { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Model status before the failing engine call.
    pub fn previous_status(&self) -> Option<ModelStatus> {
        match self {
            RunError::EngineCall {
                previous_status, ..
            } => Some(*previous_status),
            _ => None,
        }
    }
}

pub type RunResult<T> = Result<T, RunError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_call_carries_code_and_status() {
        let err = RunError::EngineCall {
            call: "update",
            previous_status: ModelStatus::Executed,
            code: ReturnCode(3),
        };
        assert_eq!(err.code(), Some(ReturnCode(3)));
        assert_eq!(err.previous_status(), Some(ModelStatus::Executed));
        assert_eq!(
            err.to_string(),
            "Engine update failed with code 3 (model was executed)"
        );
    }

    #[test]
    fn validation_lists_issues() {
        let err = RunError::Validation {
            model: "Flow1".to_string(),
            issues: vec!["no grid".to_string(), "no boundaries".to_string()],
        };
        assert_eq!(err.code(), None);
        assert!(err.to_string().ends_with("no grid; no boundaries"));
    }
}
