//! The uniform engine capability seen by the orchestrator.

use std::fmt;
use std::path::Path;

use chrono::NaiveDateTime;
use hc_core::ExecutionTimeline;
use serde::{Deserialize, Serialize};

use crate::error::EngineResult;
use crate::relay::LiveLogger;
use crate::settings::LogLevels;
use crate::values::VarValues;

/// Raw engine return code; zero means success.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReturnCode(pub i32);

impl ReturnCode {
    pub const SUCCESS: ReturnCode = ReturnCode(0);
    /// Library load failure, missing symbol, or panic inside the binding.
    pub const BINDING_FAILURE: ReturnCode = ReturnCode(-1);
    /// Worker unreachable or protocol fault.
    pub const TRANSPORT_FAILURE: ReturnCode = ReturnCode(-2);
    /// Call not allowed in the handle's current state.
    pub const INVALID_STATE: ReturnCode = ReturnCode(-3);

    pub fn is_success(self) -> bool {
        self.0 == 0
    }

    pub fn raw(self) -> i32 {
        self.0
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of one handle. Handles are created per run and never reused.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineState {
    #[default]
    Unbound,
    Initialized,
    Running,
    Finished,
    Disposed,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Unbound => "unbound",
            EngineState::Initialized => "initialized",
            EngineState::Running => "running",
            EngineState::Finished => "finished",
            EngineState::Disposed => "disposed",
        }
    }

    pub fn can_initialize(&self) -> bool {
        matches!(self, EngineState::Unbound)
    }

    /// Update, finish and variable access.
    pub fn is_active(&self) -> bool {
        matches!(self, EngineState::Initialized | EngineState::Running)
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of releasing a handle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DisposeOutcome {
    Clean,
    AlreadyDisposed,
    /// The worker did not exit within the grace period and was killed.
    ForcedAfterTimeout,
    /// Teardown hit an error that was logged and swallowed.
    Faulted(String),
}

/// Which binding backs a handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    Local,
    Remote,
}

/// Uniform lifecycle over a time-stepped engine.
///
/// Lifecycle calls return the engine's code as-is; turning a nonzero code into
/// an error is the caller's job.
pub trait EngineHandle: Send {
    fn kind(&self) -> BackendKind;

    fn state(&self) -> EngineState;

    /// Only allowed before initialize.
    fn set_log_levels(&mut self, levels: LogLevels) -> EngineResult<()>;

    fn set_reference_date(&mut self, date: NaiveDateTime);

    fn timeline(&self) -> &ExecutionTimeline;

    fn initialize(&mut self, config_path: &Path) -> ReturnCode;

    fn update(&mut self, dt: f64) -> ReturnCode;

    fn finish(&mut self) -> ReturnCode;

    fn get_values(&mut self, name: &str) -> EngineResult<VarValues>;

    fn set_values(&mut self, name: &str, values: &VarValues) -> EngineResult<()>;

    /// Polled channel: drain buffered engine messages (`[""]` when empty).
    fn drain_messages(&mut self) -> Vec<String>;

    /// Live channel: push messages to `logger` as they arrive. In-process only.
    fn attach_live_logger(&mut self, logger: LiveLogger) -> EngineResult<()>;

    /// Release the engine. Safe to call more than once.
    fn dispose(&mut self) -> DisposeOutcome;
}
