//! Safe surface over the engine's C entry points.
//!
//! [`crate::ffi::NativeEngine`] implements this over a loaded library; tests
//! use an in-memory implementation.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::EngineResult;
use crate::relay::MessageRelay;
use crate::settings::LogLevel;
use crate::values::VarValues;

/// Offsets reported by the engine, in seconds on its own axis.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineOffsets {
    pub start: f64,
    pub end: f64,
    pub step: f64,
    pub current: f64,
}

pub trait EngineApi: Send {
    /// Register (`Some`) or unregister (`None`) the message callback.
    fn set_logger(&mut self, relay: Option<Arc<MessageRelay>>);

    /// Set an integer logging parameter such as `feedbackLevel`.
    fn set_level(&mut self, key: &str, level: LogLevel) -> i32;

    fn initialize(&mut self, config_path: &Path) -> i32;

    fn update(&mut self, dt: f64) -> i32;

    fn finalize(&mut self) -> i32;

    fn offsets(&self) -> EngineOffsets;

    fn current_offset(&self) -> f64;

    fn get_values(&mut self, name: &str) -> EngineResult<VarValues>;

    fn set_values(&mut self, name: &str, values: &VarValues) -> EngineResult<()>;
}
