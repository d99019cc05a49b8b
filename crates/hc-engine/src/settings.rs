//! Engine settings threaded into every binding constructor.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Engine parameter receiving the console feedback level.
pub const FEEDBACK_LEVEL_KEY: &str = "feedbackLevel";
/// Engine parameter receiving the log-file level.
pub const DEBUG_LEVEL_KEY: &str = "debugLevel";

pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 2_000;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
/// One engine call, including a full initialize.
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 900_000;

/// Engine severity levels, lowest first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    All,
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Fatal,
    None,
}

impl LogLevel {
    pub fn code(self) -> i32 {
        match self {
            LogLevel::All => 0,
            LogLevel::Debug => 1,
            LogLevel::Info => 2,
            LogLevel::Warning => 3,
            LogLevel::Error => 4,
            LogLevel::Fatal => 5,
            LogLevel::None => 6,
        }
    }

    /// Map an engine code to a level; out-of-range codes clamp to the ends.
    pub fn from_code(code: i32) -> Self {
        match code {
            i32::MIN..=0 => LogLevel::All,
            1 => LogLevel::Debug,
            2 => LogLevel::Info,
            3 => LogLevel::Warning,
            4 => LogLevel::Error,
            5 => LogLevel::Fatal,
            _ => LogLevel::None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogLevels {
    pub feedback: LogLevel,
    pub debug: LogLevel,
}

impl Default for LogLevels {
    fn default() -> Self {
        Self {
            feedback: LogLevel::Info,
            debug: LogLevel::Info,
        }
    }
}

/// How to start the worker process hosting a remote engine.
///
/// `--library <path> --connect <address>` is appended to `args` at spawn time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl Default for WorkerCommand {
    fn default() -> Self {
        Self {
            program: PathBuf::from("hc-cli"),
            args: vec!["worker".to_string()],
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Native engine library (`.so`, `.dll`, `.dylib`).
    pub library_path: PathBuf,
    pub log_levels: LogLevels,
    pub worker: WorkerCommand,
    /// How long to wait for a worker to exit before killing it.
    pub shutdown_grace_ms: u64,
    /// How long a spawned worker has to connect back.
    pub connect_timeout_ms: u64,
    /// Limit on a single worker round trip; `0` disables it.
    pub call_timeout_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            library_path: PathBuf::new(),
            log_levels: LogLevels::default(),
            worker: WorkerCommand::default(),
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
        }
    }
}

impl EngineSettings {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        (self.call_timeout_ms > 0).then(|| Duration::from_millis(self.call_timeout_ms))
    }
}
