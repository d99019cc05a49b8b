//! In-memory engines for tests.
//!
//! Enabled for this crate's tests and, through the `test-support` feature,
//! for downstream crates.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::api::{EngineApi, EngineOffsets};
use crate::error::{EngineError, EngineResult};
use crate::factory::BackendProvider;
use crate::handle::EngineHandle;
use crate::local::LocalEngineBinding;
use crate::protocol::{self, ProtocolError, Request, Response};
use crate::relay::MessageRelay;
use crate::remote::{RemoteEngineBinding, Transport};
use crate::settings::{EngineSettings, LogLevel, LogLevels};
use crate::values::VarValues;
use crate::worker::WorkerHost;

/// What a [`ScriptedEngine`] reports and returns.
#[derive(Clone, Debug, Default)]
pub struct EngineScript {
    /// Offsets after initialize; `current` then advances by `dt` per update.
    pub offsets: EngineOffsets,
    pub initialize_code: i32,
    /// Codes for successive updates; updates past the end return 0.
    pub update_codes: Vec<i32>,
    pub finalize_code: i32,
    pub messages_on_initialize: Vec<String>,
    pub messages_on_update: Vec<String>,
    pub variables: BTreeMap<String, VarValues>,
    pub panic_on_update: bool,
    /// Successful updates after this many stop advancing `current`.
    pub stall_after: Option<usize>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ApiCall {
    SetLevel(String, LogLevel),
    SetLogger(bool),
    Initialize {
        path: PathBuf,
        cwd: Option<PathBuf>,
    },
    Update(f64),
    Finalize,
    GetValues(String),
    SetValues(String),
}

pub type CallLog = Arc<Mutex<Vec<ApiCall>>>;

pub struct ScriptedEngine {
    script: EngineScript,
    current: f64,
    updates: usize,
    relay: Option<Arc<MessageRelay>>,
    calls: CallLog,
}

impl ScriptedEngine {
    pub fn new(script: EngineScript) -> (Self, CallLog) {
        let calls = CallLog::default();
        (Self::with_log(script, Arc::clone(&calls)), calls)
    }

    pub fn with_log(script: EngineScript, calls: CallLog) -> Self {
        Self {
            current: script.offsets.current,
            script,
            updates: 0,
            relay: None,
            calls,
        }
    }

    fn record(&self, call: ApiCall) {
        self.calls.lock().push(call);
    }

    fn emit(&self, lines: &[String]) {
        if let Some(relay) = &self.relay {
            for line in lines {
                relay.publish(LogLevel::Info, line);
            }
        }
    }
}

impl EngineApi for ScriptedEngine {
    fn set_logger(&mut self, relay: Option<Arc<MessageRelay>>) {
        self.record(ApiCall::SetLogger(relay.is_some()));
        self.relay = relay;
    }

    fn set_level(&mut self, key: &str, level: LogLevel) -> i32 {
        self.record(ApiCall::SetLevel(key.to_string(), level));
        0
    }

    fn initialize(&mut self, config_path: &Path) -> i32 {
        self.record(ApiCall::Initialize {
            path: config_path.to_path_buf(),
            cwd: std::env::current_dir().ok(),
        });
        self.emit(&self.script.messages_on_initialize);
        self.script.initialize_code
    }

    fn update(&mut self, dt: f64) -> i32 {
        self.record(ApiCall::Update(dt));
        if self.script.panic_on_update {
            panic!("scripted engine failure");
        }
        let code = self
            .script
            .update_codes
            .get(self.updates)
            .copied()
            .unwrap_or(0);
        let advances = self.script.stall_after.map_or(true, |n| self.updates < n);
        self.updates += 1;
        if code == 0 {
            if advances {
                self.current += dt;
            }
            self.emit(&self.script.messages_on_update);
        }
        code
    }

    fn finalize(&mut self) -> i32 {
        self.record(ApiCall::Finalize);
        self.script.finalize_code
    }

    fn offsets(&self) -> EngineOffsets {
        EngineOffsets {
            current: self.current,
            ..self.script.offsets
        }
    }

    fn current_offset(&self) -> f64 {
        self.current
    }

    fn get_values(&mut self, name: &str) -> EngineResult<VarValues> {
        self.record(ApiCall::GetValues(name.to_string()));
        self.script
            .variables
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownVariable {
                name: name.to_string(),
                code: 1,
            })
    }

    fn set_values(&mut self, name: &str, values: &VarValues) -> EngineResult<()> {
        self.record(ApiCall::SetValues(name.to_string()));
        let Some(existing) = self.script.variables.get_mut(name) else {
            return Err(EngineError::UnknownVariable {
                name: name.to_string(),
                code: 1,
            });
        };
        if existing.var_type() != values.var_type() {
            return Err(EngineError::TypeMismatch {
                name: name.to_string(),
                actual: existing.var_type(),
                given: values.var_type(),
            });
        }
        if existing.len() != values.len() {
            return Err(EngineError::LengthMismatch {
                name: name.to_string(),
                expected: existing.len(),
                given: values.len(),
            });
        }
        *existing = values.clone();
        Ok(())
    }
}

/// A transport that serves requests in-process through a [`WorkerHost`].
///
/// Every message still goes through JSON encoding.
pub struct LoopbackTransport {
    host: WorkerHost<LocalEngineBinding>,
    closed: bool,
}

impl LoopbackTransport {
    pub fn new(binding: LocalEngineBinding) -> Self {
        Self {
            host: WorkerHost::new(binding),
            closed: false,
        }
    }
}

impl Transport for LoopbackTransport {
    fn round_trip(&mut self, request: &Request) -> Result<Response, ProtocolError> {
        if self.closed {
            return Err(ProtocolError::ConnectionClosed);
        }
        let request: Request = protocol::decode(&protocol::encode(request)?)?;
        let response = self.host.handle_request(request);
        protocol::decode(&protocol::encode(&response)?)
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

/// Hands out bindings over fresh [`ScriptedEngine`]s sharing one call log.
pub struct ScriptedProvider {
    script: EngineScript,
    levels: LogLevels,
    remote: bool,
    calls: CallLog,
    created: AtomicUsize,
}

impl ScriptedProvider {
    pub fn local(script: EngineScript) -> Self {
        Self::new(script, false)
    }

    /// Bindings go through [`RemoteEngineBinding`] over a [`LoopbackTransport`].
    pub fn remote(script: EngineScript) -> Self {
        Self::new(script, true)
    }

    fn new(script: EngineScript, remote: bool) -> Self {
        Self {
            script,
            levels: LogLevels::default(),
            remote,
            calls: CallLog::default(),
            created: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> CallLog {
        Arc::clone(&self.calls)
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl BackendProvider for ScriptedProvider {
    fn create(&self, _prefer_remote: bool) -> EngineResult<Option<Box<dyn EngineHandle>>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let engine = ScriptedEngine::with_log(self.script.clone(), Arc::clone(&self.calls));
        let local = LocalEngineBinding::with_api(Box::new(engine), self.levels);
        if !self.remote {
            return Ok(Some(Box::new(local)));
        }
        let settings = EngineSettings {
            log_levels: self.levels,
            ..EngineSettings::default()
        };
        let remote =
            RemoteEngineBinding::attach(Box::new(LoopbackTransport::new(local)), &settings)?;
        Ok(Some(Box::new(remote)))
    }
}

/// A provider that never finds a backend.
pub struct NoBackend;

impl BackendProvider for NoBackend {
    fn create(&self, _prefer_remote: bool) -> EngineResult<Option<Box<dyn EngineHandle>>> {
        Ok(None)
    }
}

/// C source of a small engine implementing the native ABI.
///
/// Besides the engine entry points it exports `stub_feedback_level`,
/// `stub_debug_level` and `stub_logger_registered` for inspection.
pub const STUB_ENGINE_SOURCE: &str = include_str!("../tests/fixtures/stub_engine.c");

/// Compile the stub engine into `dir` as a shared library with the system C
/// compiler (`$CC`, else `cc`).
///
/// A `noisy` engine prints to its stdout on every lifecycle call.
pub fn build_stub_engine(dir: &Path, noisy: bool) -> io::Result<PathBuf> {
    let source = dir.join("stub_engine.c");
    fs::write(&source, STUB_ENGINE_SOURCE)?;
    let library = dir.join(format!(
        "{}hc_stub_engine{}",
        env::consts::DLL_PREFIX,
        env::consts::DLL_SUFFIX
    ));

    let compiler = env::var_os("CC").unwrap_or_else(|| "cc".into());
    let mut command = Command::new(compiler);
    command
        .args(["-shared", "-fPIC", "-o"])
        .arg(&library)
        .arg(&source);
    if noisy {
        command.arg("-DHC_STUB_NOISY");
    }
    let output = command.output()?;
    if !output.status.success() {
        return Err(io::Error::other(format!(
            "stub engine build failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(library)
}
