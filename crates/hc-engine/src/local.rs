//! In-process engine binding.

use std::any::Any;
use std::env;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDateTime;
use hc_core::ExecutionTimeline;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::api::EngineApi;
use crate::error::{EngineError, EngineResult};
use crate::ffi::NativeEngine;
use crate::handle::{BackendKind, DisposeOutcome, EngineHandle, EngineState, ReturnCode};
use crate::relay::{LiveLogger, MessageRelay};
use crate::settings::{DEBUG_LEVEL_KEY, EngineSettings, FEEDBACK_LEVEL_KEY, LogLevel, LogLevels};
use crate::values::VarValues;

/// The process current directory is global; initialize calls switch it one at a time.
static WORKING_DIR_LOCK: Mutex<()> = parking_lot::const_mutex(());

enum EngineSource {
    Library(PathBuf),
    Attached(Box<dyn EngineApi>),
}

/// Drives an engine through direct calls in this process.
///
/// The library is loaded lazily by `initialize`, so constructing a binding
/// never touches foreign code.
///
/// `initialize` runs with the process current directory set to the config
/// file's directory. The directory is process-wide: other threads resolving
/// relative paths during that call see the config directory, so a host that
/// initializes engines off its main thread should use absolute paths
/// everywhere else.
pub struct LocalEngineBinding {
    source: Option<EngineSource>,
    api: Option<Box<dyn EngineApi>>,
    levels: LogLevels,
    relay: Arc<MessageRelay>,
    timeline: ExecutionTimeline,
    state: EngineState,
}

impl LocalEngineBinding {
    pub fn new(settings: &EngineSettings) -> Self {
        Self::from_source(
            EngineSource::Library(settings.library_path.clone()),
            settings.log_levels,
        )
    }

    /// Bind to an already constructed engine, e.g. an in-memory one.
    pub fn with_api(api: Box<dyn EngineApi>, levels: LogLevels) -> Self {
        Self::from_source(EngineSource::Attached(api), levels)
    }

    fn from_source(source: EngineSource, levels: LogLevels) -> Self {
        Self {
            source: Some(source),
            api: None,
            levels,
            relay: Arc::new(MessageRelay::new()),
            timeline: ExecutionTimeline::default(),
            state: EngineState::Unbound,
        }
    }

    pub fn relay(&self) -> &Arc<MessageRelay> {
        &self.relay
    }

    pub fn log_levels(&self) -> LogLevels {
        self.levels
    }

    fn open(&mut self) -> EngineResult<Box<dyn EngineApi>> {
        if let Some(api) = self.api.take() {
            return Ok(api);
        }
        match self.source.take() {
            Some(EngineSource::Attached(api)) => Ok(api),
            Some(EngineSource::Library(path)) => {
                info!(path = %path.display(), "loading engine library");
                Ok(Box::new(NativeEngine::load(&path)?))
            }
            None => Err(EngineError::InvalidState {
                operation: "initialize",
                state: self.state,
            }),
        }
    }

    fn try_initialize(&mut self, config_path: &Path) -> EngineResult<ReturnCode> {
        let mut api = self.open()?;

        for (key, level) in [
            (FEEDBACK_LEVEL_KEY, self.levels.feedback),
            (DEBUG_LEVEL_KEY, self.levels.debug),
        ] {
            let code = api.set_level(key, level);
            if code != 0 {
                warn!(key, ?level, code, "engine rejected log level");
            }
        }
        api.set_logger(Some(Arc::clone(&self.relay)));

        let config_path = std::path::absolute(config_path)?;
        let code = {
            let _cwd = WorkingDirGuard::enter(config_path.parent())?;
            ReturnCode(api.initialize(&config_path))
        };

        if code.is_success() {
            let offsets = api.offsets();
            self.timeline
                .capture(offsets.start, offsets.end, offsets.step, offsets.current);
            self.state = EngineState::Initialized;
            debug!(
                start = offsets.start,
                end = offsets.end,
                step = offsets.step,
                current = offsets.current,
                "captured engine offsets"
            );
        }
        self.api = Some(api);
        Ok(code)
    }

    fn reject(&self, operation: &'static str) -> ReturnCode {
        let err = EngineError::InvalidState {
            operation,
            state: self.state,
        };
        warn!("{err}");
        self.relay.publish(LogLevel::Error, &err.to_string());
        ReturnCode::INVALID_STATE
    }

    fn require_active(&self, operation: &'static str) -> EngineResult<()> {
        if self.state.is_active() && self.api.is_some() {
            Ok(())
        } else {
            Err(EngineError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }
}

impl EngineHandle for LocalEngineBinding {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn state(&self) -> EngineState {
        self.state
    }

    fn set_log_levels(&mut self, levels: LogLevels) -> EngineResult<()> {
        if !self.state.can_initialize() {
            return Err(EngineError::InvalidState {
                operation: "set_log_levels",
                state: self.state,
            });
        }
        self.levels = levels;
        Ok(())
    }

    fn set_reference_date(&mut self, date: NaiveDateTime) {
        self.timeline.set_reference_date(date);
    }

    fn timeline(&self) -> &ExecutionTimeline {
        &self.timeline
    }

    fn initialize(&mut self, config_path: &Path) -> ReturnCode {
        if !self.state.can_initialize() {
            return self.reject("initialize");
        }
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.try_initialize(config_path)));
        match outcome {
            Ok(Ok(code)) => code,
            Ok(Err(err)) => {
                error!(error = %err, "engine initialize failed");
                self.relay.publish(LogLevel::Error, &err.to_string());
                ReturnCode::BINDING_FAILURE
            }
            Err(payload) => {
                let message = format!("engine initialize panicked: {}", panic_message(&*payload));
                error!("{message}");
                self.relay.publish(LogLevel::Fatal, &message);
                ReturnCode::BINDING_FAILURE
            }
        }
    }

    fn update(&mut self, dt: f64) -> ReturnCode {
        if !self.state.is_active() {
            return self.reject("update");
        }
        let Some(api) = self.api.as_mut() else {
            return self.reject("update");
        };
        let code = guarded(&self.relay, "update", || api.update(dt));
        if code.is_success() {
            let current = api.current_offset();
            if !self.timeline.advance(current) {
                warn!(
                    current,
                    previous = self.timeline.current_offset(),
                    "ignoring non-monotonic engine offset"
                );
            }
            self.state = EngineState::Running;
        }
        code
    }

    fn finish(&mut self) -> ReturnCode {
        if !self.state.is_active() {
            return self.reject("finish");
        }
        let Some(api) = self.api.as_mut() else {
            return self.reject("finish");
        };
        let code = guarded(&self.relay, "finish", || api.finalize());
        self.state = EngineState::Finished;
        code
    }

    fn get_values(&mut self, name: &str) -> EngineResult<VarValues> {
        self.require_active("get_values")?;
        match self.api.as_mut() {
            Some(api) => api.get_values(name),
            None => Err(EngineError::InvalidState {
                operation: "get_values",
                state: self.state,
            }),
        }
    }

    fn set_values(&mut self, name: &str, values: &VarValues) -> EngineResult<()> {
        self.require_active("set_values")?;
        match self.api.as_mut() {
            Some(api) => api.set_values(name, values),
            None => Err(EngineError::InvalidState {
                operation: "set_values",
                state: self.state,
            }),
        }
    }

    fn drain_messages(&mut self) -> Vec<String> {
        self.relay.buffer().drain()
    }

    fn attach_live_logger(&mut self, logger: LiveLogger) -> EngineResult<()> {
        self.relay.attach_live(logger);
        Ok(())
    }

    fn dispose(&mut self) -> DisposeOutcome {
        if self.state == EngineState::Disposed {
            return DisposeOutcome::AlreadyDisposed;
        }
        self.state = EngineState::Disposed;
        self.source = None;
        self.relay.detach_live();

        let Some(mut api) = self.api.take() else {
            return DisposeOutcome::Clean;
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(move || {
            api.set_logger(None);
            drop(api);
        }));
        match outcome {
            Ok(()) => {
                debug!("local engine disposed");
                DisposeOutcome::Clean
            }
            Err(payload) => {
                let message = panic_message(&*payload);
                warn!(%message, "panic while releasing engine");
                DisposeOutcome::Faulted(message)
            }
        }
    }
}

impl Drop for LocalEngineBinding {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Run one foreign lifecycle call, turning a panic into `BINDING_FAILURE`.
fn guarded(relay: &MessageRelay, call: &'static str, f: impl FnOnce() -> i32) -> ReturnCode {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(code) => ReturnCode(code),
        Err(payload) => {
            let message = format!("engine {call} panicked: {}", panic_message(&*payload));
            error!("{message}");
            relay.publish(LogLevel::Fatal, &message);
            ReturnCode::BINDING_FAILURE
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Switches the current directory and restores it on drop.
struct WorkingDirGuard {
    previous: Option<PathBuf>,
    _lock: MutexGuard<'static, ()>,
}

impl WorkingDirGuard {
    fn enter(dir: Option<&Path>) -> io::Result<Self> {
        let lock = WORKING_DIR_LOCK.lock();
        let previous = match dir {
            Some(dir) if !dir.as_os_str().is_empty() => {
                let previous = env::current_dir()?;
                env::set_current_dir(dir)?;
                Some(previous)
            }
            _ => None,
        };
        Ok(Self {
            previous,
            _lock: lock,
        })
    }
}

impl Drop for WorkingDirGuard {
    fn drop(&mut self) {
        if let Some(previous) = self.previous.take() {
            if let Err(e) = env::set_current_dir(&previous) {
                warn!(dir = %previous.display(), error = %e, "failed to restore working directory");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::EngineOffsets;
    use crate::testing::{ApiCall, EngineScript, ScriptedEngine};

    fn binding(script: EngineScript) -> (LocalEngineBinding, crate::testing::CallLog) {
        let (engine, calls) = ScriptedEngine::new(script);
        (
            LocalEngineBinding::with_api(Box::new(engine), LogLevels::default()),
            calls,
        )
    }

    fn config_in(dir: &Path) -> PathBuf {
        let path = dir.join("dimr.xml");
        std::fs::write(&path, "<dimrConfig/>").unwrap();
        path
    }

    #[test]
    fn initialize_sets_levels_then_logger_then_initializes() {
        let temp = tempfile::tempdir().unwrap();
        let (mut binding, calls) = binding(EngineScript::default());

        assert_eq!(binding.initialize(&config_in(temp.path())), ReturnCode::SUCCESS);
        assert_eq!(binding.state(), EngineState::Initialized);

        let calls = calls.lock();
        assert_eq!(
            calls[0],
            ApiCall::SetLevel(FEEDBACK_LEVEL_KEY.to_string(), LogLevel::Info)
        );
        assert_eq!(
            calls[1],
            ApiCall::SetLevel(DEBUG_LEVEL_KEY.to_string(), LogLevel::Info)
        );
        assert_eq!(calls[2], ApiCall::SetLogger(true));
        assert!(matches!(calls[3], ApiCall::Initialize { .. }));
    }

    #[test]
    fn initialize_runs_inside_config_directory() {
        let temp = tempfile::tempdir().unwrap();
        let (mut binding, calls) = binding(EngineScript::default());
        binding.initialize(&config_in(temp.path()));

        let calls = calls.lock();
        let ApiCall::Initialize { cwd, .. } = &calls[3] else {
            panic!("expected initialize, got {:?}", calls[3]);
        };
        assert_eq!(
            cwd.as_ref().map(|p| p.canonicalize().unwrap()),
            Some(temp.path().canonicalize().unwrap())
        );
    }

    #[test]
    fn working_directory_is_restored_after_initialize() {
        let temp = tempfile::tempdir().unwrap();
        let before = {
            let _lock = WORKING_DIR_LOCK.lock();
            env::current_dir().unwrap()
        };

        let (mut binding, _) = binding(EngineScript {
            initialize_code: 7,
            ..EngineScript::default()
        });
        assert_eq!(binding.initialize(&config_in(temp.path())), ReturnCode(7));

        let _lock = WORKING_DIR_LOCK.lock();
        assert_eq!(env::current_dir().unwrap(), before);
    }

    #[test]
    fn offsets_are_captured_with_nonzero_origin() {
        let temp = tempfile::tempdir().unwrap();
        let (mut binding, _) = binding(EngineScript {
            offsets: EngineOffsets {
                start: 3600.0,
                end: 7200.0,
                step: 600.0,
                current: 3600.0,
            },
            ..EngineScript::default()
        });
        let reference = NaiveDateTime::parse_from_str("2026-01-01 00:00:00", "%Y-%m-%d %H:%M:%S")
            .unwrap();
        binding.set_reference_date(reference);
        binding.initialize(&config_in(temp.path()));

        assert_eq!(binding.timeline().start_time(), reference);
        assert_eq!(
            binding.timeline().stop_time(),
            reference + chrono::TimeDelta::hours(1)
        );

        assert!(binding.update(600.0).is_success());
        assert_eq!(binding.state(), EngineState::Running);
        assert_eq!(
            binding.timeline().current_time(),
            reference + chrono::TimeDelta::minutes(10)
        );
    }

    #[test]
    fn nonzero_initialize_code_is_returned_as_is() {
        let temp = tempfile::tempdir().unwrap();
        let (mut binding, _) = binding(EngineScript {
            initialize_code: 3,
            ..EngineScript::default()
        });
        assert_eq!(binding.initialize(&config_in(temp.path())), ReturnCode(3));
        assert_eq!(binding.state(), EngineState::Unbound);
        assert!(!binding.timeline().is_captured());
    }

    #[test]
    fn update_before_initialize_is_invalid_state() {
        let (mut binding, calls) = binding(EngineScript::default());
        assert_eq!(binding.update(1.0), ReturnCode::INVALID_STATE);
        assert!(calls.lock().is_empty());
        let messages = binding.drain_messages();
        assert!(messages[0].contains("update"));
    }

    #[test]
    fn engine_messages_reach_buffer() {
        let temp = tempfile::tempdir().unwrap();
        let (mut binding, _) = binding(EngineScript {
            messages_on_initialize: vec!["reading flow.mdu".to_string()],
            ..EngineScript::default()
        });
        binding.initialize(&config_in(temp.path()));
        assert_eq!(binding.drain_messages(), vec!["reading flow.mdu".to_string()]);
        assert_eq!(binding.drain_messages(), vec![String::new()]);
    }

    #[test]
    fn panicking_engine_maps_to_binding_failure() {
        let temp = tempfile::tempdir().unwrap();
        let (mut binding, _) = binding(EngineScript {
            panic_on_update: true,
            ..EngineScript::default()
        });
        binding.initialize(&config_in(temp.path()));
        assert_eq!(binding.update(1.0), ReturnCode::BINDING_FAILURE);
        let messages = binding.drain_messages();
        assert!(messages.iter().any(|m| m.contains("panicked")));
    }

    #[test]
    fn dispose_unregisters_and_is_repeatable() {
        let temp = tempfile::tempdir().unwrap();
        let (mut binding, calls) = binding(EngineScript::default());
        binding.initialize(&config_in(temp.path()));

        assert_eq!(binding.dispose(), DisposeOutcome::Clean);
        assert_eq!(binding.dispose(), DisposeOutcome::AlreadyDisposed);
        assert_eq!(calls.lock().last(), Some(&ApiCall::SetLogger(false)));
        assert_eq!(binding.update(1.0), ReturnCode::INVALID_STATE);
    }

    #[test]
    fn log_levels_locked_after_initialize() {
        let temp = tempfile::tempdir().unwrap();
        let (mut binding, _) = binding(EngineScript::default());
        let levels = LogLevels {
            feedback: LogLevel::Debug,
            debug: LogLevel::Error,
        };
        binding.set_log_levels(levels).unwrap();
        assert_eq!(binding.log_levels(), levels);

        binding.initialize(&config_in(temp.path()));
        assert!(matches!(
            binding.set_log_levels(LogLevels::default()),
            Err(EngineError::InvalidState { .. })
        ));
    }
}
