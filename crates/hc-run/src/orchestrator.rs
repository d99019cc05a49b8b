//! Run orchestration for one coupled model.
//!
//! An external scheduler calls [`RunContext::on_initialize`] once,
//! [`RunContext::on_execute`] until the model is done (or it decides to
//! stop), then [`RunContext::on_finish`] and [`RunContext::on_cleanup`].
//! Phases never overlap for one context.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::time::Instant;

use chrono::{NaiveDateTime, TimeDelta};
use hc_config::{ComponentSpec, ConfigDocumentBuilder};
use hc_core::ModelStatus;
use hc_engine::{
    BackendProvider, DisposeOutcome, EngineError, EngineHandle, EngineState, ReturnCode, VarValues,
};
use tracing::{debug, error, info, warn};

use crate::error::{RunError, RunResult};
use crate::model::{CoupledModel, ModelExporter, ModelValidator, Severity};
use crate::progress::{RunPhase, RunProgressEvent, RunStage, RunStatistics};
use crate::run_log::{RUN_LOG_FILE_NAME, read_run_log};
use crate::sink::MessageSink;

/// Config document written into the export directory.
pub const CONFIG_FILE_NAME: &str = "dimr.xml";

/// External collaborators of a run.
pub struct RunServices<'a> {
    pub validator: &'a dyn ModelValidator,
    pub exporter: &'a dyn ModelExporter,
    pub backends: &'a dyn BackendProvider,
    pub sink: &'a dyn MessageSink,
}

type ProgressCallback<'a> = Box<dyn FnMut(&RunProgressEvent) + 'a>;

/// State of one run. Owns the engine handle from initialize until cleanup
/// or the first failure.
pub struct RunContext<'a> {
    model: &'a mut dyn CoupledModel,
    services: RunServices<'a>,
    prefer_remote: bool,
    config_builder: ConfigDocumentBuilder,
    handle: Option<Box<dyn EngineHandle>>,
    status: ModelStatus,
    time_step: f64,
    stop_time: Option<NaiveDateTime>,
    current_time: Option<NaiveDateTime>,
    statistics: RunStatistics,
    progress: Option<ProgressCallback<'a>>,
    started: Instant,
}

impl<'a> RunContext<'a> {
    pub fn new(
        model: &'a mut dyn CoupledModel,
        services: RunServices<'a>,
        prefer_remote: bool,
    ) -> Self {
        Self {
            model,
            services,
            prefer_remote,
            config_builder: ConfigDocumentBuilder::new(),
            handle: None,
            status: ModelStatus::NotRun,
            time_step: 0.0,
            stop_time: None,
            current_time: None,
            statistics: RunStatistics::default(),
            progress: None,
            started: Instant::now(),
        }
    }

    pub fn with_config_builder(mut self, builder: ConfigDocumentBuilder) -> Self {
        self.config_builder = builder;
        self
    }

    pub fn on_progress(&mut self, callback: impl FnMut(&RunProgressEvent) + 'a) {
        self.progress = Some(Box::new(callback));
    }

    pub fn status(&self) -> ModelStatus {
        self.status
    }

    pub fn current_time(&self) -> Option<NaiveDateTime> {
        self.current_time
    }

    pub fn stop_time(&self) -> Option<NaiveDateTime> {
        self.stop_time
    }

    /// Engine step in seconds, cached at initialize.
    pub fn time_step(&self) -> f64 {
        self.time_step
    }

    pub fn statistics(&self) -> &RunStatistics {
        &self.statistics
    }

    pub fn handle(&self) -> Option<&dyn EngineHandle> {
        self.handle.as_deref()
    }

    pub fn config_path(&self) -> PathBuf {
        self.model.export_directory().join(CONFIG_FILE_NAME)
    }

    pub fn on_initialize(&mut self) -> RunResult<()> {
        if self.status != ModelStatus::NotRun {
            return Err(RunError::InvalidPhase {
                phase: RunPhase::Initialize,
                status: self.status,
            });
        }
        self.started = Instant::now();
        self.guarded(RunPhase::Initialize, Self::initialize)
    }

    pub fn on_execute(&mut self) -> RunResult<()> {
        if !self.status.can_execute() {
            return Err(RunError::InvalidPhase {
                phase: RunPhase::Execute,
                status: self.status,
            });
        }
        self.guarded(RunPhase::Execute, Self::execute)
    }

    pub fn on_finish(&mut self) -> RunResult<()> {
        if !self.status.can_finish() {
            return Err(RunError::InvalidPhase {
                phase: RunPhase::Finish,
                status: self.status,
            });
        }
        self.guarded(RunPhase::Finish, Self::finish)
    }

    /// Release the engine and import output. Valid in any status.
    pub fn on_cleanup(&mut self) -> RunResult<()> {
        let started = Instant::now();
        self.release_engine();

        let output_dir = self.model.output_directory();
        let result = if output_dir.is_dir() {
            self.import_output(&output_dir)
        } else {
            debug!(dir = %output_dir.display(), "no output directory, skipping output import");
            Ok(())
        };

        self.statistics.record(RunPhase::Cleanup, started.elapsed());
        if let Err(err) = &result {
            warn!(model = self.model.name(), error = %err, "output import failed");
        }
        self.emit(RunStage::CleaningUp, None);
        result
    }

    /// Initialize, step until done, finish; cleanup always runs.
    pub fn run_to_completion(&mut self) -> RunResult<()> {
        let result = self.drive();
        let cleanup = self.on_cleanup();
        result?;
        cleanup?;
        self.emit(RunStage::Completed, None);
        Ok(())
    }

    fn drive(&mut self) -> RunResult<()> {
        self.on_initialize()?;
        while self.status.can_execute() {
            self.on_execute()?;
        }
        self.on_finish()
    }

    /// Read an engine variable of this model.
    pub fn get_var(&mut self, category: &str, item: &str, parameter: &str) -> RunResult<VarValues> {
        let name = self.var_name(category, item, parameter);
        let handle = self.handle.as_mut().ok_or(EngineError::InvalidState {
            operation: "get_values",
            state: EngineState::Unbound,
        })?;
        Ok(handle.get_values(&name)?)
    }

    pub fn set_var(
        &mut self,
        values: &VarValues,
        category: &str,
        item: &str,
        parameter: &str,
    ) -> RunResult<()> {
        let name = self.var_name(category, item, parameter);
        let handle = self.handle.as_mut().ok_or(EngineError::InvalidState {
            operation: "set_values",
            state: EngineState::Unbound,
        })?;
        Ok(handle.set_values(&name, values)?)
    }

    fn var_name(&self, category: &str, item: &str, parameter: &str) -> String {
        format!("{}/{category}/{item}/{parameter}", self.model.name())
    }

    fn initialize(&mut self) -> RunResult<()> {
        let name = self.model.name().to_string();
        info!(model = %name, "initializing model run");

        self.emit(RunStage::Validating, None);
        let report = self.services.validator.validate(&*self.model);
        if report.severity == Severity::Error {
            return Err(RunError::Validation {
                model: name,
                issues: report.issues,
            });
        }
        for issue in &report.issues {
            warn!(model = %name, "{issue}");
        }

        self.emit(RunStage::Exporting, None);
        self.model.disconnect_output();
        let export_dir = self.model.export_directory().to_path_buf();
        self.services.exporter.export(&*self.model, &export_dir)?;

        self.emit(RunStage::WritingConfig, None);
        let spec = ComponentSpec {
            name: name.clone(),
            library: self.model.library_name().to_string(),
            working_dir: self.model.directory_name().to_string(),
            input_file: self.model.input_file().to_string(),
        };
        let document = self.config_builder.build(&spec);
        let config_path = export_dir.join(CONFIG_FILE_NAME);
        self.config_builder
            .save(&config_path, &document, &self.model.output_directory())?;

        self.emit(RunStage::CreatingBackend, None);
        let mut handle = self
            .services
            .backends
            .create(self.prefer_remote)?
            .ok_or_else(|| RunError::NoBackend {
                reason: format!(
                    "no engine backend can run on this platform (prefer_remote = {})",
                    self.prefer_remote
                ),
            })?;
        info!(model = %name, backend = ?handle.kind(), "created engine backend");
        handle.set_reference_date(self.model.reference_date());

        let previous = self.status;
        let code = handle.initialize(&config_path);
        // Owned from here so failure paths dispose it.
        let handle = self.handle.insert(handle);
        check("initialize", code, previous)?;

        let timeline = handle.timeline();
        let step = timeline.step_offset();
        if !(step.is_finite() && step > 0.0) {
            return Err(RunError::InvalidTimeStep { step });
        }
        self.time_step = step;
        self.stop_time = Some(timeline.stop_time());
        self.current_time = Some(timeline.start_time());
        self.status = ModelStatus::Initialized;
        self.forward_messages();

        info!(
            model = %name,
            start = ?self.current_time,
            stop = ?self.stop_time,
            step_s = self.time_step,
            "engine initialized"
        );
        self.emit(RunStage::InitializingEngine, None);
        Ok(())
    }

    fn execute(&mut self) -> RunResult<()> {
        let previous = self.status;
        self.status = ModelStatus::Executing;

        let Some(handle) = self.handle.as_mut() else {
            return Err(RunError::InvalidPhase {
                phase: RunPhase::Execute,
                status: previous,
            });
        };
        let before = handle.timeline().current_offset();
        let code = handle.update(self.time_step);
        self.statistics.update_calls += 1;
        if !code.is_success() {
            self.forward_messages();
            return Err(RunError::EngineCall {
                call: "update",
                previous_status: previous,
                code,
            });
        }

        let offset = handle.timeline().current_offset();
        let current = handle.timeline().current_time();
        self.current_time = Some(current);
        self.forward_messages();

        let remaining = self
            .stop_time
            .map(|stop| stop.signed_duration_since(current))
            .unwrap_or(TimeDelta::zero());
        self.status = if remaining <= TimeDelta::zero() {
            info!(model = self.model.name(), %current, "model run reached stop time");
            ModelStatus::Done
        } else if offset <= before {
            return Err(RunError::Stalled { offset });
        } else {
            ModelStatus::Executed
        };
        self.emit(RunStage::Stepping, None);
        Ok(())
    }

    fn finish(&mut self) -> RunResult<()> {
        let previous = self.status;
        self.emit(RunStage::Finishing, None);
        let Some(handle) = self.handle.as_mut() else {
            return Err(RunError::InvalidPhase {
                phase: RunPhase::Finish,
                status: previous,
            });
        };
        let code = handle.finish();
        self.forward_messages();
        check("finish", code, previous)?;

        debug!(
            model = self.model.name(),
            statistics = ?self.statistics,
            "engine finished"
        );
        Ok(())
    }

    /// Run one phase; any error or panic fails the run and releases the engine.
    fn guarded(
        &mut self,
        phase: RunPhase,
        step: impl FnOnce(&mut Self) -> RunResult<()>,
    ) -> RunResult<()> {
        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| step(self)));
        self.statistics.record(phase, started.elapsed());

        let result = match outcome {
            Ok(result) => result,
            Err(payload) => Err(RunError::Panicked {
                phase,
                message: panic_message(&*payload),
            }),
        };
        if let Err(err) = &result {
            self.fail(phase, err);
        }
        result
    }

    fn fail(&mut self, phase: RunPhase, err: &RunError) {
        error!(model = self.model.name(), %phase, error = %err, "model run failed");
        self.forward_messages();
        self.status = ModelStatus::Failed;
        self.release_engine();
        self.emit(RunStage::Failed, Some(err.to_string()));
    }

    fn release_engine(&mut self) {
        self.forward_messages();
        let Some(mut handle) = self.handle.take() else {
            return;
        };
        match handle.dispose() {
            DisposeOutcome::Clean | DisposeOutcome::AlreadyDisposed => {
                debug!(model = self.model.name(), "engine released");
            }
            DisposeOutcome::ForcedAfterTimeout => {
                warn!(model = self.model.name(), "engine worker was killed after the grace period");
            }
            DisposeOutcome::Faulted(message) => {
                warn!(model = self.model.name(), %message, "engine release faulted");
            }
        }
    }

    fn import_output(&mut self, output_dir: &std::path::Path) -> RunResult<()> {
        self.model.connect_output(output_dir)?;
        let log_path = self.model.export_directory().join(RUN_LOG_FILE_NAME);
        match read_run_log(&log_path)? {
            Some(log) => {
                debug!(path = %log_path.display(), bytes = log.len(), "imported run log");
                self.model.set_run_log(log);
            }
            None => debug!(path = %log_path.display(), "no run log written"),
        }
        Ok(())
    }

    /// Drain engine messages into the sink, skipping the empty sentinel.
    fn forward_messages(&mut self) {
        let Some(handle) = self.handle.as_mut() else {
            return;
        };
        let model = self.model.name();
        for line in handle.drain_messages() {
            if line.is_empty() {
                continue;
            }
            self.services.sink.forward(model, &line);
            self.statistics.messages_forwarded += 1;
        }
    }

    fn emit(&mut self, stage: RunStage, message: Option<String>) {
        if self.progress.is_none() {
            return;
        }
        let fraction_complete = match (&self.handle, self.status) {
            (_, ModelStatus::Done) => 1.0,
            (Some(handle), _) if handle.timeline().is_captured() => {
                handle.timeline().fraction_complete()
            }
            _ => 0.0,
        };
        let event = RunProgressEvent {
            stage,
            status: self.status,
            current_time: self.current_time,
            fraction_complete,
            elapsed_wall_s: self.started.elapsed().as_secs_f64(),
            message,
        };
        if let Some(callback) = self.progress.as_mut() {
            callback(&event);
        }
    }
}

impl Drop for RunContext<'_> {
    fn drop(&mut self) {
        self.release_engine();
    }
}

fn check(call: &'static str, code: ReturnCode, previous_status: ModelStatus) -> RunResult<()> {
    if code.is_success() {
        Ok(())
    } else {
        Err(RunError::EngineCall {
            call,
            previous_status,
            code,
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
