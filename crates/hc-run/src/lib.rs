//! Run orchestration: sequence validation, export, config generation,
//! backend creation and the engine lifecycle for one coupled model, and map
//! failures to model status.

pub mod error;
pub mod model;
pub mod orchestrator;
pub mod progress;
pub mod run_log;
pub mod settings;
pub mod sink;

pub use error::{RunError, RunResult};
pub use model::{CoupledModel, ModelExporter, ModelValidator, Severity, ValidationReport};
pub use orchestrator::{CONFIG_FILE_NAME, RunContext, RunServices};
pub use progress::{RunPhase, RunProgressEvent, RunStage, RunStatistics};
pub use run_log::{RUN_LOG_FILE_NAME, read_run_log};
pub use settings::RunSettings;
pub use sink::{MessageSink, TracingSink};
