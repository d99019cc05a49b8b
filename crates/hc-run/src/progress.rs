use std::fmt;
use std::time::Duration;

use chrono::NaiveDateTime;
use hc_core::ModelStatus;

/// Orchestrator entry points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunPhase {
    Initialize,
    Execute,
    Finish,
    Cleanup,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Initialize => "initialize",
            RunPhase::Execute => "execute",
            RunPhase::Finish => "finish",
            RunPhase::Cleanup => "cleanup",
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStage {
    Validating,
    Exporting,
    WritingConfig,
    CreatingBackend,
    InitializingEngine,
    Stepping,
    Finishing,
    CleaningUp,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct RunProgressEvent {
    pub stage: RunStage,
    pub status: ModelStatus,
    pub current_time: Option<NaiveDateTime>,
    pub fraction_complete: f64,
    pub elapsed_wall_s: f64,
    pub message: Option<String>,
}

/// Wall-clock time spent per phase plus engine step counts.
#[derive(Debug, Clone, Default)]
pub struct RunStatistics {
    pub initialize_time: Duration,
    pub execute_time: Duration,
    pub finish_time: Duration,
    pub cleanup_time: Duration,
    pub update_calls: usize,
    pub messages_forwarded: usize,
}

impl RunStatistics {
    pub fn record(&mut self, phase: RunPhase, elapsed: Duration) {
        match phase {
            RunPhase::Initialize => self.initialize_time += elapsed,
            RunPhase::Execute => self.execute_time += elapsed,
            RunPhase::Finish => self.finish_time += elapsed,
            RunPhase::Cleanup => self.cleanup_time += elapsed,
        }
    }

    pub fn total_time(&self) -> Duration {
        self.initialize_time + self.execute_time + self.finish_time + self.cleanup_time
    }

    /// Mean wall time per update call.
    pub fn mean_update_time(&self) -> Option<Duration> {
        u32::try_from(self.update_calls)
            .ok()
            .filter(|&n| n > 0)
            .map(|n| self.execute_time / n)
    }
}
