//! Collaborators consumed by the orchestrator.
//!
//! The model object, its validation rules and its file export live outside
//! this crate; only these contracts are used here.

use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;

use crate::error::RunResult;

/// A model that runs on the coupled engine.
pub trait CoupledModel {
    /// Component name; also the controlling reference in the config document.
    fn name(&self) -> &str;

    fn library_name(&self) -> &str;

    /// Engine working directory, relative to the export directory.
    fn directory_name(&self) -> &str;

    /// Input file, relative to the working directory.
    fn input_file(&self) -> &str;

    fn export_directory(&self) -> &Path;

    /// Where the engine writes output.
    fn output_directory(&self) -> PathBuf {
        self.export_directory()
            .join(self.directory_name())
            .join("output")
    }

    /// Calendar instant of engine offset zero.
    fn reference_date(&self) -> NaiveDateTime;

    fn connect_output(&mut self, output_dir: &Path) -> RunResult<()>;

    fn disconnect_output(&mut self);

    /// Receives the run log imported at cleanup.
    fn set_run_log(&mut self, log: String);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub severity: Severity,
    pub issues: Vec<String>,
}

impl ValidationReport {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn with_issue(severity: Severity, issue: impl Into<String>) -> Self {
        Self {
            severity,
            issues: vec![issue.into()],
        }
    }

    /// Add an issue, raising the severity if needed.
    pub fn push(&mut self, severity: Severity, issue: impl Into<String>) {
        self.severity = self.severity.max(severity);
        self.issues.push(issue.into());
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

pub trait ModelValidator {
    fn validate(&self, model: &dyn CoupledModel) -> ValidationReport;
}

/// Writes the model's input files into a directory.
pub trait ModelExporter {
    fn export(&self, model: &dyn CoupledModel, directory: &Path) -> RunResult<()>;
}
