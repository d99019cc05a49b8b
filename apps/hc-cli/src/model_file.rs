//! Model description file and the file-backed collaborators used by `run`.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use hc_config::ComponentSpec;
use hc_run::{
    CoupledModel, ModelExporter, ModelValidator, RunError, RunResult, Severity, ValidationReport,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// YAML description of one coupled model.
///
/// Relative paths are resolved against the file's directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelFile {
    pub name: String,
    pub library: String,
    /// Engine working directory inside the export directory.
    pub directory: String,
    pub input_file: String,
    /// Directory holding the model's input files.
    pub source_dir: PathBuf,
    pub export_dir: PathBuf,
    pub reference_date: NaiveDateTime,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

impl ModelFile {
    pub fn load(path: &Path) -> RunResult<Self> {
        let content = fs::read_to_string(path).map_err(|source| RunError::SettingsRead {
            path: path.to_path_buf(),
            source,
        })?;
        let mut model: ModelFile =
            serde_yaml::from_str(&content).map_err(|source| RunError::SettingsFormat {
                path: path.to_path_buf(),
                source,
            })?;
        let base = path.parent().unwrap_or(Path::new(""));
        model.source_dir = base.join(&model.source_dir);
        model.export_dir = base.join(&model.export_dir);
        model.output_dir = model.output_dir.map(|dir| base.join(dir));
        Ok(model)
    }

    pub fn component_spec(&self) -> ComponentSpec {
        ComponentSpec {
            name: self.name.clone(),
            library: self.library.clone(),
            working_dir: self.directory.clone(),
            input_file: self.input_file.clone(),
        }
    }
}

/// A [`ModelFile`] plus what a run attaches to it.
#[derive(Debug)]
pub struct FileModel {
    pub file: ModelFile,
    pub connected_output: Option<PathBuf>,
    pub run_log: Option<String>,
}

impl FileModel {
    pub fn new(file: ModelFile) -> Self {
        Self {
            file,
            connected_output: None,
            run_log: None,
        }
    }
}

impl CoupledModel for FileModel {
    fn name(&self) -> &str {
        &self.file.name
    }

    fn library_name(&self) -> &str {
        &self.file.library
    }

    fn directory_name(&self) -> &str {
        &self.file.directory
    }

    fn input_file(&self) -> &str {
        &self.file.input_file
    }

    fn export_directory(&self) -> &Path {
        &self.file.export_dir
    }

    fn output_directory(&self) -> PathBuf {
        match &self.file.output_dir {
            Some(dir) => dir.clone(),
            None => self.file.export_dir.join(&self.file.directory).join("output"),
        }
    }

    fn reference_date(&self) -> NaiveDateTime {
        self.file.reference_date
    }

    fn connect_output(&mut self, output_dir: &Path) -> RunResult<()> {
        let files = fs::read_dir(output_dir)?.count();
        info!(dir = %output_dir.display(), files, "connected model output");
        self.connected_output = Some(output_dir.to_path_buf());
        Ok(())
    }

    fn disconnect_output(&mut self) {
        self.connected_output = None;
    }

    fn set_run_log(&mut self, log: String) {
        self.run_log = Some(log);
    }
}

/// Checks that the model's inputs are present.
pub struct BasicValidator;

impl ModelValidator for BasicValidator {
    fn validate(&self, model: &dyn CoupledModel) -> ValidationReport {
        let mut report = ValidationReport::ok();
        if model.name().trim().is_empty() {
            report.push(Severity::Error, "model name is empty");
        }
        if model.library_name().trim().is_empty() {
            report.push(Severity::Error, "engine library is empty");
        }
        if model.input_file().trim().is_empty() {
            report.push(Severity::Error, "input file is empty");
        }
        if model.directory_name().trim().is_empty() {
            report.push(
                Severity::Warning,
                "working directory is empty; the engine runs in the export directory",
            );
        }
        report
    }
}

/// Copies a source directory into `<export>/<directory>`.
pub struct DirectoryExporter {
    source_dir: PathBuf,
}

impl DirectoryExporter {
    pub fn new(source_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_dir: source_dir.into(),
        }
    }
}

impl ModelExporter for DirectoryExporter {
    fn export(&self, model: &dyn CoupledModel, directory: &Path) -> RunResult<()> {
        let input = self.source_dir.join(model.input_file());
        if !input.is_file() {
            return Err(RunError::Export {
                message: format!("input file {} does not exist", input.display()),
            });
        }
        let target = directory.join(model.directory_name());
        let copied = copy_dir(&self.source_dir, &target)?;
        info!(
            from = %self.source_dir.display(),
            to = %target.display(),
            files = copied,
            "exported model"
        );
        Ok(())
    }
}

fn copy_dir(from: &Path, to: &Path) -> std::io::Result<usize> {
    fs::create_dir_all(to)?;
    let mut copied = 0;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copied += copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
            debug!(file = %target.display(), "copied");
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODEL_YAML: &str = "\
name: Flow1
library: dflowfm
directory: dflowfm
input_file: flow.mdu
source_dir: input
export_dir: export
reference_date: 2026-03-01T00:00:00
";

    #[test]
    fn load_resolves_relative_paths() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("model.yaml");
        fs::write(&path, MODEL_YAML).unwrap();

        let model = ModelFile::load(&path).unwrap();
        assert_eq!(model.source_dir, temp.path().join("input"));
        assert_eq!(model.export_dir, temp.path().join("export"));
        assert_eq!(model.output_dir, None);
        assert_eq!(model.component_spec().working_dir, "dflowfm");
    }

    #[test]
    fn exporter_copies_tree() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("model.yaml");
        fs::write(&path, MODEL_YAML).unwrap();
        let source = temp.path().join("input");
        fs::create_dir_all(source.join("grids")).unwrap();
        fs::write(source.join("flow.mdu"), "[geometry]\n").unwrap();
        fs::write(source.join("grids").join("net.nc"), "grid").unwrap();

        let model = FileModel::new(ModelFile::load(&path).unwrap());
        DirectoryExporter::new(&source)
            .export(&model, &model.file.export_dir)
            .unwrap();

        let work = temp.path().join("export").join("dflowfm");
        assert!(work.join("flow.mdu").is_file());
        assert!(work.join("grids").join("net.nc").is_file());
    }

    #[test]
    fn exporter_requires_input_file() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("model.yaml");
        fs::write(&path, MODEL_YAML).unwrap();
        fs::create_dir_all(temp.path().join("input")).unwrap();

        let model = FileModel::new(ModelFile::load(&path).unwrap());
        let err = DirectoryExporter::new(temp.path().join("input"))
            .export(&model, &model.file.export_dir)
            .unwrap_err();
        assert!(matches!(err, RunError::Export { .. }));
    }

    #[test]
    fn validator_flags_empty_fields() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("model.yaml");
        fs::write(&path, MODEL_YAML.replace("library: dflowfm", "library: ''")).unwrap();

        let model = FileModel::new(ModelFile::load(&path).unwrap());
        let report = BasicValidator.validate(&model);
        assert!(report.is_error());
        assert_eq!(report.issues, vec!["engine library is empty".to_string()]);
    }
}
