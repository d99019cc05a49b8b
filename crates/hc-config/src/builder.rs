//! Build, save and load config documents.

use std::fs;
use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tracing::debug;

use crate::document::{ComponentRecord, ConfigDocument, Control, Documentation, StartRef};
use crate::{ConfigError, ConfigResult};

pub const FILE_VERSION: &str = "1.2";
pub const DEFAULT_CREATOR: &str = "hydrocouple";
pub const NAMESPACE: &str = "http://schemas.deltares.nl/dimr";
pub const XSI_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema-instance";
pub const SCHEMA_LOCATION: &str =
    "http://schemas.deltares.nl/dimr https://content.oss.deltares.nl/schemas/dimr-1.2.xsd";

const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#;

/// What the engine needs to know about the component it runs.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentSpec {
    pub name: String,
    pub library: String,
    pub working_dir: String,
    pub input_file: String,
}

#[derive(Debug, Clone)]
pub struct ConfigDocumentBuilder {
    created_by: String,
}

impl Default for ConfigDocumentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigDocumentBuilder {
    pub fn new() -> Self {
        Self {
            created_by: DEFAULT_CREATOR.to_string(),
        }
    }

    pub fn with_creator(mut self, created_by: impl Into<String>) -> Self {
        self.created_by = created_by.into();
        self
    }

    /// One controlling reference and one component record, both named after the component.
    pub fn build(&self, spec: &ComponentSpec) -> ConfigDocument {
        ConfigDocument {
            namespace: NAMESPACE.to_string(),
            xsi_namespace: XSI_NAMESPACE.to_string(),
            schema_location: SCHEMA_LOCATION.to_string(),
            documentation: Documentation {
                file_version: FILE_VERSION.to_string(),
                created_by: self.created_by.clone(),
                creation_date: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            },
            control: Control {
                start: StartRef {
                    name: spec.name.clone(),
                },
            },
            component: ComponentRecord {
                name: spec.name.clone(),
                library: spec.library.clone(),
                working_dir: spec.working_dir.clone(),
                input_file: spec.input_file.clone(),
            },
        }
    }

    /// Write `document` to `path`, replacing any existing file.
    ///
    /// `output_dir` is created first if missing.
    pub fn save(
        &self,
        path: &Path,
        document: &ConfigDocument,
        output_dir: &Path,
    ) -> ConfigResult<()> {
        document.validate()?;

        fs::create_dir_all(output_dir).map_err(|source| ConfigError::Io {
            path: output_dir.to_path_buf(),
            source,
        })?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        if path.exists() {
            fs::remove_file(path).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        }

        let content = to_xml_string(document)?;
        fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        debug!(path = %path.display(), component = %document.component.name, "wrote config document");
        Ok(())
    }
}

/// Serialize with declaration and two-space indentation.
pub fn to_xml_string(document: &ConfigDocument) -> ConfigResult<String> {
    let mut body = String::new();
    let mut serializer = quick_xml::se::Serializer::new(&mut body);
    serializer.indent(' ', 2);
    document.serialize(serializer)?;

    let mut content = String::with_capacity(XML_DECLARATION.len() + body.len() + 2);
    content.push_str(XML_DECLARATION);
    content.push('\n');
    content.push_str(&body);
    content.push('\n');
    Ok(content)
}

pub fn load_document(path: &Path) -> ConfigResult<ConfigDocument> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let document: ConfigDocument = quick_xml::de::from_str(&content)?;
    Ok(document)
}
