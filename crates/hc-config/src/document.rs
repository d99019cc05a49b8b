//! Config document schema definitions.

use serde::{Deserialize, Serialize};

use crate::{ConfigError, ConfigResult};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename = "dimrConfig")]
pub struct ConfigDocument {
    #[serde(rename = "@xmlns", default)]
    pub namespace: String,
    #[serde(rename = "@xmlns:xsi", default)]
    pub xsi_namespace: String,
    #[serde(rename = "@xsi:schemaLocation", default)]
    pub schema_location: String,
    pub documentation: Documentation,
    pub control: Control,
    pub component: ComponentRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Documentation {
    #[serde(rename = "fileVersion")]
    pub file_version: String,
    #[serde(rename = "createdBy")]
    pub created_by: String,
    #[serde(rename = "creationDate")]
    pub creation_date: String,
}

/// The controlling section: which component drives the time loop.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Control {
    pub start: StartRef,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StartRef {
    #[serde(rename = "@name")]
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComponentRecord {
    #[serde(rename = "@name")]
    pub name: String,
    pub library: String,
    #[serde(rename = "workingDir")]
    pub working_dir: String,
    #[serde(rename = "inputFile")]
    pub input_file: String,
}

impl ConfigDocument {
    /// Name of the controlling component.
    pub fn controlling_reference(&self) -> &str {
        &self.control.start.name
    }

    /// Check that the control section points at the component record.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.component.name.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "component.name",
                reason: "must not be empty".to_string(),
            });
        }
        if self.control.start.name != self.component.name {
            return Err(ConfigError::MismatchedControl {
                control: self.control.start.name.clone(),
                component: self.component.name.clone(),
            });
        }
        Ok(())
    }
}
