//! Run settings file.

use std::fs;
use std::path::Path;

use hc_engine::EngineSettings;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{RunError, RunResult};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    pub engine: EngineSettings,
    /// Run the engine in a worker process even when it could load in-process.
    pub prefer_remote: bool,
}

impl RunSettings {
    pub fn load_yaml(path: &Path) -> RunResult<Self> {
        let content = fs::read_to_string(path).map_err(|source| RunError::SettingsRead {
            path: path.to_path_buf(),
            source,
        })?;
        let settings = Self::from_yaml_str(&content).map_err(|source| RunError::SettingsFormat {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), prefer_remote = settings.prefer_remote, "loaded run settings");
        Ok(settings)
    }

    /// An empty document yields the defaults.
    pub fn from_yaml_str(content: &str) -> Result<Self, serde_yaml::Error> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }

    pub fn save_yaml(&self, path: &Path) -> RunResult<()> {
        let content = serde_yaml::to_string(self).map_err(|source| RunError::SettingsFormat {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, content)?;
        Ok(())
    }
}
