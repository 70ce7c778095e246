//! Project directory settings shared by replication scripts.
//!
//! Settings are read from a YAML document (conventionally `config.yaml` in the
//! working directory). Every key is optional and falls back to the defaults
//! below, so a missing file is equivalent to an empty one.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ReplicationError, Result};

/// Conventional location of the settings document.
pub const DEFAULT_SETTINGS_FILE: &str = "config.yaml";

/// Directory layout used by replication scripts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Untouched source datasets.
    #[serde(default = "default_rawdata")]
    pub rawdata: PathBuf,
    /// Cleaned datasets produced by preprocessing scripts.
    #[serde(default = "default_intermediatedata")]
    pub intermediatedata: PathBuf,
    /// Analysis-ready datasets.
    #[serde(default = "default_finaldata")]
    pub finaldata: PathBuf,
    /// Root for result bundles and JSON exports.
    #[serde(default = "default_output", alias = "outputdata")]
    pub output: PathBuf,
}

fn default_rawdata() -> PathBuf {
    PathBuf::from("./rawdata")
}

fn default_intermediatedata() -> PathBuf {
    PathBuf::from("./intermediate_data")
}

fn default_finaldata() -> PathBuf {
    PathBuf::from("./final_data")
}

fn default_output() -> PathBuf {
    PathBuf::from("./output")
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            rawdata: default_rawdata(),
            intermediatedata: default_intermediatedata(),
            finaldata: default_finaldata(),
            output: default_output(),
        }
    }
}

impl Settings {
    /// Parses settings from a YAML file that must exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|err| ReplicationError::io(path, err))?;
        Self::from_yaml_str(&text)
    }

    /// Parses settings from a YAML file, using defaults when the file is absent.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            log::debug!(
                "settings file {} not found; using default directories",
                path.display()
            );
            Ok(Self::default())
        }
    }

    /// Parses settings from YAML text. An empty document yields the defaults.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    /// Overrides the output root.
    pub fn with_output(mut self, output: impl Into<PathBuf>) -> Self {
        self.output = output.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_document_keeps_defaults() {
        let settings = Settings::from_yaml_str("rawdata: /data/raw\n").unwrap();
        assert_eq!(settings.rawdata, PathBuf::from("/data/raw"));
        assert_eq!(settings.output, PathBuf::from("./output"));
        assert_eq!(settings.finaldata, PathBuf::from("./final_data"));
    }

    #[test]
    fn outputdata_is_accepted_for_output() {
        let settings = Settings::from_yaml_str("outputdata: results\n").unwrap();
        assert_eq!(settings.output, PathBuf::from("results"));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load_or_default(dir.path().join("config.yaml")).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn load_requires_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = Settings::load(dir.path().join("absent.yaml"));
        assert!(matches!(result, Err(ReplicationError::Io { .. })));
    }
}
