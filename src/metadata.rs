//! Replication metadata: the caller-supplied record and the persisted document.

use serde::{Deserialize, Serialize};

use crate::error::{ReplicationError, Result};
use crate::options::{EstimatorOptions, FitOptions, OlsOptions, PpmlOptions};
use crate::selection::ColumnRef;

/// Keys that must be present before a result can be persisted.
pub const REQUIRED_KEYS: [&str; 4] = ["paper_id", "table_id", "panel_identifier", "model_type"];

/// Identifies which published result a regression reproduces.
///
/// Validation is deferred to save time: exploratory fits may carry an
/// incomplete record.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub paper_id: Option<String>,
    pub table_id: Option<String>,
    pub panel_identifier: Option<String>,
    pub model_type: Option<String>,
    pub comments: Option<String>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn paper_id(mut self, value: impl Into<String>) -> Self {
        self.paper_id = Some(value.into());
        self
    }

    pub fn table_id(mut self, value: impl Into<String>) -> Self {
        self.table_id = Some(value.into());
        self
    }

    pub fn panel_identifier(mut self, value: impl Into<String>) -> Self {
        self.panel_identifier = Some(value.into());
        self
    }

    pub fn model_type(mut self, value: impl Into<String>) -> Self {
        self.model_type = Some(value.into());
        self
    }

    pub fn comments(mut self, value: impl Into<String>) -> Self {
        self.comments = Some(value.into());
        self
    }

    /// Required keys that are absent or blank, in canonical order.
    pub fn missing_keys(&self) -> Vec<&'static str> {
        let values = [
            &self.paper_id,
            &self.table_id,
            &self.panel_identifier,
            &self.model_type,
        ];
        REQUIRED_KEYS
            .iter()
            .zip(values)
            .filter(|(_, value)| value.as_deref().map_or(true, |v| v.trim().is_empty()))
            .map(|(key, _)| *key)
            .collect()
    }

    /// Checks that every required key is present.
    pub fn validate(&self) -> Result<ValidatedMetadata> {
        let missing = self.missing_keys();
        if !missing.is_empty() {
            return Err(ReplicationError::MissingMetadata { keys: missing });
        }
        let take = |value: &Option<String>| value.clone().unwrap_or_default();
        Ok(ValidatedMetadata {
            paper_id: take(&self.paper_id),
            table_id: take(&self.table_id),
            panel_identifier: take(&self.panel_identifier),
            model_type: take(&self.model_type),
            comments: take(&self.comments),
        })
    }
}

impl<K, V> FromIterator<(K, V)> for Metadata
where
    K: AsRef<str>,
    V: Into<String>,
{
    /// Builds metadata from key/value pairs; unrecognised keys are ignored.
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut metadata = Metadata::default();
        for (key, value) in iter {
            let slot = match key.as_ref() {
                "paper_id" => &mut metadata.paper_id,
                "table_id" => &mut metadata.table_id,
                "panel_identifier" => &mut metadata.panel_identifier,
                "model_type" => &mut metadata.model_type,
                "comments" => &mut metadata.comments,
                other => {
                    log::debug!("ignoring unrecognised metadata key `{other}`");
                    continue;
                }
            };
            *slot = Some(value.into());
        }
        metadata
    }
}

/// Metadata with every required key present.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatedMetadata {
    pub paper_id: String,
    pub table_id: String,
    pub panel_identifier: String,
    pub model_type: String,
    pub comments: String,
}

/// The `metadata.json` document written next to the tabular dumps.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetadataDocument {
    pub paper_id: String,
    pub table_id: String,
    pub panel_identifier: String,
    pub model_type: String,
    pub elasticity: bool,
    pub interest: Vec<ColumnRef>,
    pub comments: String,
    pub kwargs_estimator: EstimatorOptions,
    pub kwargs_ols: OlsOptions,
    pub kwargs_ppml: PpmlOptions,
    #[serde(default)]
    pub kwargs_fit: FitOptions,
    /// RFC 3339 UTC timestamp of the save.
    pub time: String,
    pub nobs: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fe: Option<Vec<ColumnRef>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endogenous_regressors: Option<Vec<ColumnRef>>,
    /// Distinct cluster groups; recorded whether or not clustering was honoured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<Vec<String>>,
}
