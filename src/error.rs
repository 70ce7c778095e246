use std::path::{Path, PathBuf};

use thiserror::Error;

/// Unified error type for `replrs` operations.
#[derive(Debug, Error)]
pub enum ReplicationError {
    /// Raised when provided arrays or matrices have incompatible dimensions.
    #[error("dimension mismatch in {context}: expected {expected} but found {found}")]
    DimensionMismatch {
        /// Human-readable context describing the operation.
        context: &'static str,
        /// The required dimension, usually the number of observations.
        expected: usize,
        /// The dimension that was actually supplied.
        found: usize,
    },

    /// Raised when a column label does not name any regressor.
    #[error("column `{label}` is not present in {context}")]
    UnknownColumn { context: &'static str, label: String },

    /// Raised when a column position is past the last regressor.
    #[error("column position {position} is out of range for {context} with {ncols} columns")]
    ColumnOutOfRange {
        context: &'static str,
        position: usize,
        ncols: usize,
    },

    /// Raised when a regressor is named both as a fixed effect and as an estimated column.
    #[error("column `{label}` is absorbed as a fixed effect and cannot be used as {context}")]
    AbsorbedColumn { context: &'static str, label: String },

    /// Raised when exactly one of `endog_x` and `z` was supplied.
    #[error("endogenous regressors and instruments must be supplied together ({detail})")]
    InstrumentMismatch { detail: &'static str },

    /// Raised when the instrumented design is under-identified.
    #[error("{instruments} excluded instruments cannot identify {endogenous} endogenous regressors")]
    UnderIdentified {
        endogenous: usize,
        instruments: usize,
    },

    /// Raised when cluster-robust covariance is requested without group codes.
    #[error("cluster covariance requested but no cluster groups were supplied")]
    MissingClusterGroups,

    /// Raised when a backend cannot fit the requested combination.
    #[error("{feature} is not supported by this estimator")]
    Unsupported { feature: &'static str },

    /// Raised when an observation weight is negative or not finite.
    #[error("weight at index {index} must be finite and non-negative, found {weight}")]
    InvalidWeight { index: usize, weight: f64 },

    /// Raised when a log-linear fit meets an outcome that has no logarithm.
    #[error("outcome at index {index} must be positive for a log-linear fit, found {value}")]
    NonPositiveOutcome { index: usize, value: f64 },

    /// Raised when a Poisson fit meets a negative outcome.
    #[error("outcome at index {index} must be non-negative for PPML, found {value}")]
    NegativeOutcome { index: usize, value: f64 },

    /// Raised when output was requested without a destination.
    #[error("output was requested but no output directory was configured")]
    MissingOutputDir,

    /// Raised when persisting a result the caller has not accepted.
    #[error("refusing to persist: result is not marked as replicated")]
    NotReplicated,

    /// Raised when required metadata keys are absent at save time.
    #[error("metadata is missing required keys: {}", keys.join(", "))]
    MissingMetadata { keys: Vec<&'static str> },

    /// Raised when a result bundle already exists and overwrite was not requested.
    #[error("a replication result already exists at {}; pass overwrite to replace it", path.display())]
    ResultExists { path: PathBuf },

    /// Raised when persisting before any model has been fitted.
    #[error("no fitted model is available to persist")]
    NotFitted,

    /// Raised when linear algebra operations encounter a singular system.
    #[error("matrix in {context} is singular")]
    SingularMatrix { context: &'static str },

    /// Raised when the iteratively reweighted least squares loop fails to meet the tolerance.
    #[error("PPML did not converge after {iterations} iterations; last deviance change {change}")]
    DidNotConverge { iterations: usize, change: f64 },

    /// Raised when numerical routines produce NaN or infinities.
    #[error("encountered a non-finite value during {context}")]
    NumericalError { context: &'static str },

    /// Filesystem failures, tagged with the path that was touched.
    #[error("i/o error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Raised when a persisted bundle cannot be parsed back.
    #[error("malformed bundle file {}: {detail}", path.display())]
    MalformedBundle { path: PathBuf, detail: String },
}

impl ReplicationError {
    /// Helper to format a [`DimensionMismatch`](ReplicationError::DimensionMismatch) error.
    pub fn dimension_mismatch(context: &'static str, expected: usize, found: usize) -> Self {
        Self::DimensionMismatch {
            context,
            expected,
            found,
        }
    }

    /// Helper to raise when a matrix factorization fails due to singularity.
    pub fn singular(context: &'static str) -> Self {
        Self::SingularMatrix { context }
    }

    /// Attaches the offending path to an I/O error.
    pub fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Type alias for results returned by this crate.
pub type Result<T> = std::result::Result<T, ReplicationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_metadata_lists_every_key() {
        let err = ReplicationError::MissingMetadata {
            keys: vec!["table_id", "model_type"],
        };
        assert_eq!(
            err.to_string(),
            "metadata is missing required keys: table_id, model_type"
        );
    }
}
