//! Reproducible replication of published regression results.
//!
//! Replication scripts load a dataset, rebuild the regression a paper reports
//! (controls, fixed effects, instruments, clustering, weights) and hand it to
//! this crate, which
//!
//! - validates and normalizes the inputs (`data`, `selection` modules),
//! - binds them to a fitting backend behind the [`Estimator`] trait
//!   (`estimator`, `estimation` modules),
//! - fits OLS and, on request, PPML while surfacing degraded-feature notices
//!   (`replicator`, `replicate` modules), and
//! - persists a result bundle or a per-paper JSON export (`bundle`, `json`
//!   modules).
//!
//! # Quick start
//!
//! ```no_run
//! use replrs::data::ReplicationDataBuilder;
//! use replrs::metadata::Metadata;
//! use replrs::{replicate, ReplicateOptions, ReplicationRequest};
//! use nalgebra::{DMatrix, DVector};
//!
//! let y = DVector::from_vec(vec![1.2, 1.9, 3.1, 4.2]);
//! let x = DMatrix::from_row_slice(4, 2, &[1.0, 0.1, 1.0, 0.4, 1.0, 0.9, 1.0, 1.3]);
//! let data = ReplicationDataBuilder::new(y, x)
//!     .labels(["const", "lttrans1921"])
//!     .build()
//!     .expect("aligned inputs");
//!
//! let metadata = Metadata::new()
//!     .paper_id("055")
//!     .table_id("1")
//!     .panel_identifier("A_1")
//!     .model_type("log-log");
//!
//! let request = ReplicationRequest::new(metadata, data, "lttrans1921")
//!     .elasticity(true)
//!     .replicated(true);
//! let options = ReplicateOptions::default()
//!     .with_output("./output")
//!     .with_overwrite(true);
//!
//! let replication = replicate(request, &options).expect("replicated");
//! println!("coefficient: {}", replication.ols.params[1]);
//! ```
//!
//! Bundles are written atomically but without cross-process locking; do not
//! save the same paper/table/panel key from two processes at once.

pub mod bundle;
pub mod config;
pub mod data;
pub mod error;
pub mod estimation;
pub mod estimator;
pub mod irls;
pub mod json;
pub mod metadata;
pub mod options;
pub mod replicate;
pub mod replicator;
pub mod selection;

pub use bundle::ResultBundle;
pub use config::Settings;
pub use error::{ReplicationError, Result};
pub use estimation::LinearEstimator;
pub use estimator::{CovarianceSpec, Estimator, EstimatorSpec, FittedModel};
pub use json::{ReplicationJsonBuilder, TableInput};
pub use options::{CovarianceType, FitOptions, OlsOptions, PpmlOptions, DEFAULT_COVARIANCE};
pub use replicate::{replicate, replicate_with, ReplicateOptions, Replication};
pub use replicator::{Notice, ReplicationRequest, Replicator, ReplicatorState};
pub use selection::{ColumnRef, ColumnSelection};
