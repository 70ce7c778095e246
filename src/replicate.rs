//! The single call every replication script makes.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::{ReplicationError, Result};
use crate::estimation::LinearEstimator;
use crate::estimator::{Estimator, FittedModel};
use crate::replicator::{ReplicationRequest, Replicator};

/// Output and fitting switches for [`replicate`].
#[derive(Clone, Debug, Default)]
pub struct ReplicateOptions {
    /// Persist the result bundle after fitting.
    pub output: bool,
    /// Root of the bundle tree; required when `output` is set.
    pub output_dir: Option<PathBuf>,
    /// Replace an existing bundle for the same key.
    pub overwrite: bool,
    /// Also fit PPML. Off by default: it is not meaningful for every design.
    pub fit_ppml: bool,
    /// Also run the estimator's full-model fit.
    pub fit_full_model: bool,
}

impl ReplicateOptions {
    /// Enables persistence under `dir`.
    pub fn with_output(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output = true;
        self.output_dir = Some(dir.into());
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn with_ppml(mut self, fit_ppml: bool) -> Self {
        self.fit_ppml = fit_ppml;
        self
    }

    pub fn with_full_model(mut self, fit_full_model: bool) -> Self {
        self.fit_full_model = fit_full_model;
        self
    }

    fn destination(&self) -> Result<Option<&Path>> {
        match (self.output, self.output_dir.as_deref()) {
            (false, _) => Ok(None),
            (true, Some(dir)) => Ok(Some(dir)),
            (true, None) => Err(ReplicationError::MissingOutputDir),
        }
    }
}

/// Everything a replication produced.
#[derive(Debug)]
pub struct Replication<E: Estimator = LinearEstimator> {
    pub replicator: Replicator<E>,
    pub ols: FittedModel,
    pub ppml: Option<FittedModel>,
    /// Full-model fit, when requested.
    pub full: Option<FittedModel>,
    /// Bundle directory, when output was requested.
    pub bundle: Option<PathBuf>,
}

/// Fits with the built-in estimator and prints summaries to stdout.
pub fn replicate(request: ReplicationRequest, options: &ReplicateOptions) -> Result<Replication> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    replicate_with::<LinearEstimator, _>(request, options, &mut out)
}

/// Fits with estimator `E`, writing summaries and notices to `out`.
///
/// The OLS fit always runs and its summary is written before anything is
/// persisted. PPML runs only when `options.fit_ppml` is set, and the
/// estimator's full-model fit only when `options.fit_full_model` is set.
pub fn replicate_with<E, W>(
    request: ReplicationRequest,
    options: &ReplicateOptions,
    out: &mut W,
) -> Result<Replication<E>>
where
    E: Estimator,
    W: Write,
{
    let destination = options.destination()?.map(Path::to_path_buf);

    let mut replicator = Replicator::<E>::with_estimator(request)?;
    let outcome = replicator.design().y_label().to_string();
    let names = replicator.design().x_labels().to_vec();

    let ols = replicator.fit_ols()?.clone();
    let summary = ols.summary(&outcome, &names)?;
    write_block(out, "OLS results:", &summary)?;
    let mut reported = flush_notices(out, &replicator, 0)?;

    let ppml = if options.fit_ppml {
        let ppml = replicator.fit_ppml()?.clone();
        let summary = ppml.summary(&outcome, &names)?;
        write_block(out, "PPML results:", &summary)?;
        reported = flush_notices(out, &replicator, reported)?;
        Some(ppml)
    } else {
        None
    };
    let full = if options.fit_full_model {
        let full = replicator.fit_full()?.clone();
        let summary = full.summary(&outcome, &names)?;
        write_block(out, "Full model results:", &summary)?;
        reported = flush_notices(out, &replicator, reported)?;
        Some(full)
    } else {
        None
    };
    debug_assert_eq!(reported, replicator.notices().len());

    let bundle = match destination {
        Some(dir) => {
            let path = replicator.persist(&dir, options.overwrite)?;
            writeln!(out, "Result saved to {}", path.display()).map_err(console_error)?;
            Some(path)
        }
        None => None,
    };

    Ok(Replication {
        replicator,
        ols,
        ppml,
        full,
        bundle,
    })
}

fn write_block<W: Write>(out: &mut W, title: &str, body: &impl std::fmt::Display) -> Result<()> {
    writeln!(out, "{title}").map_err(console_error)?;
    write!(out, "{body}").map_err(console_error)
}

/// Prints notices raised since the `already` first ones; returns the new total.
fn flush_notices<E: Estimator, W: Write>(
    out: &mut W,
    replicator: &Replicator<E>,
    already: usize,
) -> Result<usize> {
    let notices = replicator.notices();
    for notice in &notices[already..] {
        writeln!(out, "WARNING: {notice}").map_err(console_error)?;
    }
    Ok(notices.len())
}

fn console_error(err: io::Error) -> ReplicationError {
    ReplicationError::io(Path::new("<console>"), err)
}
