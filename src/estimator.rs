//! The contract between the replication layer and a fitting backend.
//!
//! A backend is constructed once per regression from an [`EstimatorSpec`] and
//! exposes OLS and PPML fits that return a [`FittedModel`]. The orchestration
//! code only talks to the [`Estimator`] trait, so any linear-models library can
//! sit behind it. [`LinearEstimator`](crate::estimation::LinearEstimator) is the
//! implementation shipped with the crate.

use std::fmt;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};
use statrs::function::erf::erfc;

use crate::error::{ReplicationError, Result};
use crate::options::{CovarianceType, EstimatorOptions, FitOptions, PpmlOptions};

/// Everything a backend needs to bind itself to one regression.
#[derive(Clone, Debug)]
pub struct EstimatorSpec {
    /// Outcome in levels.
    pub y: DVector<f64>,
    /// Design matrix, including any constant and fixed-effect dummies.
    pub x: DMatrix<f64>,
    /// Positions in `x` of endogenous regressors.
    pub endogenous: Vec<usize>,
    /// Positions in `x` whose coefficients are being replicated.
    pub interest: Vec<usize>,
    /// Positions in `x` of fixed-effect columns.
    pub fixed_effects: Vec<usize>,
    /// Excluded instruments, row-aligned with `x`.
    pub instruments: Option<DMatrix<f64>>,
    /// Whether interest coefficients are read as elasticities.
    pub elasticity: bool,
    pub options: EstimatorOptions,
}

/// Covariance request handed to a fit.
#[derive(Clone, Copy, Debug)]
pub struct CovarianceSpec<'a> {
    pub cov_type: CovarianceType,
    /// Dense cluster codes, required when `cov_type` is [`CovarianceType::Cluster`].
    pub groups: Option<&'a [usize]>,
}

impl<'a> CovarianceSpec<'a> {
    pub fn new(cov_type: CovarianceType) -> Self {
        Self {
            cov_type,
            groups: None,
        }
    }

    pub fn clustered(groups: &'a [usize]) -> Self {
        Self {
            cov_type: CovarianceType::Cluster,
            groups: Some(groups),
        }
    }
}

/// A fitting backend bound to one regression specification.
pub trait Estimator: Sized {
    /// Validates the specification and binds the backend to it.
    fn new(spec: EstimatorSpec) -> Result<Self>;

    /// Least squares fit (two-stage when instruments are present).
    fn fit_ols(
        &self,
        weights: Option<&DVector<f64>>,
        covariance: &CovarianceSpec<'_>,
    ) -> Result<FittedModel>;

    /// Poisson pseudo-maximum-likelihood fit of the outcome in levels.
    fn fit_ppml(
        &self,
        weights: Option<&DVector<f64>>,
        covariance: &CovarianceSpec<'_>,
        options: &PpmlOptions,
    ) -> Result<FittedModel>;

    /// The backend's own full-model fit, beyond the OLS and PPML baselines.
    ///
    /// Backends without one report [`ReplicationError::Unsupported`].
    fn fit_full(
        &self,
        _weights: Option<&DVector<f64>>,
        _options: &FitOptions,
    ) -> Result<FittedModel> {
        Err(ReplicationError::Unsupported {
            feature: "full model fit",
        })
    }

    /// Whether [`CovarianceType::Cluster`] is computed rather than rejected.
    fn supports_clustering(&self) -> bool {
        false
    }
}

/// Which estimator produced a [`FittedModel`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FitMethod {
    #[serde(rename = "ols")]
    Ols,
    #[serde(rename = "2sls")]
    TwoStageLeastSquares,
    #[serde(rename = "ppml")]
    Ppml,
}

impl fmt::Display for FitMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FitMethod::Ols => f.write_str("OLS"),
            FitMethod::TwoStageLeastSquares => f.write_str("IV-2SLS"),
            FitMethod::Ppml => f.write_str("PPML"),
        }
    }
}

/// Coefficients and inference returned by a backend.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FittedModel {
    pub method: FitMethod,
    pub params: DVector<f64>,
    pub bse: DVector<f64>,
    pub covariance: DMatrix<f64>,
    pub cov_type: CovarianceType,
    pub nobs: usize,
    pub df_resid: f64,
    /// Centered R-squared of the least squares fit; `None` for PPML.
    pub r_squared: Option<f64>,
    /// Poisson deviance at the solution; `None` for least squares.
    pub deviance: Option<f64>,
    /// Number of IRLS iterations; zero for closed-form fits.
    pub iterations: usize,
    pub interest: Vec<usize>,
    pub fixed_effects: Vec<usize>,
    pub elasticity: bool,
}

/// The replicated coefficient for one interest regressor.
#[derive(Clone, Debug, PartialEq)]
pub struct InterestEstimate {
    pub index: usize,
    pub coefficient: f64,
    pub std_error: f64,
    pub p_value: f64,
}

impl FittedModel {
    pub fn params(&self) -> &DVector<f64> {
        &self.params
    }

    pub fn bse(&self) -> &DVector<f64> {
        &self.bse
    }

    /// Coefficient divided by its standard error.
    pub fn tvalues(&self) -> DVector<f64> {
        self.params.component_div(&self.bse)
    }

    /// Two-sided p-values: Student-t for least squares, normal for PPML.
    pub fn pvalues(&self) -> DVector<f64> {
        self.tvalues().map(|t| self.two_sided(t))
    }

    /// Estimates for the interest regressors, in the order they were named.
    pub fn interest(&self) -> Vec<InterestEstimate> {
        self.interest
            .iter()
            .map(|&index| InterestEstimate {
                index,
                coefficient: self.params[index],
                std_error: self.bse[index],
                p_value: self.two_sided(self.params[index] / self.bse[index]),
            })
            .collect()
    }

    /// Renders a coefficient table keyed by the supplied names.
    pub fn summary(&self, outcome_name: &str, regressor_names: &[String]) -> Result<Summary> {
        if regressor_names.len() != self.params.len() {
            return Err(ReplicationError::dimension_mismatch(
                "regressor names",
                self.params.len(),
                regressor_names.len(),
            ));
        }
        let critical = self.critical_value();
        let rows = (0..self.params.len())
            .filter(|index| !self.fixed_effects.contains(index))
            .map(|index| {
                let coef = self.params[index];
                let se = self.bse[index];
                let stat = coef / se;
                SummaryRow {
                    name: regressor_names[index].clone(),
                    coef,
                    std_err: se,
                    stat,
                    p_value: self.two_sided(stat),
                    lower: coef - critical * se,
                    upper: coef + critical * se,
                    interest: self.interest.contains(&index),
                }
            })
            .collect();

        Ok(Summary {
            method: self.method,
            outcome: outcome_name.to_string(),
            nobs: self.nobs,
            df_resid: self.df_resid,
            cov_type: self.cov_type,
            r_squared: self.r_squared,
            deviance: self.deviance,
            iterations: self.iterations,
            elasticity: self.elasticity,
            hidden_fixed_effects: self.fixed_effects.len(),
            rows,
        })
    }

    fn uses_normal(&self) -> bool {
        self.method == FitMethod::Ppml || self.df_resid <= 0.0
    }

    fn two_sided(&self, stat: f64) -> f64 {
        if !stat.is_finite() {
            return f64::NAN;
        }
        let tail = if self.uses_normal() {
            0.5 * erfc(stat.abs() / std::f64::consts::SQRT_2)
        } else {
            match StudentsT::new(0.0, 1.0, self.df_resid) {
                Ok(dist) => dist.cdf(-stat.abs()),
                Err(_) => return f64::NAN,
            }
        };
        2.0 * tail
    }

    fn critical_value(&self) -> f64 {
        if self.uses_normal() {
            NORMAL_CRITICAL_95
        } else {
            StudentsT::new(0.0, 1.0, self.df_resid)
                .map(|dist| dist.inverse_cdf(0.975))
                .unwrap_or(f64::NAN)
        }
    }
}

/// Two-sided 95% critical value of the standard normal.
const NORMAL_CRITICAL_95: f64 = 1.959_963_984_540_054;

/// Human-readable coefficient table.
#[derive(Clone, Debug)]
pub struct Summary {
    pub method: FitMethod,
    pub outcome: String,
    pub nobs: usize,
    pub df_resid: f64,
    pub cov_type: CovarianceType,
    pub r_squared: Option<f64>,
    pub deviance: Option<f64>,
    pub iterations: usize,
    pub elasticity: bool,
    pub hidden_fixed_effects: usize,
    pub rows: Vec<SummaryRow>,
}

#[derive(Clone, Debug)]
pub struct SummaryRow {
    pub name: String,
    pub coef: f64,
    pub std_err: f64,
    pub stat: f64,
    pub p_value: f64,
    pub lower: f64,
    pub upper: f64,
    pub interest: bool,
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "=".repeat(86);
        let thin = "-".repeat(86);
        let stat_label = if self.method == FitMethod::Ppml { "z" } else { "t" };

        writeln!(f, "{rule}")?;
        writeln!(f, "{:^86}", format!("{} Regression Results", self.method))?;
        writeln!(f, "{rule}")?;
        writeln!(
            f,
            "Dep. Variable: {:<24} No. Observations: {:>12}",
            self.outcome, self.nobs
        )?;
        writeln!(
            f,
            "Covariance:    {:<24} Df Residuals:     {:>12.0}",
            self.cov_type.to_string(),
            self.df_resid
        )?;
        match (self.r_squared, self.deviance) {
            (Some(r2), _) => writeln!(f, "R-squared:     {r2:<24.4}")?,
            (None, Some(deviance)) => writeln!(
                f,
                "Deviance:      {deviance:<24.4} Iterations:       {:>12}",
                self.iterations
            )?,
            (None, None) => {}
        }
        writeln!(f, "{rule}")?;
        writeln!(
            f,
            "{:<24} {:>10} {:>10} {:>8} {:>8} {:>10} {:>10}",
            "",
            "coef",
            "std err",
            stat_label,
            format!("P>|{stat_label}|"),
            "[0.025",
            "0.975]"
        )?;
        writeln!(f, "{thin}")?;
        for row in &self.rows {
            let marker = if row.interest { "*" } else { " " };
            writeln!(
                f,
                "{:<23}{} {:>10.4} {:>10.4} {:>8.3} {:>8.3} {:>10.4} {:>10.4}",
                truncate(&row.name, 23),
                marker,
                row.coef,
                row.std_err,
                row.stat,
                row.p_value,
                row.lower,
                row.upper
            )?;
        }
        writeln!(f, "{rule}")?;
        let reading = if self.elasticity {
            "elasticity"
        } else {
            "slope"
        };
        writeln!(f, "* variable of interest, reported as {reading}")?;
        if self.hidden_fixed_effects > 0 {
            writeln!(
                f,
                "{} fixed-effect columns estimated but not shown",
                self.hidden_fixed_effects
            )?;
        }
        Ok(())
    }
}

fn truncate(name: &str, width: usize) -> String {
    if name.chars().count() <= width {
        name.to_string()
    } else {
        let mut short: String = name.chars().take(width - 1).collect();
        short.push('~');
        short
    }
}
