//! Configuration records for estimator construction and the OLS / PPML fits.
//!
//! All records are plain values with explicit defaults. They are serialized
//! verbatim into persisted metadata, so the covariance estimator used for a
//! result is always on record.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Covariance estimator used when no other choice is configured.
pub const DEFAULT_COVARIANCE: CovarianceType = CovarianceType::HC3;

/// Covariance estimator for the fitted coefficients.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CovarianceType {
    /// Classical covariance assuming homoskedastic errors.
    #[serde(rename = "nonrobust")]
    NonRobust,
    /// White's heteroskedasticity-consistent estimator.
    HC0,
    /// HC0 with an `n / (n - k)` degrees-of-freedom correction.
    HC1,
    /// HC0 with squared residuals scaled by `1 / (1 - h_ii)`.
    HC2,
    /// HC0 with squared residuals scaled by `1 / (1 - h_ii)^2`.
    HC3,
    /// Liang-Zeger cluster-robust estimator with the CR1 small-sample correction.
    #[serde(rename = "cluster")]
    Cluster,
}

impl fmt::Display for CovarianceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CovarianceType::NonRobust => "nonrobust",
            CovarianceType::HC0 => "HC0",
            CovarianceType::HC1 => "HC1",
            CovarianceType::HC2 => "HC2",
            CovarianceType::HC3 => "HC3",
            CovarianceType::Cluster => "cluster",
        };
        f.write_str(name)
    }
}

/// Whether the estimator fits the outcome in logs or in levels for OLS.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeTransform {
    /// Regress `ln(y)`; the outcome must be strictly positive.
    Log,
    /// Regress `y` as supplied.
    Level,
}

/// Options fixed when the estimator is constructed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EstimatorOptions {
    /// Transform applied to the outcome before the OLS fit. PPML always models levels.
    pub outcome: OutcomeTransform,
}

impl Default for EstimatorOptions {
    fn default() -> Self {
        Self {
            outcome: OutcomeTransform::Log,
        }
    }
}

impl EstimatorOptions {
    /// Override the outcome transform.
    pub fn with_outcome(mut self, outcome: OutcomeTransform) -> Self {
        self.outcome = outcome;
        self
    }
}

/// Options for the ordinary least squares fit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OlsOptions {
    /// Covariance estimator; clustering is selected by supplying cluster groups.
    pub cov_type: CovarianceType,
}

impl Default for OlsOptions {
    fn default() -> Self {
        Self {
            cov_type: DEFAULT_COVARIANCE,
        }
    }
}

impl OlsOptions {
    /// Override the covariance estimator.
    pub fn with_cov_type(mut self, cov_type: CovarianceType) -> Self {
        self.cov_type = cov_type;
        self
    }
}

/// Options for the Poisson pseudo-maximum-likelihood fit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PpmlOptions {
    /// Covariance estimator; clustering is selected by supplying cluster groups.
    pub cov_type: CovarianceType,
    /// Iteration settings for the IRLS solver.
    pub irls: IrlsOptions,
}

impl Default for PpmlOptions {
    fn default() -> Self {
        Self {
            cov_type: DEFAULT_COVARIANCE,
            irls: IrlsOptions::default(),
        }
    }
}

impl PpmlOptions {
    /// Override the covariance estimator.
    pub fn with_cov_type(mut self, cov_type: CovarianceType) -> Self {
        self.cov_type = cov_type;
        self
    }

    /// Override the IRLS settings.
    pub fn with_irls(mut self, irls: IrlsOptions) -> Self {
        self.irls = irls;
        self
    }
}

/// Options for an estimator's full-model fit.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FitOptions {
    /// Also compute the asymptotic variance of the full-model estimate.
    pub compute_asymptotic_variance: bool,
}

impl FitOptions {
    pub fn with_asymptotic_variance(mut self, compute: bool) -> Self {
        self.compute_asymptotic_variance = compute;
        self
    }
}

/// Configuration for iteratively reweighted least squares.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IrlsOptions {
    /// Relative deviance change below which the fit is considered converged.
    pub tolerance: f64,
    /// Maximum number of iterations allowed before aborting.
    pub max_iterations: usize,
}

impl Default for IrlsOptions {
    fn default() -> Self {
        Self {
            tolerance: 1e-8,
            max_iterations: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_use_documented_covariance() {
        assert_eq!(OlsOptions::default().cov_type, DEFAULT_COVARIANCE);
        assert_eq!(PpmlOptions::default().cov_type, DEFAULT_COVARIANCE);
    }

    #[test]
    fn covariance_names_match_serialized_form() {
        for cov in [
            CovarianceType::NonRobust,
            CovarianceType::HC1,
            CovarianceType::Cluster,
        ] {
            let json = serde_json::to_string(&cov).unwrap();
            assert_eq!(json, format!("\"{cov}\""));
        }
    }
}
