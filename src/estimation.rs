//! Built-in fitting backend: least squares, two-stage least squares and PPML.

use nalgebra::{DMatrix, DVector};

use crate::data::hstack;
use crate::error::{ReplicationError, Result};
use crate::estimator::{CovarianceSpec, Estimator, EstimatorSpec, FitMethod, FittedModel};
use crate::irls::{factor_spd, fit_poisson, scale_rows};
use crate::options::{CovarianceType, OutcomeTransform, PpmlOptions};

/// Closed-form linear estimator with heteroskedasticity- and cluster-robust inference.
///
/// Fixed effects are expected as dummy columns inside `X`. When instruments are
/// supplied the least squares fit is two-stage, with every regressor not
/// marked endogenous acting as its own instrument.
#[derive(Clone, Debug)]
pub struct LinearEstimator {
    spec: EstimatorSpec,
}

impl LinearEstimator {
    /// Accessor for the bound specification.
    pub fn spec(&self) -> &EstimatorSpec {
        &self.spec
    }

    fn observation_weights(&self, weights: Option<&DVector<f64>>) -> Result<DVector<f64>> {
        let n = self.spec.y.len();
        match weights {
            Some(weights) if weights.len() != n => Err(ReplicationError::dimension_mismatch(
                "weights length",
                n,
                weights.len(),
            )),
            Some(weights) => {
                for (index, weight) in weights.iter().enumerate() {
                    if !weight.is_finite() || *weight < 0.0 {
                        return Err(ReplicationError::InvalidWeight {
                            index,
                            weight: *weight,
                        });
                    }
                }
                Ok(weights.clone())
            }
            None => Ok(DVector::from_element(n, 1.0)),
        }
    }

    fn least_squares_outcome(&self) -> Result<DVector<f64>> {
        match self.spec.options.outcome {
            OutcomeTransform::Log => {
                for (index, value) in self.spec.y.iter().enumerate() {
                    if !(*value > 0.0) || !value.is_finite() {
                        return Err(ReplicationError::NonPositiveOutcome {
                            index,
                            value: *value,
                        });
                    }
                }
                Ok(self.spec.y.map(f64::ln))
            }
            OutcomeTransform::Level => {
                if self.spec.y.iter().any(|value| !value.is_finite()) {
                    return Err(ReplicationError::NumericalError { context: "outcome" });
                }
                Ok(self.spec.y.clone())
            }
        }
    }

    /// Full instrument set: exogenous regressors followed by excluded instruments.
    fn instrument_set(&self, z: &DMatrix<f64>) -> DMatrix<f64> {
        let exogenous: Vec<usize> = (0..self.spec.x.ncols())
            .filter(|col| !self.spec.endogenous.contains(col))
            .collect();
        let included = self.spec.x.select_columns(exogenous.iter());
        hstack(&included, z)
    }

    fn model(
        &self,
        method: FitMethod,
        params: DVector<f64>,
        covariance: DMatrix<f64>,
        cov_type: CovarianceType,
    ) -> Result<FittedModel> {
        let bse = covariance.diagonal().map(f64::sqrt);
        if params.iter().chain(bse.iter()).any(|value| value.is_nan()) {
            return Err(ReplicationError::NumericalError {
                context: "coefficient covariance",
            });
        }
        let nobs = self.spec.y.len();
        Ok(FittedModel {
            method,
            params,
            bse,
            covariance,
            cov_type,
            nobs,
            df_resid: nobs as f64 - self.spec.x.ncols() as f64,
            r_squared: None,
            deviance: None,
            iterations: 0,
            interest: self.spec.interest.clone(),
            fixed_effects: self.spec.fixed_effects.clone(),
            elasticity: self.spec.elasticity,
        })
    }
}

impl Estimator for LinearEstimator {
    fn new(spec: EstimatorSpec) -> Result<Self> {
        let n = spec.y.len();
        let k = spec.x.ncols();
        if spec.x.nrows() != n {
            return Err(ReplicationError::dimension_mismatch(
                "X rows",
                n,
                spec.x.nrows(),
            ));
        }
        if k == 0 {
            return Err(ReplicationError::dimension_mismatch("regressors", 1, 0));
        }
        if spec.interest.is_empty() {
            return Err(ReplicationError::dimension_mismatch("interest columns", 1, 0));
        }
        for (context, columns) in [
            ("interest", &spec.interest),
            ("endogenous regressors", &spec.endogenous),
            ("fixed effects", &spec.fixed_effects),
        ] {
            if let Some(&position) = columns.iter().find(|&&col| col >= k) {
                return Err(ReplicationError::ColumnOutOfRange {
                    context,
                    position,
                    ncols: k,
                });
            }
        }

        match (&spec.instruments, spec.endogenous.is_empty()) {
            (None, false) => {
                return Err(ReplicationError::InstrumentMismatch {
                    detail: "endogenous regressors given without instruments",
                })
            }
            (Some(_), true) => {
                return Err(ReplicationError::InstrumentMismatch {
                    detail: "instruments given without endogenous regressors",
                })
            }
            (Some(z), false) => {
                if z.nrows() != n {
                    return Err(ReplicationError::dimension_mismatch("z rows", n, z.nrows()));
                }
                if z.ncols() < spec.endogenous.len() {
                    return Err(ReplicationError::UnderIdentified {
                        endogenous: spec.endogenous.len(),
                        instruments: z.ncols(),
                    });
                }
            }
            (None, true) => {}
        }

        log::debug!(
            "linear estimator bound: n={n}, k={k}, interest={:?}, endogenous={:?}",
            spec.interest,
            spec.endogenous
        );
        Ok(Self { spec })
    }

    fn fit_ols(
        &self,
        weights: Option<&DVector<f64>>,
        covariance: &CovarianceSpec<'_>,
    ) -> Result<FittedModel> {
        let y = self.least_squares_outcome()?;
        let w = self.observation_weights(weights)?;
        let root_w = w.map(f64::sqrt);
        let xw = scale_rows(&self.spec.x, &root_w);
        let yw = y.component_mul(&root_w);

        let (design, method) = match &self.spec.instruments {
            None => (xw.clone(), FitMethod::Ols),
            Some(z) => {
                let zw = scale_rows(&self.instrument_set(z), &root_w);
                let ztz_inv = invert_spd(zw.transpose() * &zw, "Z'Z")?;
                let fitted = &zw * (ztz_inv * (zw.transpose() * &xw));
                (fitted, FitMethod::TwoStageLeastSquares)
            }
        };

        let bread = invert_spd(design.transpose() * &design, "X'X")?;
        let params = &bread * (design.transpose() * &yw);
        let resid = &yw - &xw * &params;

        let n = y.len() as f64;
        let k = self.spec.x.ncols() as f64;
        let rss = resid.norm_squared();
        let sigma2 = rss / (n - k);
        let cov = robust_covariance(covariance, &design, &resid, &bread, sigma2)?;

        let mean = y.dot(&w) / w.sum();
        let tss: f64 = y
            .iter()
            .zip(w.iter())
            .map(|(value, weight)| weight * (value - mean).powi(2))
            .sum();

        let mut model = self.model(method, params, cov, covariance.cov_type)?;
        model.r_squared = (tss > 0.0).then(|| 1.0 - rss / tss);
        log::info!(
            "{method} fit complete: n={}, k={}, cov={}",
            model.nobs,
            model.params.len(),
            model.cov_type
        );
        Ok(model)
    }

    fn fit_ppml(
        &self,
        weights: Option<&DVector<f64>>,
        covariance: &CovarianceSpec<'_>,
        options: &PpmlOptions,
    ) -> Result<FittedModel> {
        if self.spec.instruments.is_some() {
            return Err(ReplicationError::Unsupported {
                feature: "instrumented PPML",
            });
        }
        for (index, value) in self.spec.y.iter().enumerate() {
            if !(*value >= 0.0) || !value.is_finite() {
                return Err(ReplicationError::NegativeOutcome {
                    index,
                    value: *value,
                });
            }
        }
        let w = self.observation_weights(weights)?;
        let fit = fit_poisson(&self.spec.x, &self.spec.y, &w, &options.irls)?;

        // Score of observation i is w_i (y_i - mu_i) x_i; split it into a
        // working design row and a working residual for the sandwich.
        let root_info = DVector::from_fn(w.len(), |i, _| (w[i] * fit.mu[i]).sqrt());
        let design = scale_rows(&self.spec.x, &root_info);
        let resid = DVector::from_fn(w.len(), |i, _| {
            (w[i] / fit.mu[i]).sqrt() * (self.spec.y[i] - fit.mu[i])
        });
        let bread = invert_spd(design.transpose() * &design, "X'WX")?;
        let cov = robust_covariance(covariance, &design, &resid, &bread, 1.0)?;

        let mut model = self.model(FitMethod::Ppml, fit.params, cov, covariance.cov_type)?;
        model.deviance = Some(fit.deviance);
        model.iterations = fit.iterations;
        log::info!(
            "PPML fit complete after {} iterations: deviance={:.4}, cov={}",
            fit.iterations,
            fit.deviance,
            model.cov_type
        );
        Ok(model)
    }

    fn supports_clustering(&self) -> bool {
        true
    }
}

fn invert_spd(matrix: DMatrix<f64>, context: &'static str) -> Result<DMatrix<f64>> {
    Ok(factor_spd(matrix, context)?.inverse())
}

/// Observations with `1 - h_ii` at or below this are treated as fitted exactly.
const LEVERAGE_SLACK: f64 = 1e-10;

/// Sandwich covariance `B M B` from per-observation scores `design_i * resid_i`.
///
/// `sigma2` scales the bread for the non-robust estimator.
pub(crate) fn robust_covariance(
    spec: &CovarianceSpec<'_>,
    design: &DMatrix<f64>,
    resid: &DVector<f64>,
    bread: &DMatrix<f64>,
    sigma2: f64,
) -> Result<DMatrix<f64>> {
    let n = design.nrows();
    let k = design.ncols();
    let (nf, kf) = (n as f64, k as f64);

    let meat = match spec.cov_type {
        CovarianceType::NonRobust => return Ok(bread * sigma2),
        CovarianceType::HC0 | CovarianceType::HC1 => {
            let scores = scale_rows(design, resid);
            scores.transpose() * scores
        }
        CovarianceType::HC2 | CovarianceType::HC3 => {
            let power = if spec.cov_type == CovarianceType::HC2 {
                0.5
            } else {
                1.0
            };
            let mut adjusted = resid.clone();
            let mut saturated = 0usize;
            for i in 0..n {
                let row = design.row(i);
                let leverage = (row * bread * row.transpose())[(0, 0)];
                let slack = 1.0 - leverage;
                if slack <= LEVERAGE_SLACK {
                    // Fitted exactly (e.g. a singleton fixed-effect level): the
                    // residual is zero and carries no information.
                    adjusted[i] = 0.0;
                    saturated += 1;
                } else {
                    adjusted[i] /= slack.powf(power);
                }
            }
            if saturated > 0 {
                log::warn!(
                    "{saturated} observation(s) with leverage 1 contribute nothing to {} standard errors",
                    spec.cov_type
                );
            }
            let scores = scale_rows(design, &adjusted);
            scores.transpose() * scores
        }
        CovarianceType::Cluster => {
            let groups = spec.groups.ok_or(ReplicationError::MissingClusterGroups)?;
            if groups.len() != n {
                return Err(ReplicationError::dimension_mismatch(
                    "cluster length",
                    n,
                    groups.len(),
                ));
            }
            let group_count = groups.iter().max().map_or(0, |max| max + 1);
            if group_count < 2 {
                return Err(ReplicationError::dimension_mismatch(
                    "cluster groups",
                    2,
                    group_count,
                ));
            }
            let mut scores = DMatrix::<f64>::zeros(group_count, k);
            for (i, &group) in groups.iter().enumerate() {
                for j in 0..k {
                    scores[(group, j)] += design[(i, j)] * resid[i];
                }
            }
            let g = group_count as f64;
            let correction = g / (g - 1.0) * (nf - 1.0) / (nf - kf);
            (scores.transpose() * scores) * correction
        }
    };

    let mut cov = bread * meat * bread;
    if spec.cov_type == CovarianceType::HC1 {
        cov *= nf / (nf - kf);
    }
    Ok(cov)
}
