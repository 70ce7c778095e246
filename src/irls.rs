//! Iteratively reweighted least squares for the Poisson log-link model.

use nalgebra::linalg::Cholesky;
use nalgebra::{DMatrix, DVector, Dyn};

use crate::error::{ReplicationError, Result};
use crate::options::IrlsOptions;

/// Converged Poisson fit together with its diagnostics.
#[derive(Clone, Debug)]
pub struct PoissonFit {
    pub params: DVector<f64>,
    /// Fitted conditional means `exp(X b)`.
    pub mu: DVector<f64>,
    pub deviance: f64,
    pub iterations: usize,
}

/// Solves the Poisson score equations `X' W (y - exp(X b)) = 0`.
///
/// `weights` are observation weights; the outcome must be non-negative.
pub fn fit_poisson(
    x: &DMatrix<f64>,
    y: &DVector<f64>,
    weights: &DVector<f64>,
    options: &IrlsOptions,
) -> Result<PoissonFit> {
    let total_weight: f64 = weights.sum();
    let mean_y = y.dot(weights) / total_weight;
    if !(mean_y > 0.0) {
        return Err(ReplicationError::NumericalError {
            context: "PPML start values (outcome has no positive mass)",
        });
    }

    // Start from the midpoint between each outcome and the mean to keep mu > 0.
    let mut mu = y.map(|value| (value + mean_y) / 2.0);
    let mut eta = mu.map(f64::ln);
    let mut previous = poisson_deviance(y, &mu, weights);
    let mut change = f64::INFINITY;

    for iteration in 1..=options.max_iterations {
        let working = DVector::from_fn(y.len(), |i, _| eta[i] + (y[i] - mu[i]) / mu[i]);
        let root_weight = DVector::from_fn(y.len(), |i, _| (weights[i] * mu[i]).sqrt());

        let design = scale_rows(x, &root_weight);
        let response = working.component_mul(&root_weight);
        let cholesky = factor_spd(design.transpose() * &design, "X'WX in IRLS")?;
        let params = cholesky.solve(&(design.transpose() * response));

        eta = x * &params;
        mu = eta.map(f64::exp);
        if mu.iter().any(|value| !value.is_finite()) {
            return Err(ReplicationError::NumericalError {
                context: "PPML linear predictor",
            });
        }

        let deviance = poisson_deviance(y, &mu, weights);
        change = (deviance - previous).abs() / (deviance.abs() + 0.1);
        log::debug!("IRLS iteration {iteration}: deviance {deviance:.6}, change {change:.3e}");
        if change < options.tolerance {
            return Ok(PoissonFit {
                params,
                mu,
                deviance,
                iterations: iteration,
            });
        }
        previous = deviance;
    }

    Err(ReplicationError::DidNotConverge {
        iterations: options.max_iterations,
        change,
    })
}

/// Weighted Poisson deviance; zero outcomes contribute `2 w mu`.
pub fn poisson_deviance(y: &DVector<f64>, mu: &DVector<f64>, weights: &DVector<f64>) -> f64 {
    let mut total = 0.0;
    for i in 0..y.len() {
        let log_ratio = if y[i] > 0.0 {
            y[i] * (y[i] / mu[i]).ln()
        } else {
            0.0
        };
        total += weights[i] * (log_ratio - (y[i] - mu[i]));
    }
    2.0 * total
}

/// Smallest pivot, relative to the matching diagonal entry, accepted as full rank.
const RANK_TOLERANCE: f64 = 1e-10;

/// Cholesky factor of a cross-product matrix, rejecting rank-deficient input.
///
/// A column that is (numerically) a combination of earlier columns leaves a
/// pivot that is tiny relative to its own diagonal entry, even when the
/// factorization itself succeeds.
pub(crate) fn factor_spd(matrix: DMatrix<f64>, context: &'static str) -> Result<Cholesky<f64, Dyn>> {
    let diagonal = matrix.diagonal();
    let cholesky = Cholesky::new(matrix).ok_or_else(|| ReplicationError::singular(context))?;
    let factor = cholesky.l_dirty();
    for (j, &scale) in diagonal.iter().enumerate() {
        let pivot = factor[(j, j)] * factor[(j, j)];
        if !(scale > 0.0) || !(pivot > RANK_TOLERANCE * scale) {
            return Err(ReplicationError::singular(context));
        }
    }
    Ok(cholesky)
}

/// Multiplies row `i` of `matrix` by `factors[i]`.
pub(crate) fn scale_rows(matrix: &DMatrix<f64>, factors: &DVector<f64>) -> DMatrix<f64> {
    let mut out = matrix.clone();
    for j in 0..out.ncols() {
        for i in 0..out.nrows() {
            out[(i, j)] *= factors[i];
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn intercept_only_model_recovers_log_mean() {
        let y = DVector::from_vec(vec![0.0, 2.0, 4.0, 6.0]);
        let x = DMatrix::from_element(4, 1, 1.0);
        let weights = DVector::from_element(4, 1.0);

        let fit = fit_poisson(&x, &y, &weights, &IrlsOptions::default()).unwrap();
        assert_relative_eq!(fit.params[0], 3.0_f64.ln(), epsilon = 1e-8);
        assert!(fit.iterations >= 1);
    }

    #[test]
    fn all_zero_outcome_is_rejected() {
        let y = DVector::<f64>::zeros(3);
        let x = DMatrix::from_element(3, 1, 1.0);
        let weights = DVector::from_element(3, 1.0);
        let result = fit_poisson(&x, &y, &weights, &IrlsOptions::default());
        assert!(matches!(result, Err(ReplicationError::NumericalError { .. })));
    }

    #[test]
    fn collinear_cross_product_is_singular() {
        let x = DMatrix::from_row_slice(4, 3, &[
            1.0, 1.0, 0.0, //
            1.0, 0.0, 1.0, //
            1.0, 1.0, 0.0, //
            1.0, 0.0, 1.0,
        ]);
        assert!(matches!(
            factor_spd(x.transpose() * &x, "X'X"),
            Err(ReplicationError::SingularMatrix { context: "X'X" })
        ));
    }

    #[test]
    fn iteration_cap_reports_non_convergence() {
        let y = DVector::from_vec(vec![1.0, 3.0, 8.0, 20.0]);
        let x = DMatrix::from_row_slice(4, 2, &[1.0, 0.0, 1.0, 1.0, 1.0, 2.0, 1.0, 3.0]);
        let weights = DVector::from_element(4, 1.0);
        let options = IrlsOptions {
            tolerance: 0.0,
            max_iterations: 2,
        };
        let result = fit_poisson(&x, &y, &weights, &options);
        assert!(matches!(
            result,
            Err(ReplicationError::DidNotConverge { iterations: 2, .. })
        ));
    }
}
