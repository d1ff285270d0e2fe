//! Ordinary least squares via normal equations
//!
//! `energy ≈ β₀ + Σ βᵢ·xᵢ`, solved with a Cholesky factorization of X'X.
//! A near-singular system gets one retry with a small diagonal jitter; if
//! that also fails the design matrix is genuinely degenerate and the caller
//! should prune features.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegressionError {
    #[error("too few samples: have {have}, need at least {need}")]
    TooFewSamples { have: usize, need: usize },

    #[error("design matrix rows have inconsistent widths")]
    DimensionMismatch,

    #[error("design matrix is singular (collinear or constant features)")]
    Singular,
}

/// A fitted model with its training statistics.
#[derive(Debug, Clone)]
pub struct OlsFit {
    pub intercept: f64,
    /// One coefficient per design column, in input order.
    pub coefficients: Vec<f64>,
    pub r_squared: f64,
    pub rmse: f64,
    pub mae: f64,
    /// Residual standard deviation with degrees-of-freedom correction;
    /// drives the 2σ/3σ deviation severity ladder.
    pub residual_std: f64,
    pub samples: usize,
}

impl OlsFit {
    /// Evaluate the fitted model on one feature vector.
    pub fn predict(&self, x: &[f64]) -> f64 {
        self.intercept
            + self
                .coefficients
                .iter()
                .zip(x.iter())
                .map(|(c, v)| c * v)
                .sum::<f64>()
    }
}

/// Fit `y ≈ β₀ + Σ βᵢ·xᵢ` over row-major `matrix`.
///
/// Requires at least `p + 2` rows for `p` features so the residual variance
/// has a degree of freedom left.
pub fn fit_ols(matrix: &[Vec<f64>], target: &[f64]) -> Result<OlsFit, RegressionError> {
    let n = matrix.len();
    let p = matrix.first().map_or(0, Vec::len);
    if n != target.len() || matrix.iter().any(|row| row.len() != p) {
        return Err(RegressionError::DimensionMismatch);
    }
    if n < p + 2 {
        return Err(RegressionError::TooFewSamples { have: n, need: p + 2 });
    }

    // Normal equations over the design matrix [1 | X]: A = X'X, b = X'y.
    let m = p + 1;
    let mut a = vec![vec![0.0f64; m]; m];
    let mut b = vec![0.0f64; m];

    for (row, &y) in matrix.iter().zip(target.iter()) {
        // design row = (1, x_1, .., x_p)
        for i in 0..m {
            let xi = if i == 0 { 1.0 } else { row[i - 1] };
            b[i] += xi * y;
            for j in 0..=i {
                let xj = if j == 0 { 1.0 } else { row[j - 1] };
                a[i][j] += xi * xj;
            }
        }
    }
    // mirror the lower triangle
    for i in 0..m {
        for j in (i + 1)..m {
            a[i][j] = a[j][i];
        }
    }

    let beta = match cholesky_solve(&a, &b) {
        Some(beta) => beta,
        None => {
            // one retry with a tiny ridge on the diagonal
            let trace: f64 = (0..m).map(|i| a[i][i]).sum();
            let jitter = 1e-8 * trace / m as f64;
            let mut aj = a.clone();
            for (i, row) in aj.iter_mut().enumerate() {
                row[i] += jitter;
            }
            cholesky_solve(&aj, &b).ok_or(RegressionError::Singular)?
        }
    };

    let intercept = beta[0];
    let coefficients = beta[1..].to_vec();

    // Fit statistics
    let mean_y = target.iter().sum::<f64>() / n as f64;
    let mut ss_res = 0.0;
    let mut ss_tot = 0.0;
    let mut abs_err = 0.0;
    for (row, &y) in matrix.iter().zip(target.iter()) {
        let pred = intercept
            + coefficients
                .iter()
                .zip(row.iter())
                .map(|(c, v)| c * v)
                .sum::<f64>();
        let resid = y - pred;
        ss_res += resid * resid;
        abs_err += resid.abs();
        ss_tot += (y - mean_y) * (y - mean_y);
    }

    let r_squared = if ss_tot <= f64::EPSILON {
        // constant target: a perfect fit explains it, anything else explains nothing
        if ss_res <= f64::EPSILON { 1.0 } else { 0.0 }
    } else {
        1.0 - ss_res / ss_tot
    };

    let dof = (n - p - 1).max(1);
    Ok(OlsFit {
        intercept,
        coefficients,
        r_squared,
        rmse: (ss_res / n as f64).sqrt(),
        mae: abs_err / n as f64,
        residual_std: (ss_res / dof as f64).sqrt(),
        samples: n,
    })
}

/// Solve `A x = b` for symmetric positive-definite `A`. `None` when the
/// factorization breaks down.
fn cholesky_solve(a: &[Vec<f64>], b: &[f64]) -> Option<Vec<f64>> {
    let m = a.len();
    let mut l = vec![vec![0.0f64; m]; m];

    for i in 0..m {
        for j in 0..=i {
            let mut s = a[i][j];
            for k in 0..j {
                s -= l[i][k] * l[j][k];
            }
            if i == j {
                if s <= 0.0 || !s.is_finite() {
                    return None;
                }
                l[i][i] = s.sqrt();
            } else {
                l[i][j] = s / l[j][j];
            }
        }
    }

    // forward: L z = b
    let mut z = vec![0.0f64; m];
    for i in 0..m {
        let mut s = b[i];
        for k in 0..i {
            s -= l[i][k] * z[k];
        }
        z[i] = s / l[i][i];
    }

    // backward: L' x = z
    let mut x = vec![0.0f64; m];
    for i in (0..m).rev() {
        let mut s = z[i];
        for k in (i + 1)..m {
            s -= l[k][i] * x[k];
        }
        x[i] = s / l[i][i];
    }

    Some(x)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovers_exact_linear_relationship() {
        // y = 5 + 2*a - 3*b, no noise
        let mut matrix = Vec::new();
        let mut target = Vec::new();
        for i in 0..60 {
            let a = i as f64;
            let b = (i % 7) as f64;
            matrix.push(vec![a, b]);
            target.push(5.0 + 2.0 * a - 3.0 * b);
        }

        let fit = fit_ols(&matrix, &target).unwrap();
        assert!((fit.intercept - 5.0).abs() < 1e-8);
        assert!((fit.coefficients[0] - 2.0).abs() < 1e-8);
        assert!((fit.coefficients[1] + 3.0).abs() < 1e-8);
        assert!(fit.r_squared > 0.999999);
        assert!(fit.rmse < 1e-6);
    }

    #[test]
    fn prediction_round_trips_the_fit() {
        let matrix: Vec<Vec<f64>> = (0..50).map(|i| vec![i as f64, (i * i) as f64]).collect();
        let target: Vec<f64> = matrix.iter().map(|r| 1.0 + 0.5 * r[0] + 0.1 * r[1]).collect();
        let fit = fit_ols(&matrix, &target).unwrap();

        for (row, &y) in matrix.iter().zip(target.iter()) {
            let manual = fit.intercept
                + fit.coefficients[0] * row[0]
                + fit.coefficients[1] * row[1];
            assert!((fit.predict(row) - manual).abs() < 1e-12);
            assert!((fit.predict(row) - y).abs() < 1e-6);
        }
    }

    #[test]
    fn noisy_fit_reports_plausible_statistics() {
        // deterministic pseudo-noise keeps the test reproducible
        let mut matrix = Vec::new();
        let mut target = Vec::new();
        for i in 0..200 {
            let x = i as f64 * 0.5;
            let noise = ((i * 2_654_435_761_u64 % 1000) as f64 / 1000.0 - 0.5) * 4.0;
            matrix.push(vec![x]);
            target.push(10.0 + 3.0 * x + noise);
        }

        let fit = fit_ols(&matrix, &target).unwrap();
        assert!((fit.coefficients[0] - 3.0).abs() < 0.05);
        assert!(fit.r_squared > 0.99, "r² = {}", fit.r_squared);
        assert!(fit.rmse > 0.0 && fit.rmse < 3.0);
        assert!(fit.residual_std >= fit.rmse); // dof correction inflates σ
    }

    #[test]
    fn too_few_samples_is_rejected() {
        let matrix = vec![vec![1.0, 2.0], vec![2.0, 3.0], vec![3.0, 4.0]];
        let target = vec![1.0, 2.0, 3.0];
        assert!(matches!(
            fit_ols(&matrix, &target),
            Err(RegressionError::TooFewSamples { .. })
        ));
    }

    #[test]
    fn mismatched_rows_are_rejected() {
        let matrix = vec![vec![1.0, 2.0], vec![2.0]];
        let target = vec![1.0, 2.0];
        assert!(matches!(
            fit_ols(&matrix, &target),
            Err(RegressionError::DimensionMismatch)
        ));
    }

    #[test]
    fn duplicate_column_survives_via_jitter_or_fails_cleanly() {
        // perfectly collinear columns: either the ridge retry solves it or
        // we get Singular — never a bogus fit
        let matrix: Vec<Vec<f64>> = (0..50).map(|i| vec![i as f64, i as f64]).collect();
        let target: Vec<f64> = (0..50).map(|i| 2.0 * i as f64).collect();
        match fit_ols(&matrix, &target) {
            Ok(fit) => {
                // combined slope must still predict correctly
                assert!((fit.predict(&[10.0, 10.0]) - 20.0).abs() < 1e-3);
            }
            Err(RegressionError::Singular) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn constant_target_yields_zero_or_one_r_squared() {
        let matrix: Vec<Vec<f64>> = (0..30).map(|i| vec![i as f64]).collect();
        let target = vec![7.0; 30];
        let fit = fit_ols(&matrix, &target).unwrap();
        assert!(fit.r_squared == 0.0 || fit.r_squared == 1.0);
        assert!((fit.predict(&[15.0]) - 7.0).abs() < 1e-6);
    }
}
