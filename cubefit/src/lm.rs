//! Bounded Levenberg-Marquardt least squares.
//!
//! Minimizes a weighted residual sum of squares over a box: damped
//! normal equations solved by LU decomposition, a multiplicative damping
//! schedule, and projection of every trial step onto the bounds. The
//! parameter covariance at the optimum comes from the undamped curvature
//! matrix.

use nalgebra::{DMatrix, DVector};

/// Problem interface consumed by the minimizer.
///
/// Implementations fill weighted residuals `r_i = sqrt(w_i) * (data_i -
/// model_i)` and the matching Jacobian `J[(i, k)] = sqrt(w_i) *
/// d(model_i)/d(p_k)`; the minimizer then drives `|r|^2` down.
pub trait LeastSquaresProblem {
    /// `(n_residuals, n_parameters)`.
    fn dimensions(&self) -> (usize, usize);

    fn residuals(&mut self, params: &[f64], out: &mut DVector<f64>);

    fn jacobian(&mut self, params: &[f64], out: &mut DMatrix<f64>);
}

/// Damping and termination schedule.
#[derive(Debug, Clone)]
pub struct LevenbergMarquardt {
    /// Iteration cap.
    pub max_iterations: usize,
    /// Convergence threshold on the largest accepted parameter step.
    pub tolerance: f64,
    /// Starting damping factor.
    pub initial_lambda: f64,
    /// Multiplier applied after a rejected step.
    pub lambda_up: f64,
    /// Multiplier applied after an accepted step.
    pub lambda_down: f64,
    /// Damping above which the fit is declared stuck.
    pub lambda_max: f64,
}

impl Default for LevenbergMarquardt {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1e-6,
            initial_lambda: 1e-3,
            lambda_up: 10.0,
            lambda_down: 0.1,
            lambda_max: 1e10,
        }
    }
}

/// Outcome of one minimization.
#[derive(Debug, Clone)]
pub struct LmOutcome {
    /// Best parameters found, inside the bounds.
    pub params: Vec<f64>,
    /// Weighted residual sum of squares at `params`.
    pub chi2: f64,
    /// Iterations actually run.
    pub iterations: usize,
    /// Whether the step-size criterion was met before any cap.
    pub converged: bool,
    /// Parameter covariance at the optimum; `None` when the curvature
    /// matrix is singular even under the pseudo-inverse.
    pub covariance: Option<DMatrix<f64>>,
}

impl LevenbergMarquardt {
    /// Minimize `|r(p)|^2` over the box `[lower, upper]`, starting from
    /// `initial` (projected into the box first).
    ///
    /// `lower` and `upper` must be ordered per component; equal bounds pin
    /// a parameter.
    pub fn minimize<P: LeastSquaresProblem>(
        &self,
        problem: &mut P,
        initial: &[f64],
        lower: &[f64],
        upper: &[f64],
    ) -> LmOutcome {
        let (n_res, n_par) = problem.dimensions();
        debug_assert_eq!(initial.len(), n_par);
        debug_assert_eq!(lower.len(), n_par);
        debug_assert_eq!(upper.len(), n_par);

        let mut params: Vec<f64> = initial
            .iter()
            .zip(lower.iter().zip(upper))
            .map(|(&p, (&lo, &hi))| p.clamp(lo, hi))
            .collect();

        let mut residuals = DVector::zeros(n_res);
        let mut trial_residuals = DVector::zeros(n_res);
        let mut jacobian = DMatrix::zeros(n_res, n_par);

        problem.residuals(&params, &mut residuals);
        let mut chi2 = residuals.norm_squared();
        let mut lambda = self.initial_lambda;
        let mut converged = false;
        let mut iterations = 0;

        while iterations < self.max_iterations {
            iterations += 1;
            problem.residuals(&params, &mut residuals);
            problem.jacobian(&params, &mut jacobian);
            let jt = jacobian.transpose();
            let mut curvature = &jt * &jacobian;
            let gradient = &jt * &residuals;
            for k in 0..n_par {
                curvature[(k, k)] *= 1.0 + lambda;
            }

            let step = match curvature.lu().solve(&gradient) {
                Some(step) => step,
                None => {
                    lambda *= self.lambda_up;
                    if lambda > self.lambda_max {
                        break;
                    }
                    continue;
                }
            };

            let trial: Vec<f64> = params
                .iter()
                .enumerate()
                .map(|(k, &p)| (p + step[k]).clamp(lower[k], upper[k]))
                .collect();
            problem.residuals(&trial, &mut trial_residuals);
            let trial_chi2 = trial_residuals.norm_squared();

            if trial_chi2 <= chi2 {
                let moved = params
                    .iter()
                    .zip(&trial)
                    .map(|(a, b)| (a - b).abs())
                    .fold(0.0, f64::max);
                params = trial;
                chi2 = trial_chi2;
                lambda = (lambda * self.lambda_down).max(1e-12);
                if moved < self.tolerance {
                    converged = true;
                    break;
                }
            } else {
                lambda *= self.lambda_up;
                if lambda > self.lambda_max {
                    break;
                }
            }
        }

        problem.jacobian(&params, &mut jacobian);
        let curvature = jacobian.transpose() * &jacobian;
        let covariance = curvature
            .clone()
            .try_inverse()
            .or_else(|| curvature.svd(true, true).pseudo_inverse(1e-12).ok());

        LmOutcome {
            params,
            chi2,
            iterations,
            converged,
            covariance,
        }
    }
}
