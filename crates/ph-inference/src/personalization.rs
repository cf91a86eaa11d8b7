//! Per-subject MAP estimation of the personalization vector.
//!
//! Given the subject's expected sufficient statistics from the last
//! forward-backward pass, the update minimizes the negative expected
//! complete-data log-likelihood plus the Gaussian prior penalty:
//!
//! `f(m) = -Σ_t Σ_k γ[t][k]·log p(y_t | k, m)
//!         - Σ_t Σ_jk ξ[t][j][k]·log A_t[j][k](m)
//!         + ½ mᵀ Σ⁻¹ m`
//!
//! Only the terms belonging to personalized blocks vary with `m`. The
//! Gaussian family makes `f` exactly quadratic, so Newton lands in one
//! step; the other families are smooth and close to quadratic near the
//! mode. Each accepted step strictly decreases `f`, which is what the
//! outer loop's monotonicity guarantee leans on.

use ph_core::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::data::Subject;
use crate::forward_backward::Posterior;
use crate::glm::{emission_log_likelihoods, transition_log_matrix};
use crate::model::ModelSpec;
use crate::params::ParameterSet;

/// Inner solver used for the per-subject MAP update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PersonalizationSolver {
    /// Damped Newton with a numerical Hessian.
    #[default]
    Newton,
    /// Steepest descent with a backtracking line search. Slower but
    /// useful when the Hessian is expensive or poorly conditioned.
    Gradient,
}

/// One bounded MAP update for a single subject.
///
/// Returns the updated personalization vector, or
/// [`Error::NonConvergence`] if the iteration bound is exhausted while
/// the gradient is still above `grad_tol` and steps are still moving.
pub(crate) fn optimize_subject(
    spec: &ModelSpec,
    params: &ParameterSet,
    subject: &Subject,
    posterior: &Posterior,
    init: &[f64],
    solver: PersonalizationSolver,
    max_iter: usize,
    grad_tol: f64,
) -> Result<Vec<f64>> {
    let dim = spec.personalization_dim();
    if dim == 0 {
        return Ok(Vec::new());
    }

    let objective = |m: &[f64]| map_objective(spec, params, subject, posterior, m);
    let mut m = init.to_vec();

    for _ in 0..max_iter {
        let grad = numerical_gradient(&objective, &m);
        let grad_norm: f64 = grad.iter().map(|g| g * g).sum::<f64>().sqrt();
        if grad_norm < grad_tol {
            return Ok(m);
        }

        let direction = match solver {
            PersonalizationSolver::Newton => {
                let hess = numerical_hessian(&objective, &m);
                solve_linear(&hess, &grad)
            }
            PersonalizationSolver::Gradient => grad.clone(),
        };

        let f_cur = objective(&m);
        let mut step = 1.0;
        let mut improved = false;
        for _ in 0..8 {
            let trial: Vec<f64> =
                m.iter().zip(direction.iter()).map(|(&v, &d)| v - step * d).collect();
            if objective(&trial) < f_cur {
                m = trial;
                improved = true;
                break;
            }
            step *= 0.5;
        }
        if !improved {
            // No descent step exists at this scale: a stable fixed point
            // of the update map, even if the numerical gradient has not
            // dropped below the tolerance.
            return Ok(m);
        }
    }

    let grad = numerical_gradient(&objective, &m);
    let grad_norm: f64 = grad.iter().map(|g| g * g).sum::<f64>().sqrt();
    if grad_norm < grad_tol {
        Ok(m)
    } else {
        Err(Error::NonConvergence {
            subject: subject.id().to_string(),
            detail: format!("gradient norm {grad_norm:.3e} after {max_iter} inner iterations"),
        })
    }
}

/// Negative expected complete-data log-likelihood plus prior penalty.
fn map_objective(
    spec: &ModelSpec,
    params: &ParameterSet,
    subject: &Subject,
    posterior: &Posterior,
    m: &[f64],
) -> f64 {
    let scheme = spec.personalization();
    let k = spec.n_states();
    let mut obj = 0.0;

    if scheme.emission {
        for t in 0..subject.len() {
            if !subject.is_observed(t) {
                continue;
            }
            let ll = match emission_log_likelihoods(
                spec,
                params,
                m,
                subject.input(t),
                subject.output(t),
                true,
            ) {
                Ok(v) => v,
                Err(_) => return f64::MAX,
            };
            for s in 0..k {
                let w = posterior.gamma[t][s];
                if w > 0.0 {
                    obj -= w * ll[s];
                }
            }
        }
    }

    if scheme.transition {
        for t in 1..subject.len() {
            let la = transition_log_matrix(spec, params, m, subject.input(t));
            let slice = &posterior.xi[t - 1];
            for j in 0..k {
                for s in 0..k {
                    let w = slice[j][s];
                    // 0 * -inf on structurally forbidden cells is skipped.
                    if w > 0.0 {
                        obj -= w * la[j][s];
                    }
                }
            }
        }
    }

    obj + 0.5 * params.prior().inv_quadratic(m)
}

/// Central-difference gradient.
fn numerical_gradient<F: Fn(&[f64]) -> f64>(f: &F, x: &[f64]) -> Vec<f64> {
    let n = x.len();
    let h = 1e-7;
    let mut grad = Vec::with_capacity(n);
    let mut buf = x.to_vec();
    for k in 0..n {
        let orig = buf[k];
        buf[k] = orig + h;
        let fp = f(&buf);
        buf[k] = orig - h;
        let fm = f(&buf);
        buf[k] = orig;
        grad.push((fp - fm) / (2.0 * h));
    }
    grad
}

/// Central-difference Hessian.
fn numerical_hessian<F: Fn(&[f64]) -> f64>(f: &F, x: &[f64]) -> Vec<Vec<f64>> {
    let n = x.len();
    let h = 1e-5;
    let f0 = f(x);
    let mut hess = vec![vec![0.0; n]; n];
    let mut buf = x.to_vec();

    for i in 0..n {
        let orig = buf[i];
        buf[i] = orig + h;
        let fp = f(&buf);
        buf[i] = orig - h;
        let fm = f(&buf);
        buf[i] = orig;
        hess[i][i] = (fp - 2.0 * f0 + fm) / (h * h);

        for j in (i + 1)..n {
            let oi = buf[i];
            let oj = buf[j];
            buf[i] = oi + h;
            buf[j] = oj + h;
            let fpp = f(&buf);
            buf[j] = oj - h;
            let fpm = f(&buf);
            buf[i] = oi - h;
            buf[j] = oj + h;
            let fmp = f(&buf);
            buf[j] = oj - h;
            let fmm = f(&buf);
            buf[i] = oi;
            buf[j] = oj;
            let val = (fpp - fpm - fmp + fmm) / (4.0 * h * h);
            hess[i][j] = val;
            hess[j][i] = val;
        }
    }
    hess
}

/// Dense solve via Gaussian elimination with partial pivoting; falls back
/// to a diagonal solve when the matrix is numerically singular.
fn solve_linear(a: &[Vec<f64>], b: &[f64]) -> Vec<f64> {
    let n = b.len();
    if n == 0 {
        return vec![];
    }

    let mut aug: Vec<Vec<f64>> = a
        .iter()
        .enumerate()
        .map(|(i, row)| {
            let mut r = row.clone();
            r.push(b[i]);
            r
        })
        .collect();

    for col in 0..n {
        let mut max_row = col;
        let mut max_val = aug[col][col].abs();
        for row in (col + 1)..n {
            if aug[row][col].abs() > max_val {
                max_val = aug[row][col].abs();
                max_row = row;
            }
        }
        if max_val < 1e-20 {
            return b
                .iter()
                .enumerate()
                .map(|(i, &bi)| {
                    let aii = a[i][i];
                    if aii.abs() > 1e-20 { bi / aii } else { 0.0 }
                })
                .collect();
        }
        aug.swap(col, max_row);

        let pivot = aug[col][col];
        for row in (col + 1)..n {
            let factor = aug[row][col] / pivot;
            if factor != 0.0 {
                for c in col..=n {
                    aug[row][c] -= factor * aug[col][c];
                }
            }
        }
    }

    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let mut s = aug[row][n];
        for c in (row + 1)..n {
            s -= aug[row][c] * x[c];
        }
        x[row] = s / aug[row][row];
    }
    x
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward_backward::forward_backward_with;
    use crate::model::{EmissionFamily, PersonalizationScheme, TransitionStructure};

    fn emission_personalized_spec() -> ModelSpec {
        ModelSpec::intercept_only(
            2,
            1,
            EmissionFamily::Gaussian,
            PersonalizationScheme::emission_only(),
        )
        .unwrap()
    }

    /// With Gaussian emissions the MAP offset for channel (k, d) has the
    /// closed form `m* = Σ_t γ r_t / (σ²/τ² + Σ_t γ)` where `r` is the
    /// residual against the global mean. The solver must land on it.
    #[test]
    fn newton_matches_closed_form_gaussian_map() {
        let spec = emission_personalized_spec();
        let mut params = ParameterSet::zeroed(&spec).unwrap();
        params.emission[0][0][0] = -1.0;
        params.emission[1][0][0] = 1.0;
        params.variance = vec![vec![0.5], vec![0.5]];
        // Prior sd tau = 2.0 on both offsets.
        params = params.with_prior(
            crate::params::PersonalizationPrior::from_diagonal(&[2.0, 2.0]).unwrap(),
        );

        let subject = Subject::new(
            "s",
            vec![vec![1.0]; 4],
            vec![vec![-0.4], vec![-0.9], vec![1.6], vec![1.2]],
        )
        .unwrap();
        let pers0 = vec![0.0, 0.0];
        let post = forward_backward_with(&spec, &params, &pers0, &subject).unwrap();

        let m = optimize_subject(
            &spec,
            &params,
            &subject,
            &post,
            &pers0,
            PersonalizationSolver::Newton,
            20,
            1e-7,
        )
        .unwrap();

        for state in 0..2 {
            let mean = params.emission[state][0][0];
            let var = params.variance[state][0];
            let tau2 = 4.0;
            let mut wsum = 0.0;
            let mut wres = 0.0;
            for t in 0..4 {
                let g = post.gamma[t][state];
                wsum += g;
                wres += g * (subject.output(t)[0] - mean);
            }
            let closed = wres / (var / tau2 + wsum);
            // Offset index = state * n_channels + 0.
            assert!(
                (m[state] - closed).abs() < 1e-4,
                "state {state}: {} vs {closed}",
                m[state]
            );
        }
    }

    #[test]
    fn gradient_solver_reaches_the_same_mode() {
        let spec = emission_personalized_spec();
        let mut params = ParameterSet::zeroed(&spec).unwrap();
        params.emission[0][0][0] = -1.0;
        params.emission[1][0][0] = 1.0;
        let subject = Subject::new(
            "s",
            vec![vec![1.0]; 3],
            vec![vec![-1.3], vec![1.1], vec![0.9]],
        )
        .unwrap();
        let pers0 = vec![0.0, 0.0];
        let post = forward_backward_with(&spec, &params, &pers0, &subject).unwrap();

        let newton = optimize_subject(
            &spec, &params, &subject, &post, &pers0,
            PersonalizationSolver::Newton, 30, 1e-7,
        )
        .unwrap();
        let gradient = optimize_subject(
            &spec, &params, &subject, &post, &pers0,
            PersonalizationSolver::Gradient, 300, 1e-5,
        )
        .unwrap();
        for (a, b) in newton.iter().zip(gradient.iter()) {
            assert!((a - b).abs() < 1e-2, "{a} vs {b}");
        }
    }

    #[test]
    fn zero_dimensional_scheme_returns_empty() {
        let spec = ModelSpec::intercept_only(
            2,
            1,
            EmissionFamily::Gaussian,
            PersonalizationScheme::none(),
        )
        .unwrap();
        let params = ParameterSet::zeroed(&spec).unwrap();
        let subject = Subject::new("s", vec![vec![1.0]], vec![vec![0.0]]).unwrap();
        let post = forward_backward_with(&spec, &params, &[], &subject).unwrap();
        let m = optimize_subject(
            &spec, &params, &subject, &post, &[],
            PersonalizationSolver::Newton, 10, 1e-6,
        )
        .unwrap();
        assert!(m.is_empty());
    }

    #[test]
    fn exhausted_budget_with_live_gradient_is_nonconvergence() {
        let spec = emission_personalized_spec();
        let mut params = ParameterSet::zeroed(&spec).unwrap();
        params.emission[0][0][0] = -1.0;
        params.emission[1][0][0] = 1.0;
        params.variance = vec![vec![1e-3], vec![1e-3]]; // sharp pull, long walk
        let subject = Subject::new(
            "stubborn",
            vec![vec![1.0]; 4],
            vec![vec![-3.0], vec![-2.8], vec![3.1], vec![2.9]],
        )
        .unwrap();
        let pers0 = vec![0.0, 0.0];
        let post = forward_backward_with(&spec, &params, &pers0, &subject).unwrap();

        let err = optimize_subject(
            &spec, &params, &subject, &post, &pers0,
            PersonalizationSolver::Gradient, 1, 1e-10,
        )
        .unwrap_err();
        match err {
            Error::NonConvergence { subject, .. } => assert_eq!(subject, "stubborn"),
            other => panic!("expected non-convergence, got {other:?}"),
        }
    }

    #[test]
    fn solve_linear_identity_and_general() {
        let a = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        let x = solve_linear(&a, &[3.0, 7.0]);
        assert!((x[0] - 3.0).abs() < 1e-10 && (x[1] - 7.0).abs() < 1e-10);

        let a = vec![vec![4.0, 1.0], vec![1.0, 3.0]];
        let x = solve_linear(&a, &[1.0, 2.0]);
        assert!((4.0 * x[0] + x[1] - 1.0).abs() < 1e-10);
        assert!((x[0] + 3.0 * x[1] - 2.0).abs() < 1e-10);
    }
}
