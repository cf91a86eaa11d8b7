//! M-step: re-estimate global parameters from the expected sufficient
//! statistics aggregated over all subjects.
//!
//! Each parameter block is either closed-form (initial distribution,
//! Gaussian weighted least squares) or a concave weighted-GLM objective
//! maximized by damped Newton warm-started from the previous coefficients.
//! Warm-starting plus accept-only-improving steps is what carries the EM
//! monotonicity guarantee through the iterative blocks.

use nalgebra::{DMatrix, DVector};
use ph_core::Result;
use ph_prob::math::{exp_clamped, logsumexp};

use crate::data::Subject;
use crate::forward_backward::Posterior;
use crate::model::{EmissionFamily, ModelSpec};
use crate::params::{ParameterSet, PersonalizationPrior};

/// Tikhonov term keeping the overparameterized softmax blocks identified
/// and the Newton systems non-singular.
const RIDGE: f64 = 1e-6;

/// One full M-step.
///
/// `posteriors[i]` must come from the E-step of `subjects[i]`, and
/// `current` must already hold the personalization vectors produced by
/// that E-step. Returns a new parameter set; `current` is the warm start
/// for every iterative block.
pub(crate) fn maximize(
    spec: &ModelSpec,
    subjects: &[Subject],
    posteriors: &[Posterior],
    current: &ParameterSet,
    min_var: f64,
    omega_damping: f64,
) -> Result<ParameterSet> {
    let k = spec.n_states();

    let initial = update_initial(k, posteriors);
    let transition = update_transition(spec, subjects, posteriors, current)?;
    let (emission, variance) = match spec.emission_family() {
        EmissionFamily::Gaussian => update_gaussian(spec, subjects, posteriors, current, min_var)?,
        EmissionFamily::Poisson => (update_poisson(spec, subjects, posteriors, current)?, Vec::new()),
        EmissionFamily::Categorical { .. } => {
            (update_categorical(spec, subjects, posteriors, current)?, Vec::new())
        }
    };
    let prior = update_prior(spec, current, min_var, omega_damping);

    Ok(ParameterSet {
        initial,
        transition,
        emission,
        variance,
        personalization: current.personalization.clone(),
        prior,
    })
}

/// Initial-state distribution: normalized average of the first-step
/// marginals across subjects.
fn update_initial(k: usize, posteriors: &[Posterior]) -> Vec<f64> {
    let mut pi = vec![0.0; k];
    for post in posteriors {
        for (s, &g) in post.gamma[0].iter().enumerate() {
            pi[s] += g;
        }
    }
    let total: f64 = pi.iter().sum();
    if total > 0.0 {
        for p in pi.iter_mut() {
            *p /= total;
        }
    } else {
        pi = vec![1.0 / k as f64; k];
    }
    pi
}

fn gather(input: &[f64], cols: &[usize]) -> Vec<f64> {
    cols.iter().map(|&c| input[c]).collect()
}

/// Transition coefficients: one weighted multinomial-logit block per
/// source state, observations weighted by the pairwise marginals.
fn update_transition(
    spec: &ModelSpec,
    subjects: &[Subject],
    posteriors: &[Posterior],
    current: &ParameterSet,
) -> Result<Vec<Vec<Vec<f64>>>> {
    let k = spec.n_states();
    let covs = spec.transition_covariates();
    let mut out = Vec::with_capacity(k);

    for from in 0..k {
        let allowed: Vec<bool> = (0..k).map(|to| spec.allows_transition(from, to)).collect();
        let mut obs = Vec::new();
        for (subject, post) in subjects.iter().zip(posteriors.iter()) {
            let pers = current.personalization_or_zero(spec, subject.id());
            let mut offsets = vec![0.0; k];
            if let Some(idx) = spec.transition_offset_index(from) {
                offsets[from] = pers[idx];
            }
            for t in 1..subject.len() {
                obs.push(SoftmaxObs {
                    x: gather(subject.input(t), covs),
                    offsets: offsets.clone(),
                    weights: post.xi[t - 1][from].clone(),
                });
            }
        }
        out.push(weighted_softmax_update(&obs, &allowed, &current.transition[from])?);
    }
    Ok(out)
}

/// Gaussian emissions: per (state, channel) weighted least squares on the
/// personalization-adjusted response, followed by the weighted residual
/// variance floored at `min_var`.
fn update_gaussian(
    spec: &ModelSpec,
    subjects: &[Subject],
    posteriors: &[Posterior],
    current: &ParameterSet,
    min_var: f64,
) -> Result<(Vec<Vec<Vec<f64>>>, Vec<Vec<f64>>)> {
    let k = spec.n_states();
    let covs = spec.emission_covariates();
    let p = covs.len();
    let mut emission = current.emission.clone();
    let mut variance = current.variance.clone();

    for state in 0..k {
        for channel in 0..spec.n_outputs() {
            let mut xtwx = DMatrix::<f64>::zeros(p, p);
            let mut xtwy = DVector::<f64>::zeros(p);
            let mut wsum = 0.0;
            for (subject, post) in subjects.iter().zip(posteriors.iter()) {
                let pers = current.personalization_or_zero(spec, subject.id());
                let offset = spec
                    .emission_offset_index(state, channel)
                    .map_or(0.0, |idx| pers[idx]);
                for t in 0..subject.len() {
                    if !subject.is_observed(t) {
                        continue;
                    }
                    let w = post.gamma[t][state];
                    if w <= 0.0 {
                        continue;
                    }
                    let x = gather(subject.input(t), covs);
                    let y = subject.output(t)[channel] - offset;
                    wsum += w;
                    for a in 0..p {
                        xtwy[a] += w * x[a] * y;
                        for b in 0..p {
                            xtwx[(a, b)] += w * x[a] * x[b];
                        }
                    }
                }
            }
            if wsum <= 0.0 {
                // Starved state: the previous coefficients stand.
                continue;
            }
            for a in 0..p {
                xtwx[(a, a)] += RIDGE;
            }
            let Some(beta) = xtwx.lu().solve(&xtwy) else {
                log::warn!("singular WLS system for state {state} channel {channel}; keeping previous coefficients");
                continue;
            };
            let beta: Vec<f64> = beta.iter().copied().collect();

            let mut rss = 0.0;
            for (subject, post) in subjects.iter().zip(posteriors.iter()) {
                let pers = current.personalization_or_zero(spec, subject.id());
                let offset = spec
                    .emission_offset_index(state, channel)
                    .map_or(0.0, |idx| pers[idx]);
                for t in 0..subject.len() {
                    if !subject.is_observed(t) {
                        continue;
                    }
                    let w = post.gamma[t][state];
                    if w <= 0.0 {
                        continue;
                    }
                    let x = gather(subject.input(t), covs);
                    let mean: f64 =
                        x.iter().zip(beta.iter()).map(|(&xi, &b)| xi * b).sum::<f64>() + offset;
                    let r = subject.output(t)[channel] - mean;
                    rss += w * r * r;
                }
            }
            emission[state][channel] = beta;
            variance[state][channel] = (rss / wsum).max(min_var);
        }
    }
    Ok((emission, variance))
}

/// Poisson emissions: per (state, channel) weighted log-linear Newton
/// update with the personalization offset carried in the linear predictor.
fn update_poisson(
    spec: &ModelSpec,
    subjects: &[Subject],
    posteriors: &[Posterior],
    current: &ParameterSet,
) -> Result<Vec<Vec<Vec<f64>>>> {
    let k = spec.n_states();
    let covs = spec.emission_covariates();
    let mut emission = current.emission.clone();

    for state in 0..k {
        for channel in 0..spec.n_outputs() {
            let mut obs = Vec::new();
            for (subject, post) in subjects.iter().zip(posteriors.iter()) {
                let pers = current.personalization_or_zero(spec, subject.id());
                let offset = spec
                    .emission_offset_index(state, channel)
                    .map_or(0.0, |idx| pers[idx]);
                for t in 0..subject.len() {
                    if !subject.is_observed(t) {
                        continue;
                    }
                    let w = post.gamma[t][state];
                    if w > 0.0 {
                        obs.push(PoissonObs {
                            x: gather(subject.input(t), covs),
                            y: subject.output(t)[channel],
                            weight: w,
                            offset,
                        });
                    }
                }
            }
            emission[state][channel] = weighted_poisson_update(&obs, &emission[state][channel])?;
        }
    }
    Ok(emission)
}

/// Categorical emissions: one weighted multinomial-logit block per state,
/// the observed category carrying that step's state marginal as weight.
fn update_categorical(
    spec: &ModelSpec,
    subjects: &[Subject],
    posteriors: &[Posterior],
    current: &ParameterSet,
) -> Result<Vec<Vec<Vec<f64>>>> {
    let k = spec.n_states();
    let n_ch = spec.n_channels();
    let covs = spec.emission_covariates();
    let allowed = vec![true; n_ch];
    let mut emission = Vec::with_capacity(k);

    for state in 0..k {
        let mut obs = Vec::new();
        for (subject, post) in subjects.iter().zip(posteriors.iter()) {
            let pers = current.personalization_or_zero(spec, subject.id());
            let offsets: Vec<f64> = (0..n_ch)
                .map(|ch| spec.emission_offset_index(state, ch).map_or(0.0, |idx| pers[idx]))
                .collect();
            for t in 0..subject.len() {
                if !subject.is_observed(t) {
                    continue;
                }
                let w = post.gamma[t][state];
                if w <= 0.0 {
                    continue;
                }
                let category = subject.output(t)[0] as usize;
                let mut weights = vec![0.0; n_ch];
                weights[category] = w;
                obs.push(SoftmaxObs {
                    x: gather(subject.input(t), covs),
                    offsets: offsets.clone(),
                    weights,
                });
            }
        }
        emission.push(weighted_softmax_update(&obs, &allowed, &current.emission[state])?);
    }
    Ok(emission)
}

/// Damped empirical update of the personalization prior. Falls back to
/// the previous prior when the empirical covariance cannot be formed
/// (no fitted subjects yet, or a degenerate estimate).
fn update_prior(
    spec: &ModelSpec,
    current: &ParameterSet,
    min_var: f64,
    omega_damping: f64,
) -> PersonalizationPrior {
    let dim = spec.personalization_dim();
    if dim == 0 || current.personalization.is_empty() {
        return current.prior.clone();
    }
    let vectors: Vec<Vec<f64>> = current.personalization.values().cloned().collect();
    match PersonalizationPrior::empirical(&vectors, dim, min_var)
        .and_then(|emp| emp.blend_with(&current.prior, omega_damping))
    {
        Ok(prior) => prior,
        Err(e) => {
            log::warn!("personalization covariance update failed ({e}); keeping previous prior");
            current.prior.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// Weighted GLM solvers
// ---------------------------------------------------------------------------

/// One weighted observation for the multinomial-logit blocks.
struct SoftmaxObs {
    /// Gathered covariate values.
    x: Vec<f64>,
    /// Fixed per-class offsets (personalization), added to the logits.
    offsets: Vec<f64>,
    /// Expected counts per class.
    weights: Vec<f64>,
}

/// Maximize `Σ_i Σ_c w[i][c] · log softmax(η_i)[c] − ½·ridge·‖β‖²` with
/// `η_i[c] = x_i·β_c + offset_i[c]` over the allowed classes. Forbidden
/// classes keep zero coefficients and contribute `-inf` logits, exactly
/// as at materialization time.
///
/// Warm-started from `init`; only improving Newton steps are accepted, so
/// the returned coefficients never score below the starting point.
fn weighted_softmax_update(
    obs: &[SoftmaxObs],
    allowed: &[bool],
    init: &[Vec<f64>],
) -> Result<Vec<Vec<f64>>> {
    let n_classes = allowed.len();
    let p = init[0].len();
    let active: Vec<usize> = (0..n_classes).filter(|&c| allowed[c]).collect();
    let total_weight: f64 = obs.iter().map(|o| o.weights.iter().sum::<f64>()).sum();
    if active.len() <= 1 || total_weight <= 0.0 {
        return Ok(init.to_vec());
    }

    let a = active.len();
    let dim = a * p;
    let mut beta = init.to_vec();

    let objective = |beta: &[Vec<f64>]| -> f64 {
        let mut obj = 0.0;
        for o in obs {
            let eta: Vec<f64> = active
                .iter()
                .map(|&c| {
                    o.x.iter().zip(beta[c].iter()).map(|(&xi, &b)| xi * b).sum::<f64>()
                        + o.offsets[c]
                })
                .collect();
            let lse = logsumexp(&eta);
            for (ai, &c) in active.iter().enumerate() {
                let w = o.weights[c];
                if w > 0.0 {
                    obj += w * (eta[ai] - lse);
                }
            }
        }
        for &c in &active {
            obj -= 0.5 * RIDGE * beta[c].iter().map(|b| b * b).sum::<f64>();
        }
        obj
    };

    let mut f_cur = objective(&beta);
    for _ in 0..100 {
        let mut grad = DVector::<f64>::zeros(dim);
        let mut hess = DMatrix::<f64>::zeros(dim, dim);
        for o in obs {
            let eta: Vec<f64> = active
                .iter()
                .map(|&c| {
                    o.x.iter().zip(beta[c].iter()).map(|(&xi, &b)| xi * b).sum::<f64>()
                        + o.offsets[c]
                })
                .collect();
            let lse = logsumexp(&eta);
            let pi: Vec<f64> = eta.iter().map(|&e| (e - lse).exp()).collect();
            let wsum: f64 = active.iter().map(|&c| o.weights[c]).sum();
            for (ai, &c) in active.iter().enumerate() {
                let resid = o.weights[c] - wsum * pi[ai];
                for (j, &xj) in o.x.iter().enumerate() {
                    grad[ai * p + j] += resid * xj;
                }
                for (bi, _) in active.iter().enumerate() {
                    let delta = if ai == bi { 1.0 } else { 0.0 };
                    let curv = wsum * pi[ai] * (delta - pi[bi]);
                    if curv != 0.0 {
                        for (j, &xj) in o.x.iter().enumerate() {
                            for (l, &xl) in o.x.iter().enumerate() {
                                hess[(ai * p + j, bi * p + l)] -= curv * xj * xl;
                            }
                        }
                    }
                }
            }
        }
        for (ai, &c) in active.iter().enumerate() {
            for j in 0..p {
                grad[ai * p + j] -= RIDGE * beta[c][j];
                hess[(ai * p + j, ai * p + j)] -= RIDGE;
            }
        }

        if grad.norm() < 1e-8 * (1.0 + total_weight) {
            break;
        }
        let Some(direction) = (-hess).lu().solve(&grad) else {
            break;
        };

        let mut step = 1.0;
        let mut improved = false;
        for _ in 0..30 {
            let mut trial = beta.clone();
            for (ai, &c) in active.iter().enumerate() {
                for j in 0..p {
                    trial[c][j] += step * direction[ai * p + j];
                }
            }
            let f_trial = objective(&trial);
            if f_trial > f_cur {
                beta = trial;
                f_cur = f_trial;
                improved = true;
                break;
            }
            step *= 0.5;
        }
        if !improved {
            break;
        }
    }
    Ok(beta)
}

/// One weighted observation for the log-linear Poisson blocks.
struct PoissonObs {
    x: Vec<f64>,
    y: f64,
    weight: f64,
    offset: f64,
}

/// Maximize `Σ_i w_i (y_i·η_i − exp η_i) − ½·ridge·‖β‖²` with
/// `η_i = x_i·β + offset_i`, warm-started and accept-only-improving like
/// the softmax update.
fn weighted_poisson_update(obs: &[PoissonObs], init: &[f64]) -> Result<Vec<f64>> {
    let p = init.len();
    let total_weight: f64 = obs.iter().map(|o| o.weight).sum();
    if total_weight <= 0.0 {
        return Ok(init.to_vec());
    }
    let mut beta = init.to_vec();

    let objective = |beta: &[f64]| -> f64 {
        let mut obj = 0.0;
        for o in obs {
            let eta: f64 =
                o.x.iter().zip(beta.iter()).map(|(&xi, &b)| xi * b).sum::<f64>() + o.offset;
            obj += o.weight * (o.y * eta - exp_clamped(eta));
        }
        obj - 0.5 * RIDGE * beta.iter().map(|b| b * b).sum::<f64>()
    };

    let mut f_cur = objective(&beta);
    for _ in 0..100 {
        let mut grad = DVector::<f64>::zeros(p);
        let mut hess = DMatrix::<f64>::zeros(p, p);
        for o in obs {
            let eta: f64 =
                o.x.iter().zip(beta.iter()).map(|(&xi, &b)| xi * b).sum::<f64>() + o.offset;
            let rate = exp_clamped(eta);
            for (j, &xj) in o.x.iter().enumerate() {
                grad[j] += o.weight * (o.y - rate) * xj;
                for (l, &xl) in o.x.iter().enumerate() {
                    hess[(j, l)] -= o.weight * rate * xj * xl;
                }
            }
        }
        for j in 0..p {
            grad[j] -= RIDGE * beta[j];
            hess[(j, j)] -= RIDGE;
        }

        if grad.norm() < 1e-8 * (1.0 + total_weight) {
            break;
        }
        let Some(direction) = (-hess).lu().solve(&grad) else {
            break;
        };

        let mut step = 1.0;
        let mut improved = false;
        for _ in 0..30 {
            let trial: Vec<f64> =
                beta.iter().zip(direction.iter()).map(|(&b, &d)| b + step * d).collect();
            let f_trial = objective(&trial);
            if f_trial > f_cur {
                beta = trial;
                f_cur = f_trial;
                improved = true;
                break;
            }
            step *= 0.5;
        }
        if !improved {
            break;
        }
    }
    Ok(beta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::glm::transition_log_matrix;
    use crate::model::{PersonalizationScheme, TransitionStructure};

    fn uniform_posterior(k: usize, t_len: usize) -> Posterior {
        let gamma = vec![vec![1.0 / k as f64; k]; t_len];
        let xi = vec![vec![vec![1.0 / (k * k) as f64; k]; k]; t_len - 1];
        Posterior { gamma, xi, loglik: 0.0 }
    }

    fn gaussian_spec() -> ModelSpec {
        ModelSpec::new(
            2,
            2,
            1,
            EmissionFamily::Gaussian,
            vec![0],
            vec![0, 1],
            TransitionStructure::Full,
            PersonalizationScheme::none(),
        )
        .unwrap()
    }

    #[test]
    fn initial_distribution_is_the_normalized_first_step_average() {
        let posteriors = vec![
            Posterior { gamma: vec![vec![0.9, 0.1]], xi: vec![], loglik: 0.0 },
            Posterior { gamma: vec![vec![0.5, 0.5]], xi: vec![], loglik: 0.0 },
        ];
        let pi = update_initial(2, &posteriors);
        assert!((pi[0] - 0.7).abs() < 1e-12);
        assert!((pi[1] - 0.3).abs() < 1e-12);
    }

    #[test]
    fn gaussian_wls_recovers_a_linear_signal() {
        let spec = gaussian_spec();
        let current = ParameterSet::zeroed(&spec).unwrap();
        // y = 2 + 3 * input[1], all responsibility on state 0.
        let inputs: Vec<Vec<f64>> = (0..12).map(|t| vec![1.0, t as f64 * 0.25]).collect();
        let outputs: Vec<Vec<f64>> =
            inputs.iter().map(|row| vec![2.0 + 3.0 * row[1]]).collect();
        let subject = Subject::new("s", inputs, outputs).unwrap();
        let mut post = uniform_posterior(2, 12);
        for row in post.gamma.iter_mut() {
            *row = vec![1.0, 0.0];
        }

        let updated = maximize(&spec, &[subject], &[post], &current, 1e-4, 0.7).unwrap();
        assert!((updated.emission[0][0][0] - 2.0).abs() < 1e-6);
        assert!((updated.emission[0][0][1] - 3.0).abs() < 1e-6);
        // Perfect fit: variance hits the floor.
        assert!((updated.variance[0][0] - 1e-4).abs() < 1e-12);
        // State 1 got zero weight everywhere: previous coefficients stand.
        assert_eq!(updated.emission[1][0], vec![0.0, 0.0]);
    }

    #[test]
    fn transition_update_reproduces_expected_frequencies() {
        let spec = ModelSpec::intercept_only(
            2,
            1,
            EmissionFamily::Gaussian,
            PersonalizationScheme::none(),
        )
        .unwrap();
        let current = ParameterSet::zeroed(&spec).unwrap();
        // Pairwise weights with strong persistence: 0->0 and 1->1 carry
        // three times the mass of the cross moves.
        let xi_slice = vec![vec![0.3, 0.1], vec![0.1, 0.5]];
        let post = Posterior {
            gamma: vec![vec![0.4, 0.6]; 5],
            xi: vec![xi_slice; 4],
            loglik: 0.0,
        };
        let subject =
            Subject::new("s", vec![vec![1.0]; 5], vec![vec![0.0]; 5]).unwrap();

        let updated = maximize(&spec, &[subject], &[post], &current, 1e-4, 0.7).unwrap();
        let m = transition_log_matrix(&spec, &updated, &[], &[1.0]);
        // Row 0: expected counts 0.3 vs 0.1 -> P(stay) = 0.75.
        assert!((m[0][0].exp() - 0.75).abs() < 1e-3, "got {}", m[0][0].exp());
        // Row 1: 0.1 vs 0.5 -> P(stay) = 5/6.
        assert!((m[1][1].exp() - 5.0 / 6.0).abs() < 1e-3, "got {}", m[1][1].exp());
    }

    #[test]
    fn progressive_structure_keeps_forbidden_coefficients_at_zero() {
        let spec = ModelSpec::new(
            3,
            1,
            1,
            EmissionFamily::Gaussian,
            vec![0],
            vec![0],
            TransitionStructure::Progressive,
            PersonalizationScheme::none(),
        )
        .unwrap();
        let current = ParameterSet::zeroed(&spec).unwrap();
        let subject = Subject::new("s", vec![vec![1.0]; 4], vec![vec![0.0]; 4]).unwrap();
        // Mass only on allowed cells.
        let mut xi_slice = vec![vec![0.0; 3]; 3];
        xi_slice[0][0] = 0.3;
        xi_slice[0][1] = 0.2;
        xi_slice[1][2] = 0.2;
        xi_slice[2][2] = 0.3;
        let post = Posterior {
            gamma: vec![vec![1.0 / 3.0; 3]; 4],
            xi: vec![xi_slice; 3],
            loglik: 0.0,
        };

        let updated = maximize(&spec, &[subject], &[post], &current, 1e-4, 0.7).unwrap();
        for from in 0..3 {
            for to in 0..from {
                assert_eq!(updated.transition[from][to], vec![0.0]);
            }
        }
        let m = transition_log_matrix(&spec, &updated, &[], &[1.0]);
        assert_eq!(m[2][0], f64::NEG_INFINITY);
        // Terminal state still a point mass on itself.
        assert!((m[2][2]).abs() < 1e-12);
    }

    #[test]
    fn poisson_update_lands_on_the_weighted_log_mean() {
        let spec = ModelSpec::intercept_only(
            2,
            1,
            EmissionFamily::Poisson,
            PersonalizationScheme::none(),
        )
        .unwrap();
        let current = ParameterSet::zeroed(&spec).unwrap();
        let counts = [2.0, 4.0, 3.0, 3.0];
        let subject = Subject::new(
            "s",
            vec![vec![1.0]; 4],
            counts.iter().map(|&c| vec![c]).collect(),
        )
        .unwrap();
        let mut post = uniform_posterior(2, 4);
        for row in post.gamma.iter_mut() {
            *row = vec![1.0, 0.0];
        }

        let updated = maximize(&spec, &[subject], &[post], &current, 1e-4, 0.7).unwrap();
        let mean = counts.iter().sum::<f64>() / 4.0;
        assert!(
            (updated.emission[0][0][0] - mean.ln()).abs() < 1e-4,
            "got {}, expected {}",
            updated.emission[0][0][0],
            mean.ln()
        );
    }

    #[test]
    fn categorical_update_matches_weighted_category_frequencies() {
        let spec = ModelSpec::intercept_only(
            2,
            1,
            EmissionFamily::Categorical { n_categories: 3 },
            PersonalizationScheme::none(),
        )
        .unwrap();
        let current = ParameterSet::zeroed(&spec).unwrap();
        // Categories 0,0,1,2 with all weight on state 0.
        let subject = Subject::new(
            "s",
            vec![vec![1.0]; 4],
            vec![vec![0.0], vec![0.0], vec![1.0], vec![2.0]],
        )
        .unwrap();
        let mut post = uniform_posterior(2, 4);
        for row in post.gamma.iter_mut() {
            *row = vec![1.0, 0.0];
        }

        let updated = maximize(&spec, &[subject], &[post], &current, 1e-4, 0.7).unwrap();
        let logits: Vec<f64> =
            (0..3).map(|ch| updated.emission[0][ch][0]).collect();
        let lse = logsumexp(&logits);
        let probs: Vec<f64> = logits.iter().map(|&l| (l - lse).exp()).collect();
        assert!((probs[0] - 0.5).abs() < 1e-3, "got {probs:?}");
        assert!((probs[1] - 0.25).abs() < 1e-3);
        assert!((probs[2] - 0.25).abs() < 1e-3);
    }

    #[test]
    fn prior_stays_put_without_fitted_personalization() {
        let spec = ModelSpec::intercept_only(
            2,
            1,
            EmissionFamily::Gaussian,
            PersonalizationScheme::emission_only(),
        )
        .unwrap();
        let current = ParameterSet::zeroed(&spec).unwrap();
        let prior = update_prior(&spec, &current, 1e-4, 0.7);
        assert_eq!(prior, *current.prior());
    }

    #[test]
    fn prior_blends_toward_the_empirical_covariance() {
        let spec = ModelSpec::intercept_only(
            2,
            1,
            EmissionFamily::Gaussian,
            PersonalizationScheme::emission_only(),
        )
        .unwrap();
        let mut current = ParameterSet::zeroed(&spec).unwrap();
        current.personalization.insert("a".to_string(), vec![3.0, 0.0]);
        current.personalization.insert("b".to_string(), vec![-3.0, 0.0]);
        let prior = update_prior(&spec, &current, 1e-4, 0.5);
        let m = prior.to_matrix();
        // Empirical var of component 0 is 9; blended halfway with the unit
        // prior gives about 5.
        assert!((m[0][0] - 5.0).abs() < 0.1, "got {}", m[0][0]);
        assert!(m[1][1] < 1.0 + 1e-6);
    }
}
