//! EM orchestration: parallel per-subject E-steps and personalization
//! updates, an aggregation barrier, the serialized M-step, and the
//! convergence/monotonicity bookkeeping across restarts.
//!
//! Global parameters are read-only during the parallel phase; every
//! subject exclusively owns its personalization vector. The only write
//! point is the serialized block after the barrier, so a cancellation
//! between iterations always leaves the last completed iteration's
//! parameters intact.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, warn};
use ph_core::{Error, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::data::Subject;
use crate::forward_backward::{forward_backward_with, Posterior};
use crate::init::{self, InitStrategy};
use crate::maximizer;
use crate::model::ModelSpec;
use crate::params::ParameterSet;
use crate::personalization::{optimize_subject, PersonalizationSolver};

fn default_max_iter() -> usize {
    100
}
fn default_tol() -> f64 {
    1e-6
}
fn default_n_restarts() -> usize {
    1
}
fn default_max_inner_iter() -> usize {
    50
}
fn default_inner_grad_tol() -> f64 {
    1e-6
}
fn default_min_var() -> f64 {
    1e-4
}
fn default_omega_damping() -> f64 {
    0.7
}

/// Fitting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitConfig {
    /// Maximum outer EM iterations per restart.
    #[serde(default = "default_max_iter")]
    pub max_iter: usize,
    /// Relative tolerance on log-likelihood improvement.
    #[serde(default = "default_tol")]
    pub tol: f64,
    /// Number of random restarts; the best final log-likelihood wins.
    #[serde(default = "default_n_restarts")]
    pub n_restarts: usize,
    /// Base seed; restart `r` uses `seed + r`.
    #[serde(default)]
    pub seed: u64,
    /// Starting-point strategy.
    #[serde(default)]
    pub init: InitStrategy,
    /// Inner solver for the per-subject MAP updates.
    #[serde(default)]
    pub solver: PersonalizationSolver,
    /// Iteration bound for the personalization inner loop.
    #[serde(default = "default_max_inner_iter")]
    pub max_inner_iter: usize,
    /// Gradient-norm tolerance for the personalization inner loop.
    #[serde(default = "default_inner_grad_tol")]
    pub inner_grad_tol: f64,
    /// Floor on Gaussian emission variances and on the personalization
    /// covariance diagonal.
    #[serde(default = "default_min_var")]
    pub min_var: f64,
    /// Damping of the empirical personalization-covariance update toward
    /// the previous covariance, in `[0, 1)`.
    #[serde(default = "default_omega_damping")]
    pub omega_damping: f64,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            max_iter: default_max_iter(),
            tol: default_tol(),
            n_restarts: default_n_restarts(),
            seed: 0,
            init: InitStrategy::default(),
            solver: PersonalizationSolver::default(),
            max_inner_iter: default_max_inner_iter(),
            inner_grad_tol: default_inner_grad_tol(),
            min_var: default_min_var(),
            omega_damping: default_omega_damping(),
        }
    }
}

impl FitConfig {
    /// Validate every knob.
    pub fn validate(&self) -> Result<()> {
        if self.max_iter == 0 {
            return Err(Error::Configuration("max_iter must be > 0".to_string()));
        }
        if !self.tol.is_finite() || self.tol <= 0.0 {
            return Err(Error::Configuration("tol must be finite and > 0".to_string()));
        }
        if self.n_restarts == 0 {
            return Err(Error::Configuration("n_restarts must be > 0".to_string()));
        }
        if self.max_inner_iter == 0 {
            return Err(Error::Configuration("max_inner_iter must be > 0".to_string()));
        }
        if !self.inner_grad_tol.is_finite() || self.inner_grad_tol <= 0.0 {
            return Err(Error::Configuration(
                "inner_grad_tol must be finite and > 0".to_string(),
            ));
        }
        if !self.min_var.is_finite() || self.min_var <= 0.0 {
            return Err(Error::Configuration("min_var must be finite and > 0".to_string()));
        }
        if !(0.0..1.0).contains(&self.omega_damping) {
            return Err(Error::Configuration(format!(
                "omega_damping must be in [0, 1), got {}",
                self.omega_damping
            )));
        }
        Ok(())
    }
}

/// Terminal state of a completed (non-failed) fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FitStatus {
    /// Log-likelihood improvement fell below the tolerance.
    Converged,
    /// The iteration budget was exhausted first.
    MaxIterationsReached,
    /// The caller cancelled between iterations; the parameters are those
    /// of the last completed iteration.
    Cancelled,
}

/// Fitted parameters plus convergence diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitOutcome {
    /// Fitted parameter set of the best restart.
    pub params: ParameterSet,
    /// Final total log-likelihood of the best restart.
    pub loglik: f64,
    /// Total log-likelihood per outer iteration of the best restart.
    pub loglik_trace: Vec<f64>,
    /// Completed outer iterations of the best restart.
    pub n_iter: usize,
    /// How the best restart terminated.
    pub status: FitStatus,
    /// Final log-likelihood of every restart, in restart order.
    pub restart_logliks: Vec<f64>,
}

/// Fit the model to a population of subjects.
///
/// Restarts run in parallel; within each restart, per-subject E-steps and
/// personalization updates run in parallel and meet at the aggregation
/// barrier before the serialized M-step. Either returns a valid outcome
/// or the first error, which names the offending subject where one
/// exists.
pub fn fit(spec: &ModelSpec, subjects: &[Subject], config: &FitConfig) -> Result<FitOutcome> {
    let cancel = AtomicBool::new(false);
    fit_with_cancel(spec, subjects, config, &cancel)
}

/// [`fit`] with a coarse cancellation point between EM iterations.
///
/// Setting `cancel` makes every restart stop before its next iteration
/// and return with [`FitStatus::Cancelled`] and the parameters of its
/// last completed iteration.
pub fn fit_with_cancel(
    spec: &ModelSpec,
    subjects: &[Subject],
    config: &FitConfig,
    cancel: &AtomicBool,
) -> Result<FitOutcome> {
    config.validate()?;
    spec.validate()?;
    if subjects.is_empty() {
        return Err(Error::Configuration("at least one subject is required".to_string()));
    }
    let mut seen = BTreeSet::new();
    for subject in subjects {
        subject.validate_against(spec)?;
        if !seen.insert(subject.id()) {
            return Err(Error::Configuration(format!(
                "duplicate subject id '{}'",
                subject.id()
            )));
        }
    }

    let mut outcomes: Vec<FitOutcome> = (0..config.n_restarts)
        .into_par_iter()
        .map(|r| run_restart(spec, subjects, config, config.seed.wrapping_add(r as u64), cancel))
        .collect::<Result<Vec<_>>>()?;

    let restart_logliks: Vec<f64> = outcomes.iter().map(|o| o.loglik).collect();
    let mut best = 0;
    for (r, o) in outcomes.iter().enumerate() {
        if o.loglik > outcomes[best].loglik {
            best = r;
        }
    }
    let mut outcome = outcomes.swap_remove(best);
    outcome.restart_logliks = restart_logliks;
    Ok(outcome)
}

/// One restart: initialize, iterate to convergence or budget, return the
/// final parameters and trace.
fn run_restart(
    spec: &ModelSpec,
    subjects: &[Subject],
    config: &FitConfig,
    seed: u64,
    cancel: &AtomicBool,
) -> Result<FitOutcome> {
    let mut params = init::initialize(spec, subjects, &config.init, seed, config.min_var)?;
    let dim = spec.personalization_dim();
    for subject in subjects {
        params
            .personalization
            .entry(subject.id().to_string())
            .or_insert_with(|| vec![0.0; dim]);
    }

    let mut trace = Vec::new();
    let mut prev: Option<f64> = None;
    let mut status = FitStatus::MaxIterationsReached;
    let mut n_iter = 0;

    for iter in 0..config.max_iter {
        if cancel.load(Ordering::Relaxed) {
            status = FitStatus::Cancelled;
            break;
        }

        // Parallel phase: global parameters are read-only, each subject
        // owns its personalization update.
        let results: Vec<(String, Vec<f64>, Posterior)> = subjects
            .par_iter()
            .enumerate()
            .map(|(idx, subject)| subject_e_step(spec, &params, subject, idx, config, seed))
            .collect::<Result<Vec<_>>>()?;

        // Aggregation barrier reached: everything below is serialized.
        let total: f64 = results.iter().map(|(_, _, post)| post.loglik).sum();
        trace.push(total);
        debug!("restart seed {seed}: iteration {iter} loglik {total}");

        if let Some(previous) = prev {
            if !non_decreasing(previous, total) {
                return Err(Error::MonotonicityViolation {
                    iteration: iter,
                    previous,
                    current: total,
                });
            }
            if total - previous <= config.tol * (1.0 + previous.abs()) {
                status = FitStatus::Converged;
                break;
            }
        }

        let mut posteriors = Vec::with_capacity(results.len());
        for (id, pers, post) in results {
            params.personalization.insert(id, pers);
            posteriors.push(post);
        }
        params = maximizer::maximize(
            spec,
            subjects,
            &posteriors,
            &params,
            config.min_var,
            config.omega_damping,
        )?;

        prev = Some(total);
        n_iter = iter + 1;
    }

    let loglik = trace.last().copied().unwrap_or(f64::NEG_INFINITY);
    Ok(FitOutcome {
        params,
        loglik,
        loglik_trace: trace,
        n_iter,
        status,
        restart_logliks: Vec::new(),
    })
}

/// Forward-backward plus the personalization inner loop for one subject,
/// with one retry from a re-initialized personalization on a per-subject
/// numerical or convergence failure.
fn subject_e_step(
    spec: &ModelSpec,
    params: &ParameterSet,
    subject: &Subject,
    subject_idx: usize,
    config: &FitConfig,
    seed: u64,
) -> Result<(String, Vec<f64>, Posterior)> {
    let attempt = |pers: &[f64]| -> Result<(String, Vec<f64>, Posterior)> {
        let post = forward_backward_with(spec, params, pers, subject)?;
        let updated = optimize_subject(
            spec,
            params,
            subject,
            &post,
            pers,
            config.solver,
            config.max_inner_iter,
            config.inner_grad_tol,
        )?;
        Ok((subject.id().to_string(), updated, post))
    };

    let pers = params.personalization_or_zero(spec, subject.id());
    match attempt(&pers) {
        Ok(r) => Ok(r),
        Err(e) if e.is_subject_retryable() => {
            warn!("retrying subject '{}' after: {e}", subject.id());
            let fresh = jittered_personalization(spec, seed, subject_idx);
            attempt(&fresh)
        }
        Err(e) => Err(e),
    }
}

/// Fresh personalization starting point for a retry: zeros plus small
/// noise seeded from the restart seed and the subject index.
fn jittered_personalization(spec: &ModelSpec, seed: u64, subject_idx: usize) -> Vec<f64> {
    let mix = seed ^ 0x9e37_79b9_7f4a_7c15u64.wrapping_mul(subject_idx as u64 + 1);
    let mut rng = StdRng::seed_from_u64(mix);
    (0..spec.personalization_dim())
        .map(|_| {
            let z: f64 = rng.sample(StandardNormal);
            0.1 * z
        })
        .collect()
}

/// Whether `current` respects the EM monotonicity invariant relative to
/// `previous`, with relative slack for floating-point noise.
fn non_decreasing(previous: f64, current: f64) -> bool {
    current >= previous - 1e-6 * (1.0 + previous.abs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EmissionFamily, PersonalizationScheme};

    fn two_state_spec(pers: PersonalizationScheme) -> ModelSpec {
        ModelSpec::intercept_only(2, 1, EmissionFamily::Gaussian, pers).unwrap()
    }

    /// Two clearly separated output regimes per subject.
    fn easy_subjects(n: usize) -> Vec<Subject> {
        (0..n)
            .map(|i| {
                let outputs: Vec<Vec<f64>> = (0..10)
                    .map(|t| {
                        let center = if t < 5 { -2.0 } else { 2.0 };
                        vec![center + 0.15 * (((i * 7 + t * 3) % 5) as f64 - 2.0)]
                    })
                    .collect();
                Subject::new(format!("s-{i}"), vec![vec![1.0]; 10], outputs).unwrap()
            })
            .collect()
    }

    #[test]
    fn config_defaults_round_trip_through_serde() {
        let cfg: FitConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.max_iter, 100);
        assert_eq!(cfg.n_restarts, 1);
        assert!((cfg.omega_damping - 0.7).abs() < 1e-12);
        assert!(cfg.validate().is_ok());
        let json = serde_json::to_string(&cfg).unwrap();
        let back: FitConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.max_iter, cfg.max_iter);
    }

    #[test]
    fn config_rejects_bad_knobs() {
        let cfg = FitConfig { max_iter: 0, ..FitConfig::default() };
        assert!(cfg.validate().is_err());
        let cfg = FitConfig { omega_damping: 1.0, ..FitConfig::default() };
        assert!(cfg.validate().is_err());
        let cfg = FitConfig { tol: f64::NAN, ..FitConfig::default() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn fit_converges_with_a_non_decreasing_trace() {
        let spec = two_state_spec(PersonalizationScheme::none());
        let subjects = easy_subjects(6);
        let config = FitConfig {
            max_iter: 60,
            seed: 11,
            n_restarts: 4,
            init: InitStrategy::DataAnchored,
            ..FitConfig::default()
        };
        let outcome = fit(&spec, &subjects, &config).unwrap();
        assert_eq!(outcome.status, FitStatus::Converged);
        assert!(outcome.n_iter < 60);
        for w in outcome.loglik_trace.windows(2) {
            assert!(w[1] + 1e-6 >= w[0], "trace decreased: {} -> {}", w[0], w[1]);
        }
        assert_eq!(outcome.restart_logliks.len(), 4);
        let best = outcome.restart_logliks.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        assert!((best - outcome.loglik).abs() < 1e-12);
        // The two fitted state means straddle the clusters.
        let mut means: Vec<f64> =
            (0..2).map(|s| outcome.params.emission_coefficients()[s][0][0]).collect();
        means.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert!(means[0] < -1.0 && means[1] > 1.0, "means: {means:?}");
    }

    #[test]
    fn same_seed_is_bitwise_reproducible() {
        let spec = two_state_spec(PersonalizationScheme::emission_only());
        let subjects = easy_subjects(4);
        let config = FitConfig { max_iter: 8, seed: 5, ..FitConfig::default() };
        let a = fit(&spec, &subjects, &config).unwrap();
        let b = fit(&spec, &subjects, &config).unwrap();
        assert_eq!(a.params, b.params);
        assert_eq!(a.loglik_trace, b.loglik_trace);
    }

    #[test]
    fn multiple_restarts_report_per_restart_logliks_and_keep_the_best() {
        let spec = two_state_spec(PersonalizationScheme::none());
        let subjects = easy_subjects(4);
        let config = FitConfig {
            max_iter: 25,
            n_restarts: 3,
            seed: 2,
            ..FitConfig::default()
        };
        let outcome = fit(&spec, &subjects, &config).unwrap();
        assert_eq!(outcome.restart_logliks.len(), 3);
        let best = outcome
            .restart_logliks
            .iter()
            .cloned()
            .fold(f64::NEG_INFINITY, f64::max);
        assert!((outcome.loglik - best).abs() < 1e-12);
    }

    #[test]
    fn poisoned_subject_fails_the_fit_with_its_id() {
        let spec = two_state_spec(PersonalizationScheme::none());
        let mut subjects = easy_subjects(3);
        subjects.push(
            Subject::new(
                "poisoned",
                vec![vec![1.0], vec![f64::NAN]],
                vec![vec![0.0], vec![0.0]],
            )
            .unwrap(),
        );
        let config = FitConfig { max_iter: 10, ..FitConfig::default() };
        let err = fit(&spec, &subjects, &config).unwrap_err();
        assert_eq!(err.subject(), Some("poisoned"));
        assert!(matches!(err, Error::NumericalInstability { .. }));
    }

    #[test]
    fn duplicate_subject_ids_are_rejected() {
        let spec = two_state_spec(PersonalizationScheme::none());
        let s = Subject::new("dup", vec![vec![1.0]], vec![vec![0.0]]).unwrap();
        let err = fit(&spec, &[s.clone(), s], &FitConfig::default()).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn pre_set_cancellation_returns_the_initial_parameters() {
        let spec = two_state_spec(PersonalizationScheme::none());
        let subjects = easy_subjects(3);
        let config = FitConfig { max_iter: 50, seed: 9, ..FitConfig::default() };
        let cancel = AtomicBool::new(true);
        let outcome = fit_with_cancel(&spec, &subjects, &config, &cancel).unwrap();
        assert_eq!(outcome.status, FitStatus::Cancelled);
        assert!(outcome.loglik_trace.is_empty());
        assert_eq!(outcome.n_iter, 0);
        // The parameters are exactly the (reproducible) starting point.
        let start =
            init::initialize(&spec, &subjects, &config.init, config.seed, config.min_var)
                .unwrap();
        assert_eq!(outcome.params.initial(), start.initial());
    }

    #[test]
    fn monotonicity_check_flags_real_decreases_only() {
        assert!(non_decreasing(-100.0, -99.0));
        assert!(non_decreasing(-100.0, -100.0));
        // Inside the floating-point slack.
        assert!(non_decreasing(-100.0, -100.00001));
        // A genuine decrease.
        assert!(!non_decreasing(-100.0, -101.0));
    }

    #[test]
    fn personalized_fit_stores_one_vector_per_subject() {
        let spec = two_state_spec(PersonalizationScheme::emission_only());
        let subjects = easy_subjects(5);
        let config = FitConfig { max_iter: 15, seed: 3, ..FitConfig::default() };
        let outcome = fit(&spec, &subjects, &config).unwrap();
        assert_eq!(outcome.params.personalization().len(), 5);
        for (id, v) in outcome.params.personalization() {
            assert_eq!(v.len(), spec.personalization_dim(), "subject {id}");
            assert!(v.iter().all(|x| x.is_finite()));
        }
        assert_eq!(outcome.params.prior().dim(), spec.personalization_dim());
    }
}
