//! Materialization of per-step transition matrices and emission
//! likelihoods from covariates, coefficients, and personalization offsets.
//!
//! Both recursions (forward-backward and Viterbi) and the one-step-ahead
//! predictor consume exactly these functions, so the transition and
//! emission models can never drift apart between fitting and decoding.
//!
//! Non-finite covariates are allowed to flow through the linear predictors
//! here; the recursion layers detect the resulting non-finite scale
//! factors and report them per subject.

use ph_core::Result;
use ph_prob::density::{categorical_logpmf, normal_logpdf, poisson_logpmf};
use ph_prob::math::{exp_clamped, log_softmax};

use crate::data::Subject;
use crate::model::{EmissionFamily, ModelSpec};
use crate::params::ParameterSet;

/// Log-transition matrix for one time step.
///
/// Row `j` is the log-softmax of the `j -> *` logits under `input`;
/// structurally forbidden cells stay at `-inf`. Exponentiating any row
/// yields a probability distribution over the reachable states.
pub fn transition_log_matrix(
    spec: &ModelSpec,
    params: &ParameterSet,
    pers: &[f64],
    input: &[f64],
) -> Vec<Vec<f64>> {
    let k = spec.n_states();
    let covs = spec.transition_covariates();
    let mut rows = Vec::with_capacity(k);
    for from in 0..k {
        let mut logits = vec![f64::NEG_INFINITY; k];
        for (to, logit) in logits.iter_mut().enumerate() {
            if !spec.allows_transition(from, to) {
                continue;
            }
            let mut z = 0.0;
            for (c, &col) in covs.iter().enumerate() {
                z += params.transition[from][to][c] * input[col];
            }
            if to == from {
                if let Some(idx) = spec.transition_offset_index(from) {
                    z += pers[idx];
                }
            }
            *logit = z;
        }
        rows.push(log_softmax(&logits));
    }
    rows
}

/// Per-state emission log-likelihood of one step's output vector.
///
/// Masked steps contribute zero log-likelihood in every state, so the
/// chain coasts on transitions across missed visits.
pub fn emission_log_likelihoods(
    spec: &ModelSpec,
    params: &ParameterSet,
    pers: &[f64],
    input: &[f64],
    output: &[f64],
    observed: bool,
) -> Result<Vec<f64>> {
    let k = spec.n_states();
    if !observed {
        return Ok(vec![0.0; k]);
    }
    let covs = spec.emission_covariates();
    let predictor = |state: usize, channel: usize| -> f64 {
        let mut z = 0.0;
        for (c, &col) in covs.iter().enumerate() {
            z += params.emission[state][channel][c] * input[col];
        }
        if let Some(idx) = spec.emission_offset_index(state, channel) {
            z += pers[idx];
        }
        z
    };

    let mut out = Vec::with_capacity(k);
    match spec.emission_family() {
        EmissionFamily::Gaussian => {
            for state in 0..k {
                let mut ll = 0.0;
                for d in 0..spec.n_outputs() {
                    ll += normal_logpdf(output[d], predictor(state, d), params.variance[state][d])?;
                }
                out.push(ll);
            }
        }
        EmissionFamily::Poisson => {
            for state in 0..k {
                let mut ll = 0.0;
                for d in 0..spec.n_outputs() {
                    let rate = exp_clamped(predictor(state, d));
                    if rate.is_finite() {
                        ll += poisson_logpmf(output[d], rate)?;
                    } else {
                        ll = f64::NAN;
                    }
                }
                out.push(ll);
            }
        }
        EmissionFamily::Categorical { n_categories } => {
            for state in 0..k {
                let logits: Vec<f64> = (0..n_categories).map(|ch| predictor(state, ch)).collect();
                let y = output[0];
                let ll = if y.is_finite() {
                    categorical_logpmf(y as usize, &logits)?
                } else {
                    f64::NAN
                };
                out.push(ll);
            }
        }
    }
    Ok(out)
}

/// All per-step matrices for one subject, materialized once.
pub(crate) struct SequenceMatrices {
    /// `log_lik[t][k]` — emission log-likelihood of step `t` under state `k`.
    pub(crate) log_lik: Vec<Vec<f64>>,
    /// `log_trans[t]` — log-transition matrix governing the move into step
    /// `t + 1`, materialized from the covariates at step `t + 1`.
    pub(crate) log_trans: Vec<Vec<Vec<f64>>>,
}

pub(crate) fn materialize_sequence(
    spec: &ModelSpec,
    params: &ParameterSet,
    pers: &[f64],
    subject: &Subject,
) -> Result<SequenceMatrices> {
    let t_len = subject.len();
    let mut log_lik = Vec::with_capacity(t_len);
    for t in 0..t_len {
        log_lik.push(emission_log_likelihoods(
            spec,
            params,
            pers,
            subject.input(t),
            subject.output(t),
            subject.is_observed(t),
        )?);
    }
    let mut log_trans = Vec::with_capacity(t_len.saturating_sub(1));
    for t in 1..t_len {
        log_trans.push(transition_log_matrix(spec, params, pers, subject.input(t)));
    }
    Ok(SequenceMatrices { log_lik, log_trans })
}
