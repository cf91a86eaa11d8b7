//! Scaled forward-backward recursions in log space.
//!
//! The per-step scale factor is the log-sum-exp of the unnormalized
//! forward column; accumulating those factors gives the subject
//! log-likelihood without ever leaving log space, and a zero or non-finite
//! factor is the single detection point for degenerate parameters or
//! corrupt inputs.

use ph_core::{Error, Result};
use ph_prob::math::logsumexp;

use crate::data::Subject;
use crate::glm::{materialize_sequence, SequenceMatrices};
use crate::model::ModelSpec;
use crate::params::ParameterSet;

/// Posterior quantities for one subject under fixed parameters.
///
/// Recomputed every E-step and discarded afterwards; nothing here is
/// persisted.
#[derive(Debug, Clone)]
pub struct Posterior {
    /// `gamma[t][k]` — probability of being in state `k` at step `t`
    /// given the whole sequence. Each row sums to 1.
    pub gamma: Vec<Vec<f64>>,
    /// `xi[t][j][k]` — probability of the `j -> k` move between steps `t`
    /// and `t + 1`. Each `K × K` slice sums to 1; empty for length-1
    /// sequences.
    pub xi: Vec<Vec<Vec<f64>>>,
    /// Subject log-likelihood: the sum of the per-step scale factors.
    pub loglik: f64,
}

/// Run forward-backward for one subject using its stored personalization
/// (zero offsets for subjects unseen at fit time).
pub fn forward_backward(
    spec: &ModelSpec,
    params: &ParameterSet,
    subject: &Subject,
) -> Result<Posterior> {
    let pers = params.personalization_or_zero(spec, subject.id());
    forward_backward_with(spec, params, &pers, subject)
}

/// Forward-backward at an explicit personalization vector. The fitting
/// loop uses this to evaluate retry candidates without touching the
/// stored map.
pub(crate) fn forward_backward_with(
    spec: &ModelSpec,
    params: &ParameterSet,
    pers: &[f64],
    subject: &Subject,
) -> Result<Posterior> {
    let mats = materialize_sequence(spec, params, pers, subject)?;
    let (alpha, scaling) = forward_pass(params.initial(), &mats, subject.id())?;
    let beta = backward_pass(&mats, &scaling);

    let t_len = subject.len();
    let k = spec.n_states();
    let mut gamma = vec![vec![0.0; k]; t_len];
    for t in 0..t_len {
        for s in 0..k {
            gamma[t][s] = (alpha[t][s] + beta[t][s]).exp();
        }
    }

    let mut xi = Vec::with_capacity(t_len - 1);
    for t in 1..t_len {
        let mut slice = vec![vec![0.0; k]; k];
        for (j, row) in slice.iter_mut().enumerate() {
            for (s, cell) in row.iter_mut().enumerate() {
                *cell = (alpha[t - 1][j]
                    + mats.log_trans[t - 1][j][s]
                    + mats.log_lik[t][s]
                    + beta[t][s]
                    - scaling[t])
                    .exp();
            }
        }
        xi.push(slice);
    }

    Ok(Posterior { gamma, xi, loglik: scaling.iter().sum() })
}

/// Forward recursion with per-step log-sum-exp scaling.
///
/// Returns the scaled forward table (each row exponentiates to the
/// filtered state distribution) and the scale factors.
pub(crate) fn forward_pass(
    initial: &[f64],
    mats: &SequenceMatrices,
    subject_id: &str,
) -> Result<(Vec<Vec<f64>>, Vec<f64>)> {
    let t_len = mats.log_lik.len();
    let k = initial.len();
    let mut alpha = vec![vec![0.0; k]; t_len];
    let mut scaling = vec![0.0; t_len];
    let mut work = vec![0.0; k];

    for s in 0..k {
        work[s] = initial[s].ln() + mats.log_lik[0][s];
    }
    scaling[0] = logsumexp(&work);
    ensure_finite_scale(scaling[0], 0, subject_id)?;
    for s in 0..k {
        alpha[0][s] = work[s] - scaling[0];
    }

    let mut inbound = vec![0.0; k];
    for t in 1..t_len {
        for s in 0..k {
            for j in 0..k {
                inbound[j] = alpha[t - 1][j] + mats.log_trans[t - 1][j][s];
            }
            work[s] = mats.log_lik[t][s] + logsumexp(&inbound);
        }
        scaling[t] = logsumexp(&work);
        ensure_finite_scale(scaling[t], t, subject_id)?;
        for s in 0..k {
            alpha[t][s] = work[s] - scaling[t];
        }
    }
    Ok((alpha, scaling))
}

/// Backward recursion reusing the forward scale factors, so
/// `alpha[t] + beta[t]` exponentiates directly to the smoothed marginals.
fn backward_pass(mats: &SequenceMatrices, scaling: &[f64]) -> Vec<Vec<f64>> {
    let t_len = mats.log_lik.len();
    let k = mats.log_lik[0].len();
    let mut beta = vec![vec![0.0; k]; t_len];
    let mut outbound = vec![0.0; k];
    for t in (0..t_len.saturating_sub(1)).rev() {
        for j in 0..k {
            for s in 0..k {
                outbound[s] = beta[t + 1][s] + mats.log_lik[t + 1][s] + mats.log_trans[t][j][s];
            }
            beta[t][j] = logsumexp(&outbound) - scaling[t + 1];
        }
    }
    beta
}

fn ensure_finite_scale(c: f64, step: usize, subject_id: &str) -> Result<()> {
    if c.is_finite() {
        Ok(())
    } else {
        Err(Error::NumericalInstability {
            subject: subject_id.to_string(),
            detail: format!("scale factor {c} at step {step}"),
        })
    }
}
