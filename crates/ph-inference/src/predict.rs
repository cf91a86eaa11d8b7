//! Held-out scoring, posterior extraction, and one-step-ahead prediction
//! under fixed, already-fitted parameters.

use ph_core::{Error, Result};
use rayon::prelude::*;

use crate::data::Subject;
use crate::forward_backward::{forward_backward, forward_pass};
use crate::glm::{materialize_sequence, transition_log_matrix};
use crate::model::ModelSpec;
use crate::params::ParameterSet;

/// Total forward log-likelihood of `subjects` under fixed parameters.
///
/// No fitting happens; subjects unseen at fit time are scored with zero
/// personalization.
pub fn score(spec: &ModelSpec, params: &ParameterSet, subjects: &[Subject]) -> Result<f64> {
    spec.validate()?;
    params.validate_against(spec)?;
    for subject in subjects {
        subject.validate_against(spec)?;
    }
    let logliks: Vec<f64> = subjects
        .par_iter()
        .map(|subject| {
            let pers = params.personalization_or_zero(spec, subject.id());
            let mats = materialize_sequence(spec, params, &pers, subject)?;
            let (_, scaling) = forward_pass(params.initial(), &mats, subject.id())?;
            Ok(scaling.iter().sum())
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(logliks.iter().sum())
}

/// Smoothed per-step state marginals for one subject under fixed
/// parameters. Row `t` sums to 1 across states.
pub fn state_probabilities(
    spec: &ModelSpec,
    params: &ParameterSet,
    subject: &Subject,
) -> Result<Vec<Vec<f64>>> {
    spec.validate()?;
    params.validate_against(spec)?;
    subject.validate_against(spec)?;
    Ok(forward_backward(spec, params, subject)?.gamma)
}

/// Predictive state distribution for the step after the subject's last
/// observation: the filtered terminal belief propagated through the
/// transition matrix materialized from `next_input`.
pub fn predict_next(
    spec: &ModelSpec,
    params: &ParameterSet,
    subject: &Subject,
    next_input: &[f64],
) -> Result<Vec<f64>> {
    spec.validate()?;
    params.validate_against(spec)?;
    subject.validate_against(spec)?;
    if next_input.len() != spec.n_inputs() {
        return Err(Error::Configuration(format!(
            "next_input has {} columns, expected {}",
            next_input.len(),
            spec.n_inputs()
        )));
    }

    let pers = params.personalization_or_zero(spec, subject.id());
    let mats = materialize_sequence(spec, params, &pers, subject)?;
    let (alpha, _) = forward_pass(params.initial(), &mats, subject.id())?;
    let filtered: Vec<f64> = alpha[subject.len() - 1].iter().map(|&a| a.exp()).collect();

    let log_trans = transition_log_matrix(spec, params, &pers, next_input);
    let k = spec.n_states();
    let mut predictive = vec![0.0; k];
    for (j, &belief) in filtered.iter().enumerate() {
        for (s, p) in predictive.iter_mut().enumerate() {
            *p += belief * log_trans[j][s].exp();
        }
    }
    for p in &predictive {
        if !p.is_finite() {
            return Err(Error::NumericalInstability {
                subject: subject.id().to_string(),
                detail: "non-finite predictive state probability".to_string(),
            });
        }
    }
    Ok(predictive)
}
