//! Max-product decoding of the most likely latent-state path.
//!
//! The dynamic program runs entirely in log space on the same per-step
//! transition and emission materialization as forward-backward, so a
//! decoded path is always scored under exactly the parameters the fit
//! produced. Ties between predecessor states break toward the lowest
//! index, making decoding deterministic.

use ph_core::{Error, Result};
use rayon::prelude::*;

use crate::data::Subject;
use crate::glm::materialize_sequence;
use crate::model::ModelSpec;
use crate::params::ParameterSet;

/// MAP latent-state path for one subject.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPath {
    /// State label per time step, length equal to the subject's sequence.
    pub states: Vec<usize>,
    /// Joint log-probability of the path and the observations.
    pub log_prob: f64,
}

/// Decode one subject under fitted parameters.
///
/// Subjects never seen at fit time decode with zero personalization
/// (population-level parameters).
pub fn decode(spec: &ModelSpec, params: &ParameterSet, subject: &Subject) -> Result<DecodedPath> {
    spec.validate()?;
    params.validate_against(spec)?;
    subject.validate_against(spec)?;
    decode_unchecked(spec, params, subject)
}

/// Decode a collection of subjects in parallel.
pub fn decode_all(
    spec: &ModelSpec,
    params: &ParameterSet,
    subjects: &[Subject],
) -> Result<Vec<DecodedPath>> {
    spec.validate()?;
    params.validate_against(spec)?;
    for subject in subjects {
        subject.validate_against(spec)?;
    }
    subjects
        .par_iter()
        .map(|subject| decode_unchecked(spec, params, subject))
        .collect()
}

fn decode_unchecked(
    spec: &ModelSpec,
    params: &ParameterSet,
    subject: &Subject,
) -> Result<DecodedPath> {
    let pers = params.personalization_or_zero(spec, subject.id());
    let mats = materialize_sequence(spec, params, &pers, subject)?;
    let t_len = subject.len();
    let k = spec.n_states();

    // delta[t][s]: best cumulative log-probability of a path ending in s;
    // psi[t][s]: its predecessor.
    let mut delta = vec![vec![f64::NEG_INFINITY; k]; t_len];
    let mut psi = vec![vec![0usize; k]; t_len];

    for s in 0..k {
        delta[0][s] = params.initial()[s].ln() + mats.log_lik[0][s];
    }
    ensure_column_valid(&delta[0], 0, subject.id())?;

    for t in 1..t_len {
        for s in 0..k {
            let mut best = f64::NEG_INFINITY;
            let mut best_j = 0;
            for j in 0..k {
                let score = delta[t - 1][j] + mats.log_trans[t - 1][j][s];
                // Strict improvement keeps the lowest-indexed predecessor
                // on ties.
                if score > best {
                    best = score;
                    best_j = j;
                }
            }
            delta[t][s] = best + mats.log_lik[t][s];
            psi[t][s] = best_j;
        }
        ensure_column_valid(&delta[t], t, subject.id())?;
    }

    let last = &delta[t_len - 1];
    let mut best_state = 0;
    let mut best_score = f64::NEG_INFINITY;
    for (s, &score) in last.iter().enumerate() {
        if score > best_score {
            best_score = score;
            best_state = s;
        }
    }

    let mut states = vec![0usize; t_len];
    states[t_len - 1] = best_state;
    for t in (1..t_len).rev() {
        states[t - 1] = psi[t][states[t]];
    }

    Ok(DecodedPath { states, log_prob: best_score })
}

/// The column is degenerate when no state has a finite score or any score
/// is NaN, the same conditions that trip forward-backward's scaling.
fn ensure_column_valid(column: &[f64], step: usize, subject_id: &str) -> Result<()> {
    let mut all_neg_inf = true;
    for &score in column {
        if score.is_nan() {
            return Err(Error::NumericalInstability {
                subject: subject_id.to_string(),
                detail: format!("NaN path score at step {step}"),
            });
        }
        if score > f64::NEG_INFINITY {
            all_neg_inf = false;
        }
    }
    if all_neg_inf {
        return Err(Error::NumericalInstability {
            subject: subject_id.to_string(),
            detail: format!("all path scores are -inf at step {step}"),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::glm::{emission_log_likelihoods, transition_log_matrix};
    use crate::model::{EmissionFamily, PersonalizationScheme, TransitionStructure};

    fn spec_k2() -> ModelSpec {
        ModelSpec::intercept_only(
            2,
            1,
            EmissionFamily::Gaussian,
            PersonalizationScheme::none(),
        )
        .unwrap()
    }

    fn separated_params(spec: &ModelSpec) -> ParameterSet {
        let mut p = ParameterSet::zeroed(spec).unwrap();
        p.initial = vec![0.7, 0.3];
        p.emission[0][0][0] = -1.0;
        p.emission[1][0][0] = 1.0;
        p.variance = vec![vec![0.4], vec![0.4]];
        p.transition[0][0][0] = 0.8; // sticky states
        p.transition[1][1][0] = 0.8;
        p
    }

    /// Joint log-probability of an explicit path, computed directly from
    /// the same materialized matrices the decoder uses.
    fn path_log_prob(
        spec: &ModelSpec,
        params: &ParameterSet,
        subject: &Subject,
        states: &[usize],
    ) -> f64 {
        let mut lp = params.initial()[states[0]].ln()
            + emission_log_likelihoods(
                spec,
                params,
                &[],
                subject.input(0),
                subject.output(0),
                subject.is_observed(0),
            )
            .unwrap()[states[0]];
        for t in 1..subject.len() {
            let la = transition_log_matrix(spec, params, &[], subject.input(t));
            lp += la[states[t - 1]][states[t]]
                + emission_log_likelihoods(
                    spec,
                    params,
                    &[],
                    subject.input(t),
                    subject.output(t),
                    subject.is_observed(t),
                )
                .unwrap()[states[t]];
        }
        lp
    }

    #[test]
    fn viterbi_beats_every_brute_force_path() {
        let spec = spec_k2();
        let params = separated_params(&spec);
        let subject = Subject::new(
            "s",
            vec![vec![1.0]; 3],
            vec![vec![-0.8], vec![0.3], vec![1.4]],
        )
        .unwrap();
        let decoded = decode(&spec, &params, &subject).unwrap();

        let mut best_brute = f64::NEG_INFINITY;
        let mut best_path = Vec::new();
        for code in 0..8usize {
            let states = vec![code & 1, (code >> 1) & 1, (code >> 2) & 1];
            let lp = path_log_prob(&spec, &params, &subject, &states);
            if lp > best_brute {
                best_brute = lp;
                best_path = states;
            }
        }
        assert!(
            (decoded.log_prob - best_brute).abs() < 1e-10,
            "{} vs {best_brute}",
            decoded.log_prob
        );
        assert_eq!(decoded.states, best_path);
    }

    #[test]
    fn ties_break_toward_the_lowest_state_index() {
        let spec = spec_k2();
        // Zeroed parameters make every path equally likely.
        let params = ParameterSet::zeroed(&spec).unwrap();
        let subject =
            Subject::new("s", vec![vec![1.0]; 4], vec![vec![0.0]; 4]).unwrap();
        let decoded = decode(&spec, &params, &subject).unwrap();
        assert_eq!(decoded.states, vec![0, 0, 0, 0]);
    }

    #[test]
    fn single_step_path_is_the_argmax_state() {
        let spec = spec_k2();
        let params = separated_params(&spec);
        let subject = Subject::new("s", vec![vec![1.0]], vec![vec![1.2]]).unwrap();
        let decoded = decode(&spec, &params, &subject).unwrap();
        assert_eq!(decoded.states, vec![1]);
        let expect = path_log_prob(&spec, &params, &subject, &[1]);
        assert!((decoded.log_prob - expect).abs() < 1e-12);
    }

    #[test]
    fn progressive_paths_never_step_backward() {
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
        let mut params = ParameterSet::zeroed(&spec).unwrap();
        for s in 0..3 {
            params.emission[s][0][0] = s as f64;
        }
        // Outputs that would tempt a backward move under a full structure.
        let subject = Subject::new(
            "s",
            vec![vec![1.0]; 5],
            vec![vec![0.0], vec![2.0], vec![0.1], vec![1.9], vec![0.2]],
        )
        .unwrap();
        let decoded = decode(&spec, &params, &subject).unwrap();
        for w in decoded.states.windows(2) {
            assert!(w[1] >= w[0], "path stepped backward: {:?}", decoded.states);
        }
    }

    #[test]
    fn non_finite_input_is_an_instability() {
        let spec = spec_k2();
        let params = separated_params(&spec);
        let subject = Subject::new(
            "bad",
            vec![vec![1.0], vec![f64::INFINITY]],
            vec![vec![0.0], vec![0.0]],
        )
        .unwrap();
        let err = decode(&spec, &params, &subject).unwrap_err();
        match err {
            Error::NumericalInstability { subject, .. } => assert_eq!(subject, "bad"),
            other => panic!("expected instability, got {other:?}"),
        }
    }

    #[test]
    fn decode_all_matches_individual_decodes() {
        let spec = spec_k2();
        let params = separated_params(&spec);
        let subjects: Vec<Subject> = (0..3)
            .map(|i| {
                Subject::new(
                    format!("s-{i}"),
                    vec![vec![1.0]; 4],
                    vec![vec![-1.0], vec![i as f64 - 1.0], vec![1.0], vec![0.5]],
                )
                .unwrap()
            })
            .collect();
        let all = decode_all(&spec, &params, &subjects).unwrap();
        for (subject, path) in subjects.iter().zip(all.iter()) {
            let single = decode(&spec, &params, subject).unwrap();
            assert_eq!(*path, single);
        }
    }

    #[test]
    fn personalized_offset_changes_the_decoded_path() {
        let spec = ModelSpec::intercept_only(
            2,
            1,
            EmissionFamily::Gaussian,
            PersonalizationScheme::emission_only(),
        )
        .unwrap();
        let mut params = separated_params_personalized(&spec);
        // Subject whose outputs sit between the state means.
        let subject =
            Subject::new("shifted", vec![vec![1.0]; 3], vec![vec![0.4]; 3]).unwrap();
        let population = decode(&spec, &params, &subject).unwrap();
        // A large negative offset on state 1's mean pulls it away from
        // the observations; the path flips to state 0.
        params
            .personalization
            .insert("shifted".to_string(), vec![0.0, -3.0]);
        let personalized = decode(&spec, &params, &subject).unwrap();
        assert_eq!(population.states, vec![1, 1, 1]);
        assert_eq!(personalized.states, vec![0, 0, 0]);
    }

    fn separated_params_personalized(spec: &ModelSpec) -> ParameterSet {
        let mut p = ParameterSet::zeroed(spec).unwrap();
        p.initial = vec![0.5, 0.5];
        p.emission[0][0][0] = -1.0;
        p.emission[1][0][0] = 1.0;
        p.variance = vec![vec![0.4], vec![0.4]];
        p
    }
}
