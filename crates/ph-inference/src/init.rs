//! Seeded parameter initialization for the EM fit.
//!
//! Both data-free and data-anchored strategies fabricate soft
//! responsibilities and push them through one regular M-step, so a fresh
//! start is always shaped exactly like a mid-fit parameter set. Restart
//! `r` receives `seed + r`, and the same seed reproduces the same start
//! bit for bit.

use ph_core::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::data::Subject;
use crate::forward_backward::Posterior;
use crate::maximizer;
use crate::model::ModelSpec;
use crate::params::ParameterSet;

/// Self-transition boost applied to the fabricated pairwise weights.
/// Disease-state sequences are persistence-dominated, and a
/// diagonal-heavy start keeps early iterations from mixing the states.
const PERSISTENCE_BOOST: f64 = 3.0;

/// How the starting parameters of a restart are chosen.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum InitStrategy {
    /// Random soft responsibilities with a persistence bias, one M-step,
    /// then small seeded noise on the coefficient tensors.
    #[default]
    Random,
    /// Soft responsibilities from distances to randomly chosen anchor
    /// observations, then one M-step. Anchors the states to separated
    /// regions of the output space.
    DataAnchored,
    /// Start from an explicitly provided parameter set (validated against
    /// the specification at fit time).
    Warm(Box<ParameterSet>),
}

/// Produce the starting [`ParameterSet`] for one restart.
pub(crate) fn initialize(
    spec: &ModelSpec,
    subjects: &[Subject],
    strategy: &InitStrategy,
    seed: u64,
    min_var: f64,
) -> Result<ParameterSet> {
    match strategy {
        InitStrategy::Warm(params) => {
            let params = (**params).clone();
            params.validate_against(spec)?;
            Ok(params)
        }
        InitStrategy::Random => {
            let mut rng = StdRng::seed_from_u64(seed);
            let gammas = random_responsibilities(spec, subjects, &mut rng);
            let mut params = synthetic_m_step(spec, subjects, gammas, min_var)?;
            perturb_coefficients(spec, &mut params, &mut rng);
            Ok(params)
        }
        InitStrategy::DataAnchored => {
            let mut rng = StdRng::seed_from_u64(seed);
            let gammas = anchored_responsibilities(spec, subjects, &mut rng);
            synthetic_m_step(spec, subjects, gammas, min_var)
        }
    }
}

/// Fabricate diagonal-heavy pairwise weights from consecutive state
/// marginals and run one M-step from the zeroed parameter set.
fn synthetic_m_step(
    spec: &ModelSpec,
    subjects: &[Subject],
    gammas: Vec<Vec<Vec<f64>>>,
    min_var: f64,
) -> Result<ParameterSet> {
    let k = spec.n_states();
    let mut posteriors = Vec::with_capacity(subjects.len());
    for gamma in gammas {
        let t_len = gamma.len();
        let mut xi = Vec::with_capacity(t_len.saturating_sub(1));
        for t in 1..t_len {
            let mut slice = vec![vec![0.0; k]; k];
            let mut total = 0.0;
            for (j, row) in slice.iter_mut().enumerate() {
                for (s, cell) in row.iter_mut().enumerate() {
                    if !spec.allows_transition(j, s) {
                        continue;
                    }
                    let boost = if j == s { PERSISTENCE_BOOST } else { 1.0 };
                    *cell = boost * gamma[t - 1][j] * gamma[t][s];
                    total += *cell;
                }
            }
            for row in slice.iter_mut() {
                for cell in row.iter_mut() {
                    *cell /= total;
                }
            }
            xi.push(slice);
        }
        posteriors.push(Posterior { gamma, xi, loglik: 0.0 });
    }
    let base = ParameterSet::zeroed(spec)?;
    maximizer::maximize(spec, subjects, &posteriors, &base, min_var, 0.0)
}

fn random_responsibilities(
    spec: &ModelSpec,
    subjects: &[Subject],
    rng: &mut StdRng,
) -> Vec<Vec<Vec<f64>>> {
    let k = spec.n_states();
    subjects
        .iter()
        .map(|subject| {
            (0..subject.len())
                .map(|_| {
                    let mut row: Vec<f64> =
                        (0..k).map(|_| rng.random::<f64>() + 0.1).collect();
                    let total: f64 = row.iter().sum();
                    for g in row.iter_mut() {
                        *g /= total;
                    }
                    row
                })
                .collect()
        })
        .collect()
}

/// Responsibilities from squared distances to K anchor observations drawn
/// uniformly from the observed steps. The length scale is the pooled
/// output variance, so the softness adapts to the data's spread.
fn anchored_responsibilities(
    spec: &ModelSpec,
    subjects: &[Subject],
    rng: &mut StdRng,
) -> Vec<Vec<Vec<f64>>> {
    let k = spec.n_states();
    let observed: Vec<(usize, usize)> = subjects
        .iter()
        .enumerate()
        .flat_map(|(i, s)| (0..s.len()).filter(|&t| s.is_observed(t)).map(move |t| (i, t)))
        .collect();
    if observed.is_empty() {
        return random_responsibilities(spec, subjects, rng);
    }

    let anchors: Vec<&[f64]> = (0..k)
        .map(|_| {
            let (i, t) = observed[rng.random_range(0..observed.len())];
            subjects[i].output(t)
        })
        .collect();

    // Pooled output variance as the squared length scale.
    let n = observed.len() as f64;
    let d = spec.n_outputs() as f64;
    let mut mean = vec![0.0; spec.n_outputs()];
    for &(i, t) in &observed {
        for (m, &y) in mean.iter_mut().zip(subjects[i].output(t)) {
            *m += y / n;
        }
    }
    let mut pooled = 0.0;
    for &(i, t) in &observed {
        for (m, &y) in mean.iter().zip(subjects[i].output(t)) {
            pooled += (y - m) * (y - m) / (n * d);
        }
    }
    let scale2 = pooled.max(1e-6);

    subjects
        .iter()
        .map(|subject| {
            (0..subject.len())
                .map(|t| {
                    if !subject.is_observed(t) {
                        return vec![1.0 / k as f64; k];
                    }
                    let y = subject.output(t);
                    let mut row: Vec<f64> = anchors
                        .iter()
                        .map(|a| {
                            let d2: f64 =
                                y.iter().zip(a.iter()).map(|(&yi, &ai)| (yi - ai) * (yi - ai)).sum();
                            (-d2 / (2.0 * scale2)).exp() + 1e-3
                        })
                        .collect();
                    let total: f64 = row.iter().sum();
                    for g in row.iter_mut() {
                        *g /= total;
                    }
                    row
                })
                .collect()
        })
        .collect()
}

/// Small seeded noise on the coefficient tensors, skipping structurally
/// forbidden transition cells.
fn perturb_coefficients(spec: &ModelSpec, params: &mut ParameterSet, rng: &mut StdRng) {
    let k = spec.n_states();
    for from in 0..k {
        for to in 0..k {
            if !spec.allows_transition(from, to) {
                continue;
            }
            for c in params.transition[from][to].iter_mut() {
                let z: f64 = rng.sample(StandardNormal);
                *c += 0.05 * z;
            }
        }
    }
    for state in params.emission.iter_mut() {
        for channel in state.iter_mut() {
            for c in channel.iter_mut() {
                let z: f64 = rng.sample(StandardNormal);
                *c += 0.05 * z;
            }
        }
    }
}
