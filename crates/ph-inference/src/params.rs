//! Parameter containers: global coefficient tensors, per-subject
//! personalization vectors, and the personalization prior covariance.

use std::collections::BTreeMap;

use ph_core::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::model::{EmissionFamily, ModelSpec};

/// Natural log of `2π`, precomputed.
const LN_2PI: f64 = 1.837_877_066_409_345_3;

// ---------------------------------------------------------------------------
// PersonalizationPrior: Cholesky-parameterized covariance
// ---------------------------------------------------------------------------

/// Zero-mean Gaussian prior over personalization vectors, stored as the
/// lower-triangular Cholesky factor **L** of its covariance so the matrix
/// is positive-definite by construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "PriorDto", try_from = "PriorDto")]
pub struct PersonalizationPrior {
    /// Lower-triangular Cholesky factor (row-major, `n × n`).
    chol: Vec<Vec<f64>>,
    /// Dimension of the personalization vector.
    n: usize,
}

impl PersonalizationPrior {
    /// Independent components with the given standard deviations.
    ///
    /// An empty slice is valid and describes the zero-dimensional prior
    /// used when no parameter block is personalized.
    pub fn from_diagonal(sds: &[f64]) -> Result<Self> {
        for (i, &s) in sds.iter().enumerate() {
            if !s.is_finite() || s <= 0.0 {
                return Err(Error::Configuration(format!(
                    "prior SD[{i}] must be finite and > 0, got {s}"
                )));
            }
        }
        let n = sds.len();
        let mut chol = vec![vec![0.0; n]; n];
        for i in 0..n {
            chol[i][i] = sds[i];
        }
        Ok(Self { chol, n })
    }

    /// Build from a full covariance matrix via Cholesky decomposition.
    pub fn from_covariance(cov: &[Vec<f64>]) -> Result<Self> {
        let n = cov.len();
        let mut l = vec![vec![0.0; n]; n];
        for i in 0..n {
            if cov[i].len() != n {
                return Err(Error::Configuration(format!(
                    "covariance row {i} has length {}, expected {n}",
                    cov[i].len()
                )));
            }
            for j in 0..=i {
                let mut sum = 0.0;
                for k in 0..j {
                    sum += l[i][k] * l[j][k];
                }
                if i == j {
                    let diag = cov[i][i] - sum;
                    if !diag.is_finite() || diag <= 0.0 {
                        return Err(Error::Configuration(format!(
                            "covariance not positive-definite at [{i}][{i}]"
                        )));
                    }
                    l[i][j] = diag.sqrt();
                } else {
                    l[i][j] = (cov[i][j] - sum) / l[j][j];
                }
            }
        }
        Ok(Self { chol: l, n })
    }

    /// Shrunk empirical covariance of a set of personalization vectors:
    /// `(1/N) Σ v·vᵀ`, ridge-floored on the diagonal by `min_var` and with
    /// off-diagonals capped so every correlation stays inside (-1, 1).
    pub fn empirical(vectors: &[Vec<f64>], dim: usize, min_var: f64) -> Result<Self> {
        if vectors.is_empty() {
            return Err(Error::Configuration(
                "empirical prior needs at least one personalization vector".to_string(),
            ));
        }
        let mut cov = vec![vec![0.0; dim]; dim];
        for v in vectors {
            for i in 0..dim {
                for j in 0..=i {
                    cov[i][j] += v[i] * v[j];
                }
            }
        }
        let nf = vectors.len() as f64;
        for i in 0..dim {
            for j in 0..=i {
                cov[i][j] /= nf;
                cov[j][i] = cov[i][j];
            }
        }
        for i in 0..dim {
            cov[i][i] += min_var;
        }
        for i in 0..dim {
            for j in 0..i {
                let max_abs = (cov[i][i] * cov[j][j]).sqrt() * 0.999;
                cov[i][j] = cov[i][j].clamp(-max_abs, max_abs);
                cov[j][i] = cov[i][j];
            }
        }
        Self::from_covariance(&cov)
    }

    /// Convex blend `damping·prev + (1-damping)·self` of two covariances,
    /// re-shrunk for positive-definiteness.
    pub fn blend_with(&self, prev: &PersonalizationPrior, damping: f64) -> Result<Self> {
        let n = self.n;
        let a = prev.to_matrix();
        let b = self.to_matrix();
        let mut cov = vec![vec![0.0; n]; n];
        for i in 0..n {
            for j in 0..=i {
                cov[i][j] = damping * a[i][j] + (1.0 - damping) * b[i][j];
                cov[j][i] = cov[i][j];
            }
        }
        for i in 0..n {
            for j in 0..i {
                let max_abs = (cov[i][i] * cov[j][j]).sqrt() * 0.999;
                cov[i][j] = cov[i][j].clamp(-max_abs, max_abs);
                cov[j][i] = cov[i][j];
            }
        }
        Self::from_covariance(&cov)
    }

    /// Dimension of the personalization vector this prior covers.
    pub fn dim(&self) -> usize {
        self.n
    }

    /// Reconstruct the full covariance `L·Lᵀ`.
    pub fn to_matrix(&self) -> Vec<Vec<f64>> {
        let n = self.n;
        let mut m = vec![vec![0.0; n]; n];
        for i in 0..n {
            for j in 0..=i {
                let mut s = 0.0;
                for k in 0..=j {
                    s += self.chol[i][k] * self.chol[j][k];
                }
                m[i][j] = s;
                m[j][i] = s;
            }
        }
        m
    }

    /// Standard deviations (square roots of the covariance diagonal).
    pub fn sds(&self) -> Vec<f64> {
        let m = self.to_matrix();
        (0..self.n).map(|i| m[i][i].sqrt()).collect()
    }

    /// `log |det Σ| = 2 · Σ ln L_ii`.
    pub fn log_det(&self) -> f64 {
        2.0 * (0..self.n).map(|i| self.chol[i][i].ln()).sum::<f64>()
    }

    /// `vᵀ Σ⁻¹ v` via forward substitution (`L z = v`, then `|z|²`).
    pub fn inv_quadratic(&self, v: &[f64]) -> f64 {
        let n = self.n;
        let mut z = vec![0.0; n];
        for i in 0..n {
            let mut s = v[i];
            for j in 0..i {
                s -= self.chol[i][j] * z[j];
            }
            z[i] = s / self.chol[i][i];
        }
        z.iter().map(|x| x * x).sum()
    }

    /// Log-density of `N(0, Σ)` at `v`. Zero for the zero-dimensional prior.
    pub fn log_density(&self, v: &[f64]) -> f64 {
        if self.n == 0 {
            return 0.0;
        }
        -0.5 * (self.inv_quadratic(v) + self.log_det() + self.n as f64 * LN_2PI)
    }
}

/// Serde DTO: the prior round-trips through its covariance matrix so
/// deserialization re-validates positive-definiteness.
#[derive(Serialize, Deserialize)]
struct PriorDto {
    covariance: Vec<Vec<f64>>,
}

impl From<PersonalizationPrior> for PriorDto {
    fn from(p: PersonalizationPrior) -> Self {
        Self { covariance: p.to_matrix() }
    }
}

impl TryFrom<PriorDto> for PersonalizationPrior {
    type Error = String;
    fn try_from(dto: PriorDto) -> std::result::Result<Self, Self::Error> {
        PersonalizationPrior::from_covariance(&dto.covariance).map_err(|e| e.to_string())
    }
}

// ---------------------------------------------------------------------------
// ParameterSet
// ---------------------------------------------------------------------------

/// Everything the model learned: global coefficient tensors, per-subject
/// personalization vectors, and the personalization prior.
///
/// Tensor layout (all row-major nested `Vec`s):
/// - `initial[k]` — initial-state probability, sums to 1.
/// - `transition[j][k][c]` — coefficient of transition covariate `c` in the
///   `j -> k` logit; rows are normalized through a softmax at
///   materialization time.
/// - `emission[k][ch][c]` — coefficient of emission covariate `c` in the
///   linear predictor of channel `ch` under state `k` (channels are output
///   dimensions, or category levels for the categorical family).
/// - `variance[k][d]` — Gaussian emission variance per (state, output),
///   empty for other families.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    pub(crate) initial: Vec<f64>,
    pub(crate) transition: Vec<Vec<Vec<f64>>>,
    pub(crate) emission: Vec<Vec<Vec<f64>>>,
    pub(crate) variance: Vec<Vec<f64>>,
    pub(crate) personalization: BTreeMap<String, Vec<f64>>,
    pub(crate) prior: PersonalizationPrior,
}

impl ParameterSet {
    /// Build a parameter set from explicit tensors.
    ///
    /// Shapes are validated against `spec`; the personalization map starts
    /// empty and the prior defaults to independent unit-variance
    /// components (replaceable via [`ParameterSet::with_prior`]).
    pub fn new(
        spec: &ModelSpec,
        initial: Vec<f64>,
        transition: Vec<Vec<Vec<f64>>>,
        emission: Vec<Vec<Vec<f64>>>,
        variance: Vec<Vec<f64>>,
    ) -> Result<Self> {
        let prior = PersonalizationPrior::from_diagonal(&vec![1.0; spec.personalization_dim()])?;
        let set = Self {
            initial,
            transition,
            emission,
            variance,
            personalization: BTreeMap::new(),
            prior,
        };
        set.validate_against(spec)?;
        Ok(set)
    }

    /// All-zero coefficients: uniform initial distribution, uniform
    /// materialized transitions, zero linear predictors, unit variances.
    pub fn zeroed(spec: &ModelSpec) -> Result<Self> {
        let k = spec.n_states();
        let pt = spec.transition_covariates().len();
        let pe = spec.emission_covariates().len();
        let variance = match spec.emission_family() {
            EmissionFamily::Gaussian => vec![vec![1.0; spec.n_outputs()]; k],
            _ => Vec::new(),
        };
        Self::new(
            spec,
            vec![1.0 / k as f64; k],
            vec![vec![vec![0.0; pt]; k]; k],
            vec![vec![vec![0.0; pe]; spec.n_channels()]; k],
            variance,
        )
    }

    /// Replace the personalization prior.
    pub fn with_prior(mut self, prior: PersonalizationPrior) -> Self {
        self.prior = prior;
        self
    }

    /// Initial-state distribution.
    pub fn initial(&self) -> &[f64] {
        &self.initial
    }

    /// Transition coefficient tensor, `[from][to][covariate]`.
    pub fn transition_coefficients(&self) -> &[Vec<Vec<f64>>] {
        &self.transition
    }

    /// Emission coefficient tensor, `[state][channel][covariate]`.
    pub fn emission_coefficients(&self) -> &[Vec<Vec<f64>>] {
        &self.emission
    }

    /// Gaussian emission variances, `[state][output]`; empty for the
    /// categorical and Poisson families.
    pub fn variances(&self) -> &[Vec<f64>] {
        &self.variance
    }

    /// Personalization vectors keyed by subject id.
    pub fn personalization(&self) -> &BTreeMap<String, Vec<f64>> {
        &self.personalization
    }

    /// Stored personalization for one subject, if any.
    pub fn personalization_for(&self, subject_id: &str) -> Option<&[f64]> {
        self.personalization.get(subject_id).map(Vec::as_slice)
    }

    /// Personalization for a subject, falling back to zero offsets for
    /// subjects never seen during fitting.
    pub(crate) fn personalization_or_zero(&self, spec: &ModelSpec, subject_id: &str) -> Vec<f64> {
        match self.personalization.get(subject_id) {
            Some(v) => v.clone(),
            None => vec![0.0; spec.personalization_dim()],
        }
    }

    /// Personalization prior.
    pub fn prior(&self) -> &PersonalizationPrior {
        &self.prior
    }

    /// Check every tensor shape and probability invariant against `spec`.
    ///
    /// Coefficients must be finite — a hand-built infinite coefficient is a
    /// configuration problem, distinct from the runtime instabilities that
    /// finite-but-extreme parameters can still produce.
    pub fn validate_against(&self, spec: &ModelSpec) -> Result<()> {
        let k = spec.n_states();
        let pt = spec.transition_covariates().len();
        let pe = spec.emission_covariates().len();

        if self.initial.len() != k {
            return Err(Error::Configuration(format!(
                "initial distribution has {} entries, expected {k}",
                self.initial.len()
            )));
        }
        let mut total = 0.0;
        for (i, &p) in self.initial.iter().enumerate() {
            if !p.is_finite() || p < 0.0 {
                return Err(Error::Configuration(format!(
                    "initial[{i}] = {p} is not a probability"
                )));
            }
            total += p;
        }
        if (total - 1.0).abs() > 1e-6 {
            return Err(Error::Configuration(format!(
                "initial distribution sums to {total}, expected 1"
            )));
        }

        check_tensor("transition", &self.transition, k, k, pt)?;
        check_tensor("emission", &self.emission, k, spec.n_channels(), pe)?;

        match spec.emission_family() {
            EmissionFamily::Gaussian => {
                if self.variance.len() != k {
                    return Err(Error::Configuration(format!(
                        "variance has {} state rows, expected {k}",
                        self.variance.len()
                    )));
                }
                for (s, row) in self.variance.iter().enumerate() {
                    if row.len() != spec.n_outputs() {
                        return Err(Error::Configuration(format!(
                            "variance[{s}] has {} entries, expected {}",
                            row.len(),
                            spec.n_outputs()
                        )));
                    }
                    for (d, &v) in row.iter().enumerate() {
                        if !v.is_finite() || v <= 0.0 {
                            return Err(Error::Configuration(format!(
                                "variance[{s}][{d}] = {v} must be finite and > 0"
                            )));
                        }
                    }
                }
            }
            _ => {
                if !self.variance.is_empty() {
                    return Err(Error::Configuration(
                        "variance tensor must be empty for non-Gaussian families".to_string(),
                    ));
                }
            }
        }

        let dim = spec.personalization_dim();
        for (id, v) in &self.personalization {
            if v.len() != dim {
                return Err(Error::Configuration(format!(
                    "personalization for subject '{id}' has {} entries, expected {dim}",
                    v.len()
                )));
            }
        }
        if self.prior.dim() != dim {
            return Err(Error::Configuration(format!(
                "prior dimension {} does not match personalization dimension {dim}",
                self.prior.dim()
            )));
        }
        Ok(())
    }
}

fn check_tensor(
    name: &str,
    t: &[Vec<Vec<f64>>],
    d0: usize,
    d1: usize,
    d2: usize,
) -> Result<()> {
    if t.len() != d0 {
        return Err(Error::Configuration(format!(
            "{name} has {} rows, expected {d0}",
            t.len()
        )));
    }
    for (i, block) in t.iter().enumerate() {
        if block.len() != d1 {
            return Err(Error::Configuration(format!(
                "{name}[{i}] has {} rows, expected {d1}",
                block.len()
            )));
        }
        for (j, row) in block.iter().enumerate() {
            if row.len() != d2 {
                return Err(Error::Configuration(format!(
                    "{name}[{i}][{j}] has {} coefficients, expected {d2}",
                    row.len()
                )));
            }
            for (c, &x) in row.iter().enumerate() {
                if !x.is_finite() {
                    return Err(Error::Configuration(format!(
                        "{name}[{i}][{j}][{c}] = {x} is not finite"
                    )));
                }
            }
        }
    }
    Ok(())
}
