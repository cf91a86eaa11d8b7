//! # ph-inference
//!
//! Fitting and decoding engine for personalized input-output hidden
//! Markov models (PIOHMMs): latent disease-state chains whose transition
//! and emission probabilities are generalized-linear functions of
//! time-varying covariates plus subject-specific personalization offsets
//! estimated jointly with the population parameters.
//!
//! Entry points:
//! - [`fit`] / [`fit_with_cancel`] — EM with per-subject MAP
//!   personalization, parallel E-steps, and seeded restarts.
//! - [`decode`] / [`decode_all`] — Viterbi paths under fitted parameters.
//! - [`score`], [`state_probabilities`], [`predict_next`] — held-out
//!   evaluation under fixed parameters.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Subject data: aligned input/output sequences with an observed mask.
pub mod data;
/// EM orchestration, fitting configuration, and convergence diagnostics.
pub mod em;
/// Scaled forward-backward recursions and posterior quantities.
pub mod forward_backward;
/// Per-step transition/emission materialization from covariates.
pub mod glm;
/// Seeded parameter initialization strategies.
pub mod init;
/// M-step parameter re-estimation from aggregated statistics.
mod maximizer;
/// Model specification: states, families, covariates, personalization.
pub mod model;
/// Parameter containers and the personalization prior.
pub mod params;
/// Per-subject MAP personalization updates.
pub mod personalization;
/// Held-out scoring, posterior extraction, one-step-ahead prediction.
pub mod predict;
/// Viterbi decoding of MAP latent-state paths.
pub mod viterbi;

pub use data::Subject;
pub use em::{fit, fit_with_cancel, FitConfig, FitOutcome, FitStatus};
pub use forward_backward::{forward_backward, Posterior};
pub use init::InitStrategy;
pub use model::{
    EmissionFamily, ModelSpec, PersonalizationScheme, TransitionStructure,
};
pub use params::{ParameterSet, PersonalizationPrior};
pub use personalization::PersonalizationSolver;
pub use predict::{predict_next, score, state_probabilities};
pub use viterbi::{decode, decode_all, DecodedPath};
