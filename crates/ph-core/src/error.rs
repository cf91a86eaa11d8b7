//! Error taxonomy for model fitting and decoding.
//!
//! Four kinds, each with a distinct recovery story:
//! - [`Error::Configuration`] — rejected before any computation starts.
//! - [`Error::NumericalInstability`] — per-subject, retried once with a
//!   re-initialized personalization before aborting the fit.
//! - [`Error::NonConvergence`] — per-subject, same retry policy.
//! - [`Error::MonotonicityViolation`] — always fatal; EM correctness
//!   depends on a non-decreasing likelihood, so a decrease is a defect
//!   and must never be absorbed.

use thiserror::Error;

/// Error type shared across the piohmm crates.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid model specification, subject data shape, or fitting
    /// configuration. Surfaced at construction or entry-point validation.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A forward, backward, or decoding pass produced a zero or non-finite
    /// quantity for one subject (degenerate parameters or inputs).
    #[error("numerical instability for subject '{subject}': {detail}")]
    NumericalInstability {
        /// Identifier of the subject whose pass failed.
        subject: String,
        /// What went non-finite, and at which step.
        detail: String,
    },

    /// A subject's personalization inner loop exhausted its iteration
    /// bound without reaching a stable fixed point.
    #[error("personalization did not converge for subject '{subject}': {detail}")]
    NonConvergence {
        /// Identifier of the subject whose inner loop failed.
        subject: String,
        /// Final gradient norm or step diagnostics.
        detail: String,
    },

    /// Total log-likelihood decreased across an EM iteration.
    #[error(
        "log-likelihood decreased at iteration {iteration}: {previous} -> {current}"
    )]
    MonotonicityViolation {
        /// EM iteration (1-based) at which the decrease was observed.
        iteration: usize,
        /// Total log-likelihood after the previous iteration.
        previous: f64,
        /// Total log-likelihood after this iteration.
        current: f64,
    },
}

impl Error {
    /// Subject identifier attached to this error, if any.
    pub fn subject(&self) -> Option<&str> {
        match self {
            Error::NumericalInstability { subject, .. }
            | Error::NonConvergence { subject, .. } => Some(subject),
            _ => None,
        }
    }

    /// Whether the orchestrator may retry the offending subject with a
    /// fresh personalization starting point.
    pub fn is_subject_retryable(&self) -> bool {
        matches!(
            self,
            Error::NumericalInstability { .. } | Error::NonConvergence { .. }
        )
    }
}

/// Result alias used across the piohmm crates.
pub type Result<T> = std::result::Result<T, Error>;
