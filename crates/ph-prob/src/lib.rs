//! # ph-prob
//!
//! Probability building blocks for the piohmm engine:
//! - stable log-space scalar helpers (`logsumexp`, `log_softmax`, clamped exp)
//! - per-family emission log-densities (Gaussian, categorical, Poisson)
//!
//! Everything here is scalar/slice-level and allocation-light; the sequence
//! recursions that consume these primitives live in `ph-inference`.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Log-density functions for the supported emission families.
pub mod density;
/// Numerically-stable scalar helpers for log-space recursions.
pub mod math;
