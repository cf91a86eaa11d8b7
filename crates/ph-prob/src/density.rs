//! Log-density functions for the supported emission families.
//!
//! Parameters are validated (a bad variance or category count is a
//! configuration problem); the observed value is not, so a NaN observation
//! flows through to the caller's finiteness checks instead of being
//! misreported as a configuration error.

use ph_core::{Error, Result};
use statrs::function::gamma::ln_gamma;

use crate::math::log_softmax;

/// Natural log of `2π`, precomputed.
const LN_2PI: f64 = 1.837_877_066_409_345_3;

/// Log-PDF of `N(mean, var)` at `y`, parameterized by the variance.
///
/// `log p(y) = -0.5 * (ln 2π + ln var + (y - mean)^2 / var)`
pub fn normal_logpdf(y: f64, mean: f64, var: f64) -> Result<f64> {
    if !var.is_finite() || var <= 0.0 {
        return Err(Error::Configuration(format!(
            "variance must be finite and > 0, got {var}"
        )));
    }
    let r = y - mean;
    Ok(-0.5 * (LN_2PI + var.ln() + r * r / var))
}

/// Log-PMF of `Poisson(rate)` at count `y`.
///
/// `y` is carried as `f64` (the engine stores all outputs that way);
/// integrality and non-negativity are checked by the data layer before
/// any likelihood is evaluated.
pub fn poisson_logpmf(y: f64, rate: f64) -> Result<f64> {
    if !rate.is_finite() || rate <= 0.0 {
        return Err(Error::Configuration(format!(
            "Poisson rate must be finite and > 0, got {rate}"
        )));
    }
    Ok(y * rate.ln() - rate - ln_gamma(y + 1.0))
}

/// Log-PMF of a categorical distribution given unnormalized logits.
///
/// Normalizes via log-softmax, so any finite logit vector is a valid
/// parameterization.
pub fn categorical_logpmf(category: usize, logits: &[f64]) -> Result<f64> {
    if logits.is_empty() {
        return Err(Error::Configuration(
            "categorical logits must be non-empty".to_string(),
        ));
    }
    if category >= logits.len() {
        return Err(Error::Configuration(format!(
            "category {category} out of range for {} categories",
            logits.len()
        )));
    }
    Ok(log_softmax(logits)[category])
}
