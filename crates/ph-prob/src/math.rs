//! Numerically-stable scalar helpers for log-space recursions.

/// Stable `log(sum(exp(xs)))`.
///
/// Shifts by the slice maximum before exponentiating so long sequences do
/// not underflow. A slice of all `-inf` returns `-inf`; a NaN anywhere in
/// a slice with a finite maximum propagates to the result, so degenerate
/// inputs stay visible to the caller's finiteness checks.
pub fn logsumexp(xs: &[f64]) -> f64 {
    let m = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if m == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    let sum: f64 = xs.iter().map(|&x| (x - m).exp()).sum();
    m + sum.ln()
}

/// Log-softmax of a logit slice: `xs[k] - logsumexp(xs)`.
///
/// Exponentiating the result gives a probability vector summing to 1
/// whenever the logits are finite (structural `-inf` entries are allowed
/// and come back as `-inf`, i.e. probability zero).
pub fn log_softmax(xs: &[f64]) -> Vec<f64> {
    let lse = logsumexp(xs);
    xs.iter().map(|&x| x - lse).collect()
}

/// Exponential with a conservative clamp to avoid overflow.
///
/// For `|x| > 700`, `exp(x)` overflows to `inf` (or underflows to `0`,
/// turning a downstream `log` into `-inf`); either breaks line searches in
/// the count-model updates. The clamp keeps objectives finite so the
/// optimizers can recover.
#[inline]
pub fn exp_clamped(x: f64) -> f64 {
    x.clamp(-700.0, 700.0).exp()
}
