//! Pooled two-proportion z-test on aggregate clicks over views.
//!
//! Each view is treated as one Bernoulli trial, so per-user variance is
//! ignored.

use statrs::distribution::ContinuousCDF;

use crate::design::standard_normal;

/// Pooled click rates are clamped into `[PROB_CLAMP, 1 - PROB_CLAMP]` before
/// the standard error is formed, so a replicate without a single click (or
/// with clicks on every view) gives `z = 0` instead of `0 / 0`.
pub const PROB_CLAMP: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProportionTestResult {
    /// Pooled CTR of the first group.
    pub rate_a: f64,
    /// Pooled CTR of the second group.
    pub rate_b: f64,
    pub z: f64,
    pub p_value: f64,
}

/// Two-sided pooled z-test of `successes_b / trials_b` against
/// `successes_a / trials_a`.
///
/// Returns `None` if either group has no trials.
pub fn two_proportion_z_test(
    successes_a: u64,
    trials_a: u64,
    successes_b: u64,
    trials_b: u64,
) -> Option<ProportionTestResult> {
    if trials_a == 0 || trials_b == 0 {
        return None;
    }
    let n_a = trials_a as f64;
    let n_b = trials_b as f64;
    let rate_a = successes_a as f64 / n_a;
    let rate_b = successes_b as f64 / n_b;

    let pooled = ((successes_a as f64 + successes_b as f64) / (n_a + n_b))
        .clamp(PROB_CLAMP, 1.0 - PROB_CLAMP);
    let se = (pooled * (1.0 - pooled) * (1.0 / n_a + 1.0 / n_b)).sqrt();
    let z = (rate_b - rate_a) / se;

    let normal = standard_normal().ok()?;
    let p_value = (2.0 * (1.0 - normal.cdf(z.abs()))).clamp(0.0, 1.0);
    Some(ProportionTestResult { rate_a, rate_b, z, p_value })
}
