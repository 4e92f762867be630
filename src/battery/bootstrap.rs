//! Percentile bootstrap test on the pooled-CTR difference.
//!
//! Each resample draws users with replacement inside each group and records
//! `Σclicks_b/Σviews_b − Σclicks_a/Σviews_a`. The two-sided p-value is
//! `min(1, 2 · min(#(diff ≤ 0), #(diff ≥ 0)) / B)`.

use rand::Rng;

use crate::datagen::GroupSample;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BootstrapResult {
    /// Pooled-CTR difference of the original samples.
    pub observed_diff: f64,
    /// Resampled differences at or below zero.
    pub at_or_below_zero: usize,
    /// Resampled differences at or above zero.
    pub at_or_above_zero: usize,
    pub p_value: f64,
}

fn resampled_ctr<R: Rng + ?Sized>(g: &GroupSample, rng: &mut R) -> f64 {
    let n = g.len();
    // A resample can repeat the heaviest user n times, so the sums may exceed u64.
    let mut clicks = 0u128;
    let mut views = 0u128;
    for _ in 0..n {
        let u = rng.gen_range(0..n);
        clicks += u128::from(g.clicks[u]);
        views += u128::from(g.views[u]);
    }
    clicks as f64 / views as f64
}

/// Bootstrap the pooled-CTR difference `b − a` with `resamples` draws.
///
/// Returns `None` if either group is empty or `resamples` is zero.
pub fn bootstrap_ctr_diff<R: Rng + ?Sized>(
    a: &GroupSample,
    b: &GroupSample,
    resamples: usize,
    rng: &mut R,
) -> Option<BootstrapResult> {
    if a.is_empty() || b.is_empty() || resamples == 0 {
        return None;
    }

    let mut at_or_below_zero = 0;
    let mut at_or_above_zero = 0;
    for _ in 0..resamples {
        let diff = resampled_ctr(b, rng) - resampled_ctr(a, rng);
        if diff <= 0.0 {
            at_or_below_zero += 1;
        }
        if diff >= 0.0 {
            at_or_above_zero += 1;
        }
    }

    let tail = at_or_below_zero.min(at_or_above_zero) as f64 / resamples as f64;
    Some(BootstrapResult {
        observed_diff: b.pooled_ctr() - a.pooled_ctr(),
        at_or_below_zero,
        at_or_above_zero,
        p_value: (2.0 * tail).min(1.0),
    })
}
