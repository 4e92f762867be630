//! Mann–Whitney U (Wilcoxon rank-sum) test, normal approximation.
//!
//! Ties get average ranks and the variance carries the usual tie correction,
//! which matters here: click counts are mostly zeros.

use statrs::distribution::ContinuousCDF;

use crate::design::standard_normal;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MannWhitneyResult {
    /// U statistic of the first sample.
    pub u: f64,
    /// Continuity-corrected z-score of `|U - n1·n2/2|`.
    pub z: f64,
    /// Two-tailed p-value.
    pub p_value: f64,
}

/// Average ranks (1-based) of `values`, ties sharing the mean of their ranks.
pub(crate) fn average_ranks(values: &[f64]) -> (Vec<f64>, f64) {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&i, &j| values[i].total_cmp(&values[j]));

    let mut ranks = vec![0.0; values.len()];
    let mut tie_term = 0.0;
    let mut start = 0;
    while start < order.len() {
        let mut end = start + 1;
        while end < order.len() && values[order[end]] == values[order[start]] {
            end += 1;
        }
        // Positions start..end hold ranks start+1..=end.
        let avg = (start + 1 + end) as f64 / 2.0;
        for &idx in &order[start..end] {
            ranks[idx] = avg;
        }
        let t = (end - start) as f64;
        tie_term += t * t * t - t;
        start = end;
    }
    (ranks, tie_term)
}

/// Two-sided Mann–Whitney U test of `a` against `b`.
///
/// Returns `None` when either sample is empty or every observation is tied
/// (zero variance under the null).
pub fn mann_whitney_u(a: &[f64], b: &[f64]) -> Option<MannWhitneyResult> {
    let n1 = a.len() as f64;
    let n2 = b.len() as f64;
    if a.is_empty() || b.is_empty() {
        return None;
    }

    let combined: Vec<f64> = a.iter().chain(b).copied().collect();
    let (ranks, tie_term) = average_ranks(&combined);
    let rank_sum_a: f64 = ranks[..a.len()].iter().sum();
    let u = rank_sum_a - n1 * (n1 + 1.0) / 2.0;

    let n = n1 + n2;
    let mu = n1 * n2 / 2.0;
    let variance = n1 * n2 / 12.0 * ((n + 1.0) - tie_term / (n * (n - 1.0)));
    if variance <= 0.0 || !variance.is_finite() {
        return None;
    }

    let z = ((u - mu).abs() - 0.5) / variance.sqrt();
    let normal = standard_normal().ok()?;
    let p_value = (2.0 * (1.0 - normal.cdf(z))).clamp(0.0, 1.0);
    Some(MannWhitneyResult { u, z, p_value })
}
