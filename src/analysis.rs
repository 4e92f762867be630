//! # Stage: Distribution Analyzer
//!
//! ## Responsibility
//! Turn collections of p-values into calibration and power statistics:
//! empirical CDFs, rejection rates at a threshold, probability histograms and
//! a Kolmogorov–Smirnov distance from the uniform diagonal.
//!
//! ## Guarantees
//! - Pure functions of their input; nothing carried between calls
//! - `NaN` entries are excluded from every statistic and counted separately

use serde::Serialize;

use crate::battery::{TestKind, TestResult};

/// Sorted values and their cumulative probabilities `(i + 1) / n`.
///
/// `NaN` entries are dropped before sorting, so `n` counts only real values.
pub fn empirical_cdf(values: &[f64]) -> (Vec<f64>, Vec<f64>) {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len() as f64;
    let probs = (1..=sorted.len()).map(|i| i as f64 / n).collect();
    (sorted, probs)
}

/// Fraction of non-`NaN` values strictly below `alpha`, or `NaN` if there are none.
pub fn rejection_rate(p_values: &[f64], alpha: f64) -> f64 {
    let (valid, rejected) = p_values
        .iter()
        .filter(|p| !p.is_nan())
        .fold((0usize, 0usize), |(n, r), &p| (n + 1, r + usize::from(p < alpha)));
    if valid == 0 {
        f64::NAN
    } else {
        rejected as f64 / valid as f64
    }
}

// ---------------------------------------------------------------------------
// PowerSummary
// ---------------------------------------------------------------------------

/// Rejection rate of one test at a threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PowerEntry {
    pub name: String,
    pub kind: TestKind,
    /// `mean(p < alpha)` over valid replicates. Type-I error under H0, power under H1.
    pub power: f64,
    /// Replicates with a real p-value.
    pub valid: usize,
    /// Replicates with a `NaN` p-value.
    pub excluded: usize,
}

/// Test name → rejection rate, in battery order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PowerSummary {
    pub alpha: f64,
    pub entries: Vec<PowerEntry>,
}

impl PowerSummary {
    pub fn get(&self, name: &str) -> Option<f64> {
        self.entries.iter().find(|e| e.name == name).map(|e| e.power)
    }

    pub fn by_kind(&self, kind: TestKind) -> Option<&PowerEntry> {
        self.entries.iter().find(|e| e.kind == kind)
    }
}

/// Rejection rate at `alpha` for every test in `results`.
pub fn power(results: &TestResult, alpha: f64) -> PowerSummary {
    let entries = results
        .iter()
        .map(|t| {
            let excluded = t.excluded();
            PowerEntry {
                name: t.name.clone(),
                kind: t.kind,
                power: rejection_rate(&t.p_values, alpha),
                valid: t.p_values.len() - excluded,
                excluded,
            }
        })
        .collect();
    PowerSummary { alpha, entries }
}

// ---------------------------------------------------------------------------
// Histogram
// ---------------------------------------------------------------------------

/// Equal-width histogram normalized to probabilities.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Histogram {
    /// `bins + 1` bin edges.
    pub edges: Vec<f64>,
    /// Fraction of counted values in each bin; sums to 1 when anything was counted.
    pub probabilities: Vec<f64>,
    /// Values that landed in a bin.
    pub counted: usize,
}

/// Histogram of `values` over `[lo, hi]` with `bins` equal-width bins.
///
/// The last bin is closed on the right. `NaN` and out-of-range values are not
/// counted. Returns an empty histogram for `bins == 0` or an empty range.
pub fn histogram(values: &[f64], bins: usize, lo: f64, hi: f64) -> Histogram {
    if bins == 0 || hi.partial_cmp(&lo) != Some(std::cmp::Ordering::Greater) {
        return Histogram { edges: Vec::new(), probabilities: Vec::new(), counted: 0 };
    }
    let width = (hi - lo) / bins as f64;
    let edges = (0..=bins).map(|i| lo + width * i as f64).collect();

    let mut counts = vec![0usize; bins];
    for &v in values {
        if v.is_nan() || v < lo || v > hi {
            continue;
        }
        let idx = (((v - lo) / width) as usize).min(bins - 1);
        counts[idx] += 1;
    }
    let counted: usize = counts.iter().sum();
    let probabilities = counts
        .iter()
        .map(|&c| if counted == 0 { 0.0 } else { c as f64 / counted as f64 })
        .collect();
    Histogram { edges, probabilities, counted }
}

/// Histogram over the observed `[min, max]` of `values`.
///
/// A constant sample gets a single bin of width one centred on the value.
pub fn histogram_auto(values: &[f64], bins: usize) -> Histogram {
    let (lo, hi) = values
        .iter()
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    if !lo.is_finite() {
        return histogram(&[], bins, 0.0, 1.0);
    }
    if hi > lo {
        histogram(values, bins, lo, hi)
    } else {
        histogram(values, 1, lo - 0.5, lo + 0.5)
    }
}

// ---------------------------------------------------------------------------
// Calibration
// ---------------------------------------------------------------------------

/// Kolmogorov–Smirnov distance between the ECDF of `values` and the uniform
/// CDF on `[0, 1]`. `NaN` for no valid values.
pub fn ks_uniform_distance(values: &[f64]) -> f64 {
    let (sorted, _) = empirical_cdf(values);
    let n = sorted.len() as f64;
    if sorted.is_empty() {
        return f64::NAN;
    }
    sorted
        .iter()
        .enumerate()
        .map(|(i, &v)| {
            let u = v.clamp(0.0, 1.0);
            let above = (i + 1) as f64 / n - u;
            let below = u - i as f64 / n;
            above.max(below)
        })
        .fold(0.0, f64::max)
}

/// Band `n·alpha ± z·sqrt(n·alpha·(1 − alpha))` on the number of rejections
/// a calibrated test makes in `n` null replicates. The lower end is floored at 0.
pub fn rejection_band(alpha: f64, n: usize, z: f64) -> (f64, f64) {
    let n = n as f64;
    let expected = n * alpha;
    let half = z * (n * alpha * (1.0 - alpha)).sqrt();
    ((expected - half).max(0.0), expected + half)
}

/// Calibration verdict for one test run on null data.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationEntry {
    pub name: String,
    pub kind: TestKind,
    pub rejections: usize,
    pub valid: usize,
    /// Empirical Type-I error.
    pub type_one_error: f64,
    pub ks_distance: f64,
    /// Expected rejection-count band at the given `z`.
    pub band: (f64, f64),
    pub within_band: bool,
}

/// Compare every test's null rejections at `alpha` to its sampling band.
pub fn calibration(results: &TestResult, alpha: f64, z: f64) -> Vec<CalibrationEntry> {
    results
        .iter()
        .map(|t| {
            let valid = t.p_values.len() - t.excluded();
            let rejections = t.p_values.iter().filter(|&&p| p < alpha).count();
            let band = rejection_band(alpha, valid, z);
            let r = rejections as f64;
            CalibrationEntry {
                name: t.name.clone(),
                kind: t.kind,
                rejections,
                valid,
                type_one_error: rejection_rate(&t.p_values, alpha),
                ks_distance: ks_uniform_distance(&t.p_values),
                band,
                within_band: valid > 0 && r >= band.0 && r <= band.1,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    // ===== empirical_cdf =====

    #[test]
    fn test_ecdf_basic() {
        let (v, p) = empirical_cdf(&[0.3, 0.1, 0.2, 0.4]);
        assert_eq!(v, vec![0.1, 0.2, 0.3, 0.4]);
        assert_eq!(p, vec![0.25, 0.5, 0.75, 1.0]);
    }

    #[test]
    fn test_ecdf_drops_nan() {
        let (v, p) = empirical_cdf(&[f64::NAN, 0.5, 0.1]);
        assert_eq!(v, vec![0.1, 0.5]);
        assert_eq!(p, vec![0.5, 1.0]);
    }

    #[test]
    fn test_ecdf_empty() {
        let (v, p) = empirical_cdf(&[]);
        assert!(v.is_empty());
        assert!(p.is_empty());
    }

    #[test]
    fn test_ecdf_uniform_input_bins_uniformly() {
        let mut rng = StdRng::seed_from_u64(17);
        let values: Vec<f64> = (0..10_000).map(|_| rng.gen::<f64>()).collect();
        let (sorted, probs) = empirical_cdf(&values);
        // At each decile the ECDF should sit near the diagonal.
        for q in 1..10 {
            let x = q as f64 / 10.0;
            let idx = sorted.partition_point(|&v| v <= x);
            let cdf = if idx == 0 { 0.0 } else { probs[idx - 1] };
            assert!((cdf - x).abs() < 0.02, "ecdf({x}) = {cdf}");
        }
        let h = histogram(&sorted, 10, 0.0, 1.0);
        assert!(h.probabilities.iter().all(|&p| (p - 0.1).abs() < 0.02));
    }

    proptest! {
        #[test]
        fn prop_ecdf_idempotent_on_sorted(mut values in prop::collection::vec(0.0f64..1.0, 1..200)) {
            values.sort_by(f64::total_cmp);
            let (sorted, probs) = empirical_cdf(&values);
            prop_assert_eq!(&sorted, &values);
            let (again, _) = empirical_cdf(&sorted);
            prop_assert_eq!(again, sorted);
            prop_assert_eq!(*probs.last().unwrap(), 1.0);
            prop_assert!(probs.windows(2).all(|w| w[0] < w[1]));
        }
    }

    // ===== power =====

    #[test]
    fn test_power_counts_strictly_below_alpha() {
        let results = TestResult::from_pairs(vec![(
            "Binomial, CTR",
            vec![0.01, 0.04, 0.05, 0.2, 0.9],
        )]);
        let summary = power(&results, 0.05);
        assert_relative_eq!(summary.get("Binomial, CTR").unwrap(), 0.4);
        assert_eq!(summary.alpha, 0.05);
    }

    #[test]
    fn test_power_excludes_nan() {
        let results = TestResult::from_pairs(vec![(
            "T-test, clicks",
            vec![0.01, f64::NAN, 0.5, f64::NAN],
        )]);
        let summary = power(&results, 0.05);
        let entry = summary.by_kind(TestKind::TTestClicks).unwrap();
        assert_relative_eq!(entry.power, 0.5);
        assert_eq!(entry.valid, 2);
        assert_eq!(entry.excluded, 2);
    }

    #[test]
    fn test_power_all_nan_is_nan() {
        assert!(rejection_rate(&[f64::NAN, f64::NAN], 0.05).is_nan());
        assert!(rejection_rate(&[], 0.05).is_nan());
    }

    // ===== histogram =====

    #[test]
    fn test_histogram_edges_and_probabilities() {
        let h = histogram(&[0.05, 0.15, 0.15, 1.0], 10, 0.0, 1.0);
        assert_eq!(h.edges.len(), 11);
        assert_relative_eq!(h.edges[10], 1.0);
        assert_relative_eq!(h.probabilities[0], 0.25);
        assert_relative_eq!(h.probabilities[1], 0.5);
        assert_relative_eq!(h.probabilities[9], 0.25);
        assert_eq!(h.counted, 4);
    }

    #[test]
    fn test_histogram_skips_nan_and_out_of_range() {
        let h = histogram(&[f64::NAN, -0.1, 0.5, 2.0], 2, 0.0, 1.0);
        assert_eq!(h.counted, 1);
        assert_eq!(h.probabilities, vec![0.0, 1.0]);
    }

    #[test]
    fn test_histogram_degenerate_arguments() {
        assert!(histogram(&[0.5], 0, 0.0, 1.0).edges.is_empty());
        assert!(histogram(&[0.5], 4, 1.0, 1.0).edges.is_empty());
        assert!(histogram(&[0.5], 4, f64::NAN, 1.0).edges.is_empty());
        assert!(histogram(&[0.5], 4, 0.0, f64::NAN).edges.is_empty());
    }

    #[test]
    fn test_histogram_auto_constant_sample() {
        let h = histogram_auto(&[3.0, 3.0, 3.0], 10);
        assert_eq!(h.probabilities, vec![1.0]);
        assert_eq!(h.counted, 3);
    }

    #[test]
    fn test_histogram_auto_range() {
        let h = histogram_auto(&[1.0, 2.0, 3.0, 5.0], 4);
        assert_relative_eq!(h.edges[0], 1.0);
        assert_relative_eq!(h.edges[4], 5.0);
        assert_eq!(h.counted, 4);
    }

    // ===== calibration =====

    #[test]
    fn test_ks_distance_perfect_grid_is_small() {
        let values: Vec<f64> = (0..100).map(|i| (i as f64 + 0.5) / 100.0).collect();
        assert_relative_eq!(ks_uniform_distance(&values), 0.005, epsilon = 1e-12);
    }

    #[test]
    fn test_ks_distance_point_mass() {
        assert_relative_eq!(ks_uniform_distance(&[0.0, 0.0, 0.0]), 1.0);
        assert!(ks_uniform_distance(&[]).is_nan());
    }

    #[test]
    fn test_rejection_band_matches_formula() {
        let (lo, hi) = rejection_band(0.05, 500, 2.0);
        let half = 2.0 * (500.0f64 * 0.05 * 0.95).sqrt();
        assert_relative_eq!(lo, 25.0 - half);
        assert_relative_eq!(hi, 25.0 + half);
        let (lo, _) = rejection_band(0.05, 10, 3.0);
        assert_eq!(lo, 0.0);
    }

    #[test]
    fn test_calibration_flags_miscalibrated_test() {
        let uniform: Vec<f64> = (0..500).map(|i| (i as f64 + 0.5) / 500.0).collect();
        let liberal: Vec<f64> = (0..500).map(|i| (i as f64 + 0.5) / 1000.0).collect();
        let results = TestResult::from_pairs(vec![
            ("Binomial, CTR", uniform),
            ("T-test, CTR", liberal),
        ]);
        let cal = calibration(&results, 0.05, 3.0);
        assert_eq!(cal[0].rejections, 25);
        assert!(cal[0].within_band);
        assert_eq!(cal[1].rejections, 50);
        assert!(!cal[1].within_band);
    }
}
