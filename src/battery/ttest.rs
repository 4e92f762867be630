//! Welch's two-sample t-test.

use statrs::distribution::{ContinuousCDF, StudentsT};

/// Result of a Welch's t-test comparison.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TTestResult {
    /// t-statistic of `mean(b) - mean(a)`.
    pub t_stat: f64,
    /// Degrees of freedom (Welch–Satterthwaite approximation).
    pub df: f64,
    /// Two-tailed p-value.
    pub p_value: f64,
}

pub(crate) fn mean(xs: &[f64]) -> f64 {
    xs.iter().sum::<f64>() / xs.len() as f64
}

/// Sample variance (Bessel's correction). Two-pass for stability.
pub(crate) fn sample_variance(xs: &[f64], mean: f64) -> f64 {
    let n = xs.len();
    if n < 2 {
        return 0.0;
    }
    xs.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / (n - 1) as f64
}

/// Perform Welch's independent-samples t-test between `a` and `b`.
///
/// Returns `None` if either sample has fewer than 2 observations or both
/// samples have zero variance (the statistic is undefined).
pub fn welch_t_test(a: &[f64], b: &[f64]) -> Option<TTestResult> {
    let n1 = a.len() as f64;
    let n2 = b.len() as f64;
    if n1 < 2.0 || n2 < 2.0 {
        return None;
    }

    let m1 = mean(a);
    let m2 = mean(b);
    let se1 = sample_variance(a, m1) / n1;
    let se2 = sample_variance(b, m2) / n2;
    let se_total = se1 + se2;
    if se_total <= 0.0 || !se_total.is_finite() {
        return None;
    }

    let t_stat = (m2 - m1) / se_total.sqrt();
    let df = (se_total * se_total) / (se1 * se1 / (n1 - 1.0) + se2 * se2 / (n2 - 1.0));

    let dist = StudentsT::new(0.0, 1.0, df).ok()?;
    let p_value = (2.0 * (1.0 - dist.cdf(t_stat.abs()))).clamp(0.0, 1.0);

    Some(TTestResult { t_stat, df, p_value })
}
