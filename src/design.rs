//! # Sample-size designer
//!
//! Minimum users per group for a two-sided two-proportion test to detect a
//! given effect on a baseline click rate:
//!
//! ```text
//! n = ceil( (z_a * sqrt(2 p̄ (1 - p̄)) + z_b * sqrt(p0 (1 - p0) + p1 (1 - p1)))² / (p1 - p0)² )
//! z_a = Φ⁻¹(1 - alpha / 2),  z_b = Φ⁻¹(1 - beta),  p̄ = (p0 + p1) / 2
//! ```
//!
//! The effect is additive by default (`p1 = p0 + mde`), the same scale the
//! generator uses for `uplift`.

use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};

use crate::config::{is_open_unit, DesignConfig};
use crate::error::{Result, SimError};

/// How the minimum detectable effect moves the baseline rate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum EffectScale {
    /// `p1 = p0 + mde`
    #[default]
    Absolute,
    /// `p1 = p0 * (1 + mde)`
    Relative,
}

impl EffectScale {
    /// Alternative rate implied by `mde` on baseline `p0`.
    pub fn alternative(self, p0: f64, mde: f64) -> f64 {
        match self {
            EffectScale::Absolute => p0 + mde,
            EffectScale::Relative => p0 * (1.0 + mde),
        }
    }
}

impl std::fmt::Display for EffectScale {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EffectScale::Absolute => write!(f, "absolute"),
            EffectScale::Relative => write!(f, "relative"),
        }
    }
}

/// Minimum per-group sample size with an absolute effect.
///
/// `design(0.002, 0.02, 0.05, 0.2)` is `80682`.
pub fn design(mde: f64, p_0: f64, alpha: f64, beta: f64) -> Result<u64> {
    design_with_scale(mde, p_0, alpha, beta, EffectScale::Absolute)
}

/// Minimum per-group sample size for the error rates in `cfg`.
pub fn design_from_config(cfg: &DesignConfig, p_0: f64) -> Result<u64> {
    design_with_scale(cfg.mde, p_0, cfg.alpha, cfg.beta, cfg.effect_scale)
}

/// Minimum per-group sample size for `mde` interpreted on `scale`.
pub fn design_with_scale(
    mde: f64,
    p_0: f64,
    alpha: f64,
    beta: f64,
    scale: EffectScale,
) -> Result<u64> {
    if !is_open_unit(p_0) {
        return Err(SimError::invalid("p_0", format!("must be in (0, 1), got {p_0}")));
    }
    if !mde.is_finite() || mde <= 0.0 {
        return Err(SimError::invalid("mde", format!("must be a finite value > 0, got {mde}")));
    }
    if !is_open_unit(alpha) {
        return Err(SimError::invalid("alpha", format!("must be in (0, 1), got {alpha}")));
    }
    if !is_open_unit(beta) {
        return Err(SimError::invalid("beta", format!("must be in (0, 1), got {beta}")));
    }
    let p_1 = scale.alternative(p_0, mde);
    if !is_open_unit(p_1) {
        return Err(SimError::invalid(
            "mde",
            format!("alternative rate {p_1} ({scale} effect {mde} on {p_0}) is outside (0, 1)"),
        ));
    }

    let normal = standard_normal()?;
    let z_alpha = normal.inverse_cdf(1.0 - alpha / 2.0);
    let z_beta = normal.inverse_cdf(1.0 - beta);

    let p_bar = (p_0 + p_1) / 2.0;
    let null_sd = (2.0 * p_bar * (1.0 - p_bar)).sqrt();
    let alt_sd = (p_0 * (1.0 - p_0) + p_1 * (1.0 - p_1)).sqrt();
    let delta = p_1 - p_0;

    let n = (z_alpha * null_sd + z_beta * alt_sd).powi(2) / (delta * delta);
    if !n.is_finite() || n >= u64::MAX as f64 {
        return Err(SimError::invalid(
            "mde",
            format!("required sample size {n} exceeds u64 range"),
        ));
    }
    // n > 0 for any alpha, beta in (0, 1); at least one user per group.
    Ok((n.ceil() as u64).max(1))
}

pub(crate) fn standard_normal() -> Result<Normal> {
    Normal::new(0.0, 1.0).map_err(|e| SimError::Statistics(e.to_string()))
}
