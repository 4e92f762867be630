//! # Simulation configuration
//!
//! ## Responsibility
//! Typed, validated parameters for one simulation run, loadable from TOML.
//! Defaults mirror the dashboard the engine was built for: 2% base CTR,
//! 0.4 percentage-point uplift, skew 0.6, concentration 1000, 1000 users per
//! group and 500 replicates.
//!
//! ## Guarantees
//! - A config returned by [`load_from_str`] / [`load_from_file`] is validated
//! - Every validation failure names the offending field and value
//!
//! ## NOT Responsible For
//! - Validating the baseline CTR fed to the designer (that value is estimated
//!   at run time, see [`crate::design`])

use std::path::Path;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::battery::TestKind;
use crate::design::EffectScale;
use crate::error::{Result, SimError};

// ---------------------------------------------------------------------------
// ExperimentConfig — data-generation parameters
// ---------------------------------------------------------------------------

/// Parameters of the synthetic click/view model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Mean click probability of the control group, in (0, 1).
    pub base_ctr: f64,
    /// Additive CTR uplift applied to the treatment group.
    pub uplift: f64,
    /// Beta concentration of per-user click probabilities (> 0).
    pub concentration: f64,
    /// Log-normal scale of per-user view counts (> 0).
    pub skew: f64,
    /// Users per group per replicate.
    pub n_samples: usize,
    /// Number of independent simulated experiments.
    pub n_replicates: usize,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            base_ctr: 0.02,
            uplift: 0.004,
            concentration: 1000.0,
            skew: 0.6,
            n_samples: 1000,
            n_replicates: 500,
        }
    }
}

impl ExperimentConfig {
    /// Validate every field.
    pub fn validate(&self) -> Result<()> {
        validate_shape(self.n_samples, self.n_replicates)?;
        self.group_means().map(|_| ())
    }

    /// Target CTR of (control, treatment), after checking the distribution
    /// parameters that define them.
    pub fn group_means(&self) -> Result<(f64, f64)> {
        if !self.concentration.is_finite() || self.concentration <= 0.0 {
            return Err(SimError::invalid(
                "concentration",
                format!("must be a finite value > 0, got {}", self.concentration),
            ));
        }
        if !self.skew.is_finite() || self.skew <= 0.0 {
            return Err(SimError::invalid(
                "skew",
                format!("must be a finite value > 0, got {}", self.skew),
            ));
        }
        if !is_open_unit(self.base_ctr) {
            return Err(SimError::invalid(
                "base_ctr",
                format!("must be in (0, 1), got {}", self.base_ctr),
            ));
        }
        let treatment = self.base_ctr + self.uplift;
        if !self.uplift.is_finite() || !is_open_unit(treatment) {
            return Err(SimError::invalid(
                "uplift",
                format!(
                    "base_ctr + uplift must be in (0, 1), got {} + {} = {}",
                    self.base_ctr, self.uplift, treatment
                ),
            ));
        }
        Ok((self.base_ctr, treatment))
    }

    /// The same model with no treatment effect (the H0 / A/A scenario).
    pub fn null_hypothesis(&self) -> Self {
        Self { uplift: 0.0, ..*self }
    }
}

/// Upper bound on users per group. Together with
/// [`MAX_VIEWS`](crate::datagen::MAX_VIEWS) it keeps every per-group total of
/// views or clicks below `2^60`.
pub const MAX_SAMPLES: usize = 1 << 20;

/// Both counts must be at least one; `n_samples` at most [`MAX_SAMPLES`].
pub(crate) fn validate_shape(n_samples: usize, n_replicates: usize) -> Result<()> {
    if n_samples == 0 {
        return Err(SimError::invalid("n_samples", "must be >= 1, got 0"));
    }
    if n_samples > MAX_SAMPLES {
        return Err(SimError::invalid(
            "n_samples",
            format!("must be <= {MAX_SAMPLES}, got {n_samples}"),
        ));
    }
    if n_replicates == 0 {
        return Err(SimError::invalid("n_replicates", "must be >= 1, got 0"));
    }
    Ok(())
}

pub(crate) fn is_open_unit(x: f64) -> bool {
    x.is_finite() && x > 0.0 && x < 1.0
}

// ---------------------------------------------------------------------------
// DesignConfig — sample-size design parameters
// ---------------------------------------------------------------------------

/// Error rates and minimum detectable effect for the sample-size designer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DesignConfig {
    /// Type-I error rate (two-sided).
    pub alpha: f64,
    /// Type-II error rate; power is `1 - beta`.
    pub beta: f64,
    /// Minimum detectable effect.
    pub mde: f64,
    /// How `mde` is applied to the baseline.
    pub effect_scale: EffectScale,
}

impl Default for DesignConfig {
    fn default() -> Self {
        Self { alpha: 0.05, beta: 0.2, mde: 0.004, effect_scale: EffectScale::Absolute }
    }
}

impl DesignConfig {
    pub fn validate(&self) -> Result<()> {
        if !is_open_unit(self.alpha) {
            return Err(SimError::invalid("alpha", format!("must be in (0, 1), got {}", self.alpha)));
        }
        if !is_open_unit(self.beta) {
            return Err(SimError::invalid("beta", format!("must be in (0, 1), got {}", self.beta)));
        }
        if !self.mde.is_finite() || self.mde <= 0.0 {
            return Err(SimError::invalid("mde", format!("must be a finite value > 0, got {}", self.mde)));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// BatteryConfig
// ---------------------------------------------------------------------------

/// Which tests to run and how heavy the bootstrap is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatteryConfig {
    pub tests: Vec<TestKind>,
    /// Resamples per replicate for the bootstrap test.
    pub bootstrap_resamples: usize,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self { tests: TestKind::ALL.to_vec(), bootstrap_resamples: DEFAULT_BOOTSTRAP_RESAMPLES }
    }
}

/// Resamples drawn per replicate by the bootstrap test unless configured.
pub const DEFAULT_BOOTSTRAP_RESAMPLES: usize = 1000;

impl BatteryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tests.is_empty() {
            return Err(SimError::invalid("tests", "at least one test must be selected"));
        }
        if self.tests.contains(&TestKind::Bootstrap) && self.bootstrap_resamples == 0 {
            return Err(SimError::invalid("bootstrap_resamples", "must be >= 1, got 0"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SimulationConfig — top level
// ---------------------------------------------------------------------------

/// Complete input of one engine run.
///
/// ```toml
/// seed = 42
/// workers = 4
/// histogram_bins = 20
/// include_data = false
///
/// [experiment]
/// base_ctr = 0.02
/// uplift = 0.004
/// concentration = 1000.0
/// skew = 0.6
/// n_samples = 1000
/// n_replicates = 500
///
/// [design]
/// alpha = 0.05
/// beta = 0.2
/// mde = 0.004
/// effect_scale = "absolute"
///
/// [battery]
/// tests = ["t-test-clicks", "binomial"]
/// bootstrap_resamples = 1000
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub experiment: ExperimentConfig,
    pub design: DesignConfig,
    pub battery: BatteryConfig,
    /// Master seed. `None` draws a fresh one per run.
    pub seed: Option<u64>,
    /// Concurrent blocking jobs for the parallel engine.
    pub workers: usize,
    /// Bins of the p-value histograms in the report.
    pub histogram_bins: usize,
    /// Embed the raw replicate sets in the report.
    pub include_data: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            experiment: ExperimentConfig::default(),
            design: DesignConfig::default(),
            battery: BatteryConfig::default(),
            seed: None,
            workers: 4,
            histogram_bins: 20,
            include_data: false,
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<()> {
        self.experiment.validate()?;
        self.design.validate()?;
        self.battery.validate()?;
        if self.workers == 0 {
            return Err(SimError::invalid("workers", "must be >= 1, got 0"));
        }
        if self.histogram_bins == 0 {
            return Err(SimError::invalid("histogram_bins", "must be >= 1, got 0"));
        }
        Ok(())
    }

    /// The configured seed, or a fresh one from the thread RNG.
    pub fn resolve_seed(&self) -> u64 {
        self.seed.unwrap_or_else(|| rand::thread_rng().gen())
    }
}

/// Load and validate a [`SimulationConfig`] from a TOML file.
pub fn load_from_file(path: &Path) -> Result<SimulationConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| SimError::ConfigIo {
        file: path.display().to_string(),
        source: e,
    })?;
    load_from_str(&content, &path.display().to_string())
}

/// Load and validate a [`SimulationConfig`] from TOML text.
///
/// `source_name` only appears in error messages.
pub fn load_from_str(content: &str, source_name: &str) -> Result<SimulationConfig> {
    let config: SimulationConfig = toml::from_str(content).map_err(|e| SimError::ConfigParse {
        file: source_name.to_string(),
        source: e,
    })?;
    config.validate()?;
    Ok(config)
}
