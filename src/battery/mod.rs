//! # Stage: Test Battery
//!
//! ## Responsibility
//! Turn one replicate's control/treatment data into a p-value for each of
//! several hypothesis-testing methods, and run a configured set of methods
//! across every replicate of a [`ReplicateSet`].
//!
//! | Test | Input | Method |
//! |---|---|---|
//! | `T-test, clicks` | per-user clicks | Welch's t-test |
//! | `T-test, CTR` | per-user CTR | Welch's t-test |
//! | `Mann–Whitney, clicks` | per-user clicks | rank-sum, tie-corrected |
//! | `Binomial, CTR` | Σclicks / Σviews | pooled two-proportion z-test |
//! | `Bootstrap, CTR` | per-user (clicks, views) | percentile bootstrap of pooled CTR |
//!
//! ## Guarantees
//! - p-values are in `[0, 1]`, or `NaN` when a replicate is degenerate for a
//!   test (never an error, never a panic)
//! - p-value `i` of every test belongs to replicate `i`
//! - Bootstrap randomness is derived from (battery seed, test, replicate), so
//!   results do not depend on execution order or parallelism
//!
//! ## NOT Responsible For
//! - Multiple-testing correction across the battery
//! - Aggregating p-values into power (analysis)

pub mod bootstrap;
pub mod mann_whitney;
pub mod proportion;
pub mod ttest;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cancel::{self, CancelFlag};
use crate::config::BatteryConfig;
use crate::datagen::{GroupSample, ReplicateSet};
use crate::error::Result;

// ---------------------------------------------------------------------------
// TestKind — selectable test identifiers
// ---------------------------------------------------------------------------

/// Identifier of a test method, as used in configuration and on the CLI.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum TestKind {
    TTestClicks,
    TTestCtr,
    MannWhitney,
    Binomial,
    Bootstrap,
}

impl TestKind {
    /// Every test, in report order.
    pub const ALL: [TestKind; 5] = [
        TestKind::TTestClicks,
        TestKind::TTestCtr,
        TestKind::MannWhitney,
        TestKind::Binomial,
        TestKind::Bootstrap,
    ];

    /// Human-readable label used as the key of [`TestResult`].
    pub fn display_name(self) -> &'static str {
        match self {
            TestKind::TTestClicks => "T-test, clicks",
            TestKind::TTestCtr    => "T-test, CTR",
            TestKind::MannWhitney => "Mann–Whitney, clicks",
            TestKind::Binomial    => "Binomial, CTR",
            TestKind::Bootstrap   => "Bootstrap, CTR",
        }
    }

    fn stream_id(self) -> u64 {
        match self {
            TestKind::TTestClicks => 1,
            TestKind::TTestCtr    => 2,
            TestKind::MannWhitney => 3,
            TestKind::Binomial    => 4,
            TestKind::Bootstrap   => 5,
        }
    }
}

impl std::fmt::Display for TestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestKind::TTestClicks => write!(f, "t-test-clicks"),
            TestKind::TTestCtr    => write!(f, "t-test-ctr"),
            TestKind::MannWhitney => write!(f, "mann-whitney"),
            TestKind::Binomial    => write!(f, "binomial"),
            TestKind::Bootstrap   => write!(f, "bootstrap"),
        }
    }
}

// ---------------------------------------------------------------------------
// StatTest — a test method with its parameters
// ---------------------------------------------------------------------------

/// A hypothesis test that maps `(control, treatment)` to a p-value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatTest {
    TTestClicks,
    TTestCtr,
    MannWhitney,
    Binomial,
    Bootstrap { resamples: usize },
}

impl StatTest {
    /// Build the test for `kind`; `resamples` only applies to the bootstrap.
    pub fn from_kind(kind: TestKind, resamples: usize) -> Self {
        match kind {
            TestKind::TTestClicks => StatTest::TTestClicks,
            TestKind::TTestCtr    => StatTest::TTestCtr,
            TestKind::MannWhitney => StatTest::MannWhitney,
            TestKind::Binomial    => StatTest::Binomial,
            TestKind::Bootstrap   => StatTest::Bootstrap { resamples },
        }
    }

    pub fn kind(&self) -> TestKind {
        match self {
            StatTest::TTestClicks         => TestKind::TTestClicks,
            StatTest::TTestCtr            => TestKind::TTestCtr,
            StatTest::MannWhitney         => TestKind::MannWhitney,
            StatTest::Binomial            => TestKind::Binomial,
            StatTest::Bootstrap { .. }    => TestKind::Bootstrap,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().display_name()
    }

    /// p-value of `treatment` against `control`, or `NaN` if the replicate is
    /// degenerate for this test. Only the bootstrap draws from `rng`.
    pub fn compute_p_value<R: Rng + ?Sized>(
        &self,
        control: &GroupSample,
        treatment: &GroupSample,
        rng: &mut R,
    ) -> f64 {
        let p = match self {
            StatTest::TTestClicks => {
                ttest::welch_t_test(&control.clicks_f64(), &treatment.clicks_f64())
                    .map(|r| r.p_value)
            }
            StatTest::TTestCtr => {
                ttest::welch_t_test(&control.ctr, &treatment.ctr).map(|r| r.p_value)
            }
            StatTest::MannWhitney => {
                mann_whitney::mann_whitney_u(&control.clicks_f64(), &treatment.clicks_f64())
                    .map(|r| r.p_value)
            }
            StatTest::Binomial => proportion::two_proportion_z_test(
                control.total_clicks(),
                control.total_views(),
                treatment.total_clicks(),
                treatment.total_views(),
            )
            .map(|r| r.p_value),
            StatTest::Bootstrap { resamples } => {
                bootstrap::bootstrap_ctr_diff(control, treatment, *resamples, rng)
                    .map(|r| r.p_value)
            }
        };
        p.unwrap_or(f64::NAN)
    }
}

impl std::fmt::Display for StatTest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// ---------------------------------------------------------------------------
// TestResult
// ---------------------------------------------------------------------------

/// p-values of one test over every replicate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestPValues {
    pub name: String,
    pub kind: TestKind,
    /// One entry per replicate, `NaN` (serialized as `null`) for degenerate ones.
    pub p_values: Vec<f64>,
}

impl TestPValues {
    /// Replicates whose p-value is `NaN`.
    pub fn excluded(&self) -> usize {
        self.p_values.iter().filter(|p| p.is_nan()).count()
    }
}

/// Test name → p-values, in battery order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct TestResult {
    entries: Vec<TestPValues>,
}

impl TestResult {
    pub fn new(entries: Vec<TestPValues>) -> Self {
        Self { entries }
    }

    /// Build from `(name, p_values)` pairs; `kind` is looked up from the name
    /// and entries with unknown names are skipped.
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, Vec<f64>)>,
        S: Into<String>,
    {
        let entries = pairs
            .into_iter()
            .filter_map(|(name, p_values)| {
                let name = name.into();
                let kind = TestKind::ALL.into_iter().find(|k| k.display_name() == name)?;
                Some(TestPValues { name, kind, p_values })
            })
            .collect();
        Self { entries }
    }

    pub fn get(&self, name: &str) -> Option<&[f64]> {
        self.entries.iter().find(|e| e.name == name).map(|e| e.p_values.as_slice())
    }

    pub fn by_kind(&self, kind: TestKind) -> Option<&TestPValues> {
        self.entries.iter().find(|e| e.kind == kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TestPValues> {
        self.entries.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// TestBattery — ordered set of tests + seed
// ---------------------------------------------------------------------------

/// An ordered set of tests and the seed that drives their randomness.
#[derive(Debug, Clone, PartialEq)]
pub struct TestBattery {
    tests: Vec<StatTest>,
    seed: u64,
}

impl TestBattery {
    pub fn new(tests: Vec<StatTest>, seed: u64) -> Self {
        Self { tests, seed }
    }

    /// All five tests in report order.
    pub fn standard(bootstrap_resamples: usize, seed: u64) -> Self {
        let tests = TestKind::ALL
            .into_iter()
            .map(|k| StatTest::from_kind(k, bootstrap_resamples))
            .collect();
        Self { tests, seed }
    }

    pub fn from_config(cfg: &BatteryConfig, seed: u64) -> Result<Self> {
        cfg.validate()?;
        let mut tests: Vec<StatTest> = Vec::with_capacity(cfg.tests.len());
        for &kind in &cfg.tests {
            if tests.iter().all(|t| t.kind() != kind) {
                tests.push(StatTest::from_kind(kind, cfg.bootstrap_resamples));
            }
        }
        Ok(Self { tests, seed })
    }

    pub fn tests(&self) -> &[StatTest] {
        &self.tests
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// p-values of one test over every replicate of `set`.
    ///
    /// Cancellation is checked between replicates.
    pub fn run_test(
        &self,
        test: StatTest,
        set: &ReplicateSet,
        cancel: Option<&CancelFlag>,
    ) -> Result<TestPValues> {
        let mut p_values = Vec::with_capacity(set.n_replicates());
        for (i, replicate) in set.replicates().iter().enumerate() {
            cancel::check(cancel)?;
            let mut rng = StdRng::seed_from_u64(mix_seed(self.seed, test.kind().stream_id(), i as u64));
            p_values.push(test.compute_p_value(&replicate.control, &replicate.treatment, &mut rng));
        }
        let result = TestPValues { name: test.name().to_string(), kind: test.kind(), p_values };
        debug!(
            test = %test,
            replicates = set.n_replicates(),
            excluded = result.excluded(),
            "test applied"
        );
        Ok(result)
    }
}

/// Deterministic per-(test, replicate) seed. SplitMix64 finalizer over the
/// combined inputs.
fn mix_seed(seed: u64, stream: u64, index: u64) -> u64 {
    let mut z = seed
        ^ stream.wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ index.wrapping_add(1).wrapping_mul(0xD1B5_4A32_D192_ED03);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Run every test of `battery` over every replicate of `set`.
pub fn apply_tests(set: &ReplicateSet, battery: &TestBattery) -> TestResult {
    // Without a cancel flag `run_test` cannot fail.
    let entries = battery
        .tests()
        .iter()
        .filter_map(|&t| battery.run_test(t, set, None).ok())
        .collect();
    TestResult { entries }
}

/// [`apply_tests`] with cooperative cancellation between replicates.
pub fn apply_tests_with_cancel(
    set: &ReplicateSet,
    battery: &TestBattery,
    cancel: &CancelFlag,
) -> Result<TestResult> {
    let entries = battery
        .tests()
        .iter()
        .map(|&t| battery.run_test(t, set, Some(cancel)))
        .collect::<Result<Vec<_>>>()?;
    Ok(TestResult { entries })
}
