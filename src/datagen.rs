//! # Stage: Click Data Generator
//!
//! ## Responsibility
//! Simulate per-user views and clicks for a control and a treatment group
//! across many independent replicate experiments:
//!
//! 1. **Views** — `floor(exp(N(1, skew))) + 1`, a right-skewed count that is
//!    never zero. Larger `skew` gives a heavier tail of high-traffic users.
//! 2. **Click probability** — `Beta(μκ, (1 - μ)κ)` with mean `μ` equal to the
//!    group's target CTR and concentration `κ`. Larger `κ` gives more
//!    homogeneous users.
//! 3. **Clicks** — `Binomial(views, p)`.
//!
//! ## Guarantees
//! - `views[u] >= 1` and `clicks[u] <= views[u]` for every user
//! - Replicate `i` depends only on the `i`-th seed drawn from the caller's RNG,
//!   so a fixed master seed reproduces the whole set
//! - Cancellation is honoured between replicates
//!
//! ## NOT Responsible For
//! - Deciding which scenario (H0 / H1) to simulate (engine)

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Beta, Binomial, Distribution, LogNormal};
use serde::Serialize;

use crate::cancel::{self, CancelFlag};
use crate::config::{validate_shape, ExperimentConfig};
use crate::error::{Result, SimError};

/// Location of the log-normal view-count distribution.
const VIEWS_LOG_MEAN: f64 = 1.0;

/// Upper bound on simulated views per user; keeps binomial sampling in range
/// for extreme `skew` values.
pub const MAX_VIEWS: u64 = 1 << 40;

// ---------------------------------------------------------------------------
// Group
// ---------------------------------------------------------------------------

/// Which arm of the experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Group {
    Control,
    Treatment,
}

impl std::fmt::Display for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Group::Control   => write!(f, "control"),
            Group::Treatment => write!(f, "treatment"),
        }
    }
}

// ---------------------------------------------------------------------------
// GroupSample — one group of one replicate
// ---------------------------------------------------------------------------

/// Per-user views, clicks and CTR for one group of one replicate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupSample {
    pub views: Vec<u64>,
    pub clicks: Vec<u64>,
    /// `clicks[u] / views[u]`.
    pub ctr: Vec<f64>,
}

impl GroupSample {
    /// Build a sample from aligned views/clicks, deriving CTR.
    ///
    /// Rejects misaligned input, zero views, clicks exceeding views and
    /// totals that do not fit in `u64`.
    pub fn new(views: Vec<u64>, clicks: Vec<u64>) -> Result<Self> {
        if views.len() != clicks.len() {
            return Err(SimError::invalid(
                "clicks",
                format!("length {} does not match views length {}", clicks.len(), views.len()),
            ));
        }
        if let Some(u) = views.iter().position(|&v| v == 0) {
            return Err(SimError::invalid("views", format!("user {u} has zero views")));
        }
        if let Some(u) = views.iter().zip(&clicks).position(|(v, c)| c > v) {
            return Err(SimError::invalid(
                "clicks",
                format!("user {u} has {} clicks but only {} views", clicks[u], views[u]),
            ));
        }
        if views.iter().try_fold(0u64, |acc, &v| acc.checked_add(v)).is_none() {
            return Err(SimError::invalid("views", "total views overflow u64"));
        }
        let ctr = views.iter().zip(&clicks).map(|(&v, &c)| c as f64 / v as f64).collect();
        Ok(Self { views, clicks, ctr })
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    /// Saturates at `u64::MAX`, which samples built by [`GroupSample::new`]
    /// or the generator never reach.
    pub fn total_views(&self) -> u64 {
        self.views.iter().fold(0, |acc: u64, &v| acc.saturating_add(v))
    }

    pub fn total_clicks(&self) -> u64 {
        self.clicks.iter().fold(0, |acc: u64, &c| acc.saturating_add(c))
    }

    /// `Σclicks / Σviews`, or `NaN` for an empty group.
    pub fn pooled_ctr(&self) -> f64 {
        let views = self.total_views();
        if views == 0 {
            f64::NAN
        } else {
            self.total_clicks() as f64 / views as f64
        }
    }

    /// Clicks as floats, for the moment-based tests.
    pub fn clicks_f64(&self) -> Vec<f64> {
        self.clicks.iter().map(|&c| c as f64).collect()
    }
}

// ---------------------------------------------------------------------------
// Replicate / ReplicateSet
// ---------------------------------------------------------------------------

/// One simulated A/B experiment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Replicate {
    pub control: GroupSample,
    pub treatment: GroupSample,
}

impl Replicate {
    pub fn group(&self, group: Group) -> &GroupSample {
        match group {
            Group::Control   => &self.control,
            Group::Treatment => &self.treatment,
        }
    }
}

/// `n_replicates` independent experiments of `n_samples` users per group.
///
/// Replicate `i` of the control group and replicate `i` of the treatment group
/// always belong to the same simulated experiment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplicateSet {
    n_samples: usize,
    replicates: Vec<Replicate>,
}

impl ReplicateSet {
    /// Assemble a set from replicates that all have `n_samples` users per group.
    pub fn from_replicates(replicates: Vec<Replicate>) -> Result<Self> {
        let n_samples = replicates.first().map_or(0, |r| r.control.len());
        if let Some(i) = replicates
            .iter()
            .position(|r| r.control.len() != n_samples || r.treatment.len() != n_samples)
        {
            return Err(SimError::invalid(
                "replicates",
                format!("replicate {i} does not have {n_samples} users in both groups"),
            ));
        }
        Ok(Self { n_samples, replicates })
    }

    pub fn n_samples(&self) -> usize {
        self.n_samples
    }

    pub fn n_replicates(&self) -> usize {
        self.replicates.len()
    }

    pub fn replicates(&self) -> &[Replicate] {
        &self.replicates
    }

    pub fn into_replicates(self) -> Vec<Replicate> {
        self.replicates
    }

    pub fn get(&self, index: usize) -> Option<&Replicate> {
        self.replicates.get(index)
    }

    /// `[n_replicates][n_samples]` views of one group.
    pub fn views(&self, group: Group) -> Vec<&[u64]> {
        self.replicates.iter().map(|r| r.group(group).views.as_slice()).collect()
    }

    /// `[n_replicates][n_samples]` clicks of one group.
    pub fn clicks(&self, group: Group) -> Vec<&[u64]> {
        self.replicates.iter().map(|r| r.group(group).clicks.as_slice()).collect()
    }

    /// `[n_replicates][n_samples]` per-user CTR of one group.
    pub fn ctr(&self, group: Group) -> Vec<&[f64]> {
        self.replicates.iter().map(|r| r.group(group).ctr.as_slice()).collect()
    }
}

// ---------------------------------------------------------------------------
// AbTestGenerator
// ---------------------------------------------------------------------------

/// Sampler for one [`ExperimentConfig`]. Validated once at construction.
#[derive(Debug, Clone)]
pub struct AbTestGenerator {
    config: ExperimentConfig,
    views: LogNormal<f64>,
    control_ctr: Beta<f64>,
    treatment_ctr: Beta<f64>,
    control_mean: f64,
    treatment_mean: f64,
}

impl AbTestGenerator {
    /// Build a generator, failing with `InvalidConfig` for out-of-domain
    /// distribution parameters. `n_samples`/`n_replicates` are checked per call.
    pub fn new(config: ExperimentConfig) -> Result<Self> {
        let (control_mean, treatment_mean) = config.group_means()?;
        let views = LogNormal::new(VIEWS_LOG_MEAN, config.skew)
            .map_err(|e| SimError::invalid("skew", e.to_string()))?;
        let control_ctr = ctr_distribution(control_mean, config.concentration)?;
        let treatment_ctr = ctr_distribution(treatment_mean, config.concentration)?;
        Ok(Self { config, views, control_ctr, treatment_ctr, control_mean, treatment_mean })
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    /// Simulate `n_replicates` experiments of `n_samples` users per group.
    ///
    /// One seed per replicate is drawn from `rng` up front.
    pub fn generate_n_experiment<R: Rng + ?Sized>(
        &self,
        n_samples: usize,
        n_replicates: usize,
        rng: &mut R,
        cancel: Option<&CancelFlag>,
    ) -> Result<ReplicateSet> {
        validate_shape(n_samples, n_replicates)?;
        let seeds: Vec<u64> = (0..n_replicates).map(|_| rng.gen()).collect();
        self.generate_seeded(n_samples, &seeds, cancel)
    }

    /// Simulate one experiment per seed.
    pub fn generate_seeded(
        &self,
        n_samples: usize,
        seeds: &[u64],
        cancel: Option<&CancelFlag>,
    ) -> Result<ReplicateSet> {
        validate_shape(n_samples, seeds.len())?;
        let mut replicates = Vec::with_capacity(seeds.len());
        for &seed in seeds {
            cancel::check(cancel)?;
            let mut rng = StdRng::seed_from_u64(seed);
            replicates.push(self.generate_replicate(n_samples, &mut rng)?);
        }
        Ok(ReplicateSet { n_samples, replicates })
    }

    /// Simulate a single experiment.
    pub fn generate_replicate<R: Rng + ?Sized>(
        &self,
        n_samples: usize,
        rng: &mut R,
    ) -> Result<Replicate> {
        let control = self.generate_group(Group::Control, n_samples, rng)?;
        let treatment = self.generate_group(Group::Treatment, n_samples, rng)?;
        Ok(Replicate { control, treatment })
    }

    fn generate_group<R: Rng + ?Sized>(
        &self,
        group: Group,
        n_samples: usize,
        rng: &mut R,
    ) -> Result<GroupSample> {
        let (ctr_dist, mean) = match group {
            Group::Control   => (&self.control_ctr, self.control_mean),
            Group::Treatment => (&self.treatment_ctr, self.treatment_mean),
        };

        let mut views = Vec::with_capacity(n_samples);
        let mut clicks = Vec::with_capacity(n_samples);
        let mut ctr = Vec::with_capacity(n_samples);
        for _ in 0..n_samples {
            let v = self.sample_views(rng);
            let p = ctr_dist.sample(rng);
            // Beta sampling can underflow to NaN for tiny shape parameters.
            let p = if p.is_nan() { mean } else { p.clamp(0.0, 1.0) };
            let c = Binomial::new(v, p)
                .map_err(|e| SimError::Statistics(format!("binomial({v}, {p}): {e}")))?
                .sample(rng);
            views.push(v);
            clicks.push(c);
            ctr.push(c as f64 / v as f64);
        }
        Ok(GroupSample { views, clicks, ctr })
    }

    fn sample_views<R: Rng + ?Sized>(&self, rng: &mut R) -> u64 {
        let raw = self.views.sample(rng).floor();
        // `as` saturates for huge draws; the cap keeps the +1 from overflowing.
        (raw as u64).min(MAX_VIEWS - 1) + 1
    }
}

fn ctr_distribution(mean: f64, concentration: f64) -> Result<Beta<f64>> {
    Beta::new(mean * concentration, (1.0 - mean) * concentration).map_err(|e| {
        SimError::invalid(
            "concentration",
            format!("beta({}, {}) rejected: {e}", mean * concentration, (1.0 - mean) * concentration),
        )
    })
}

/// Validate `config` and simulate `n_replicates` experiments of `n_samples`
/// users per group.
pub fn generate<R: Rng + ?Sized>(
    config: &ExperimentConfig,
    n_samples: usize,
    n_replicates: usize,
    rng: &mut R,
) -> Result<ReplicateSet> {
    AbTestGenerator::new(*config)?.generate_n_experiment(n_samples, n_replicates, rng, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn cfg(uplift: f64) -> ExperimentConfig {
        ExperimentConfig {
            base_ctr: 0.05,
            uplift,
            concentration: 100.0,
            skew: 0.6,
            n_samples: 200,
            n_replicates: 10,
        }
    }

    // ===== GroupSample =====

    #[test]
    fn test_group_sample_derives_ctr() {
        let g = GroupSample::new(vec![1, 4, 10], vec![0, 1, 5]).unwrap();
        assert_eq!(g.ctr, vec![0.0, 0.25, 0.5]);
        assert_eq!(g.total_views(), 15);
        assert_eq!(g.total_clicks(), 6);
        assert!((g.pooled_ctr() - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_group_sample_rejects_zero_views() {
        assert!(GroupSample::new(vec![1, 0], vec![0, 0]).is_err());
    }

    #[test]
    fn test_group_sample_rejects_clicks_above_views() {
        assert!(GroupSample::new(vec![2], vec![3]).is_err());
    }

    #[test]
    fn test_group_sample_rejects_overflowing_total_views() {
        match GroupSample::new(vec![u64::MAX, 1], vec![0, 0]) {
            Err(SimError::InvalidConfig { field, .. }) => assert_eq!(field, "views"),
            other => panic!("expected InvalidConfig for views, got {other:?}"),
        }
        assert!(GroupSample::new(vec![u64::MAX - 1, 1], vec![0, 0]).is_ok());
    }

    #[test]
    fn test_group_sample_rejects_misaligned() {
        assert!(GroupSample::new(vec![2, 2], vec![1]).is_err());
    }

    #[test]
    fn test_empty_group_pooled_ctr_is_nan() {
        let g = GroupSample::new(vec![], vec![]).unwrap();
        assert!(g.is_empty());
        assert!(g.pooled_ctr().is_nan());
    }

    // ===== ReplicateSet =====

    #[test]
    fn test_from_replicates_rejects_ragged() {
        let a = GroupSample::new(vec![1, 1], vec![0, 1]).unwrap();
        let b = GroupSample::new(vec![1], vec![0]).unwrap();
        let r = Replicate { control: a, treatment: b };
        assert!(ReplicateSet::from_replicates(vec![r]).is_err());
    }

    // ===== Generator =====

    #[test]
    fn test_generate_shapes() {
        let mut rng = StdRng::seed_from_u64(1);
        let set = generate(&cfg(0.0), 200, 10, &mut rng).unwrap();
        assert_eq!(set.n_replicates(), 10);
        assert_eq!(set.n_samples(), 200);
        for group in [Group::Control, Group::Treatment] {
            assert_eq!(set.views(group).len(), 10);
            assert!(set.views(group).iter().all(|row| row.len() == 200));
            assert!(set.ctr(group).iter().all(|row| row.len() == 200));
        }
    }

    #[test]
    fn test_generate_same_seed_is_reproducible() {
        let a = generate(&cfg(0.01), 100, 5, &mut StdRng::seed_from_u64(42)).unwrap();
        let b = generate(&cfg(0.01), 100, 5, &mut StdRng::seed_from_u64(42)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_generate_different_seed_differs() {
        let a = generate(&cfg(0.01), 100, 5, &mut StdRng::seed_from_u64(1)).unwrap();
        let b = generate(&cfg(0.01), 100, 5, &mut StdRng::seed_from_u64(2)).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_generate_rejects_zero_shape() {
        let mut rng = StdRng::seed_from_u64(1);
        assert!(matches!(
            generate(&cfg(0.0), 0, 10, &mut rng),
            Err(SimError::InvalidConfig { field: "n_samples", .. })
        ));
        assert!(matches!(
            generate(&cfg(0.0), 10, 0, &mut rng),
            Err(SimError::InvalidConfig { field: "n_replicates", .. })
        ));
    }

    #[test]
    fn test_generate_rejects_treatment_mean_outside_unit() {
        let mut rng = StdRng::seed_from_u64(1);
        let bad = ExperimentConfig { base_ctr: 0.5, uplift: 0.6, ..cfg(0.0) };
        assert!(generate(&bad, 10, 1, &mut rng).is_err());
    }

    #[test]
    fn test_seeded_replicate_independent_of_count() {
        let gen = AbTestGenerator::new(cfg(0.0)).unwrap();
        let few = gen.generate_seeded(50, &[7, 8], None).unwrap();
        let more = gen.generate_seeded(50, &[7, 8, 9], None).unwrap();
        assert_eq!(few.get(1), more.get(1));
    }

    #[test]
    fn test_cancelled_generation_stops() {
        let gen = AbTestGenerator::new(cfg(0.0)).unwrap();
        let flag = CancelFlag::new();
        flag.cancel();
        let err = gen
            .generate_n_experiment(10, 3, &mut StdRng::seed_from_u64(0), Some(&flag))
            .unwrap_err();
        assert!(matches!(err, SimError::Cancelled));
    }

    #[test]
    fn test_pooled_ctr_tracks_target_mean() {
        let c = ExperimentConfig { base_ctr: 0.1, uplift: 0.1, ..cfg(0.0) };
        let set = generate(&c, 5000, 1, &mut StdRng::seed_from_u64(3)).unwrap();
        let r = set.get(0).unwrap();
        assert!((r.control.pooled_ctr() - 0.1).abs() < 0.02, "{}", r.control.pooled_ctr());
        assert!((r.treatment.pooled_ctr() - 0.2).abs() < 0.02, "{}", r.treatment.pooled_ctr());
    }

    #[test]
    fn test_higher_skew_gives_heavier_views_tail() {
        let mut rng = StdRng::seed_from_u64(11);
        let low = generate(&ExperimentConfig { skew: 0.2, ..cfg(0.0) }, 5000, 1, &mut rng).unwrap();
        let high = generate(&ExperimentConfig { skew: 1.5, ..cfg(0.0) }, 5000, 1, &mut rng).unwrap();
        let max = |s: &ReplicateSet| *s.get(0).unwrap().control.views.iter().max().unwrap();
        assert!(max(&high) > max(&low));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_views_positive_clicks_bounded(
            base_ctr in 0.005f64..0.5,
            uplift in 0.0f64..0.3,
            concentration in 2.0f64..5000.0,
            skew in 0.1f64..4.0,
            seed in any::<u64>(),
        ) {
            let c = ExperimentConfig { base_ctr, uplift, concentration, skew, n_samples: 50, n_replicates: 3 };
            let set = generate(&c, 50, 3, &mut StdRng::seed_from_u64(seed)).unwrap();
            for r in set.replicates() {
                for g in [&r.control, &r.treatment] {
                    for u in 0..g.len() {
                        prop_assert!(g.views[u] >= 1);
                        prop_assert!(g.clicks[u] <= g.views[u]);
                        prop_assert!((0.0..=1.0).contains(&g.ctr[u]));
                    }
                }
            }
        }
    }
}
