//! # Stage: Simulation Engine
//!
//! ## Responsibility
//! Run the whole pipeline for one [`SimulationConfig`]:
//!
//! 1. One H0 replicate estimates the baseline CTR (pooled control CTR).
//! 2. The designer turns that baseline into a minimum per-group sample size.
//! 3. `n_replicates` experiments are simulated under H0 (no uplift) and H1.
//! 4. The battery runs on both sets; the analyzer computes power, p-value
//!    histograms and the H0 calibration verdicts.
//!
//! [`run`] is the sequential reference. [`run_parallel`] fans generation
//! chunks and `(scenario, test)` battery jobs out to tokio's blocking pool,
//! bounded by a semaphore of `workers` permits.
//!
//! ## Guarantees
//! - Every random draw derives from the master seed, so `run` and
//!   `run_parallel` produce the same report for the same seed
//! - Cancellation is checked between replicates and surfaces as
//!   [`SimError::Cancelled`]
//! - Degenerate replicates are logged, counted and excluded, never fatal

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::analysis::{self, CalibrationEntry, Histogram, PowerSummary};
use crate::battery::{TestBattery, TestPValues, TestResult};
use crate::cancel::CancelFlag;
use crate::config::{DesignConfig, SimulationConfig};
use crate::datagen::{AbTestGenerator, Group, ReplicateSet};
use crate::design::design_from_config;
use crate::error::{Result, SimError};

/// Version of the JSON report layout.
pub const SCHEMA_VERSION: u8 = 1;

/// Width, in standard deviations, of the H0 rejection-count band.
pub const CALIBRATION_Z: f64 = 3.0;

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scenario {
    /// No treatment effect (A/A).
    H0,
    /// Configured uplift.
    H1,
}

impl std::fmt::Display for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scenario::H0 => write!(f, "H0"),
            Scenario::H1 => write!(f, "H1"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PValueHistogram {
    pub name: String,
    pub histogram: Histogram,
}

/// Per-user views and CTR of one group in the first replicate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupDistribution {
    pub group: Group,
    pub views: Histogram,
    pub ctr: Histogram,
}

/// Everything computed for one scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub scenario: Scenario,
    pub uplift: f64,
    pub p_values: TestResult,
    pub power: PowerSummary,
    pub p_value_histograms: Vec<PValueHistogram>,
    pub sample_distributions: Vec<GroupDistribution>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ReplicateSet>,
}

/// Output of one engine run. Serialized as the JSON report.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub schema_version: u8,
    /// Master seed; replaying it reproduces the report.
    pub seed: u64,
    pub config: SimulationConfig,
    /// Pooled control CTR of the baseline replicate.
    pub estimated_ctr_h0: f64,
    /// `None` when the estimated baseline leaves the design undefined
    /// (no clicks at all, or `baseline + mde` outside (0, 1)).
    pub min_samples_required: Option<u64>,
    pub h0: ScenarioReport,
    pub h1: ScenarioReport,
    /// H0 rejection counts against their sampling band.
    pub calibration: Vec<CalibrationEntry>,
}

impl SimulationReport {
    pub fn scenario(&self, scenario: Scenario) -> &ScenarioReport {
        match scenario {
            Scenario::H0 => &self.h0,
            Scenario::H1 => &self.h1,
        }
    }

    /// Tests whose H0 rejections fall outside the expected band.
    pub fn miscalibrated(&self) -> impl Iterator<Item = &CalibrationEntry> {
        self.calibration.iter().filter(|c| c.valid > 0 && !c.within_band)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the pretty-printed JSON report to `path`.
    pub fn write(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Seeds
// ---------------------------------------------------------------------------

/// Every seed a run needs, drawn from the master seed in a fixed order.
#[derive(Debug, Clone)]
struct SeedPlan {
    baseline: u64,
    h0: Vec<u64>,
    h1: Vec<u64>,
    h0_battery: u64,
    h1_battery: u64,
}

impl SeedPlan {
    fn new(master: u64, n_replicates: usize) -> Self {
        let mut rng = StdRng::seed_from_u64(master);
        let baseline = rng.gen();
        let h0 = (0..n_replicates).map(|_| rng.gen()).collect();
        let h1 = (0..n_replicates).map(|_| rng.gen()).collect();
        Self { baseline, h0, h1, h0_battery: rng.gen(), h1_battery: rng.gen() }
    }
}

// ---------------------------------------------------------------------------
// Sequential engine
// ---------------------------------------------------------------------------

/// Run the full simulation on the calling thread.
pub fn run(
    config: &SimulationConfig,
    seed: u64,
    cancel: Option<&CancelFlag>,
) -> Result<SimulationReport> {
    config.validate()?;
    let exp = config.experiment;
    let plan = SeedPlan::new(seed, exp.n_replicates);
    let start = Instant::now();
    info!(
        seed,
        n_samples = exp.n_samples,
        n_replicates = exp.n_replicates,
        tests = config.battery.tests.len(),
        "simulation started"
    );

    let h0_gen = AbTestGenerator::new(exp.null_hypothesis())?;
    let h1_gen = AbTestGenerator::new(exp)?;

    let baseline = h0_gen.generate_seeded(exp.n_samples, &[plan.baseline], cancel)?;
    let (estimated_ctr_h0, min_samples_required) = baseline_design(&baseline, &config.design)?;

    let h0_battery = TestBattery::from_config(&config.battery, plan.h0_battery)?;
    let h1_battery = TestBattery::from_config(&config.battery, plan.h1_battery)?;

    let (h0_set, h0_results) =
        simulate_scenario(Scenario::H0, &h0_gen, &plan.h0, &h0_battery, exp.n_samples, cancel)?;
    let (h1_set, h1_results) =
        simulate_scenario(Scenario::H1, &h1_gen, &plan.h1, &h1_battery, exp.n_samples, cancel)?;

    let report = assemble_report(
        config,
        seed,
        estimated_ctr_h0,
        min_samples_required,
        (&h0_set, h0_results),
        (&h1_set, h1_results),
    );
    info!(elapsed_ms = start.elapsed().as_millis() as u64, "simulation finished");
    Ok(report)
}

fn simulate_scenario(
    scenario: Scenario,
    generator: &AbTestGenerator,
    seeds: &[u64],
    battery: &TestBattery,
    n_samples: usize,
    cancel: Option<&CancelFlag>,
) -> Result<(ReplicateSet, TestResult)> {
    let start = Instant::now();
    let set = generator.generate_seeded(n_samples, seeds, cancel)?;
    let entries = battery
        .tests()
        .iter()
        .map(|&t| battery.run_test(t, &set, cancel))
        .collect::<Result<Vec<_>>>()?;
    info!(
        scenario = %scenario,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "scenario simulated"
    );
    Ok((set, TestResult::new(entries)))
}

/// Baseline CTR from the first control group and the sample size it implies.
fn baseline_design(baseline: &ReplicateSet, design: &DesignConfig) -> Result<(f64, Option<u64>)> {
    let estimated = baseline.get(0).map_or(f64::NAN, |r| r.control.pooled_ctr());
    match design_from_config(design, estimated) {
        Ok(n) => {
            debug!(estimated_ctr_h0 = estimated, min_samples_required = n, "baseline designed");
            Ok((estimated, Some(n)))
        }
        Err(e) if e.is_config_error() => {
            warn!(estimated_ctr_h0 = estimated, error = %e, "minimum sample size undefined");
            Ok((estimated, None))
        }
        Err(e) => Err(e),
    }
}

// ---------------------------------------------------------------------------
// Parallel engine
// ---------------------------------------------------------------------------

/// Run the full simulation on tokio's blocking pool with at most
/// `config.workers` jobs in flight.
///
/// Produces the same report as [`run`] for the same seed. If any job fails,
/// the jobs still running are stopped at their next replicate.
pub async fn run_parallel(
    config: &SimulationConfig,
    seed: u64,
    cancel: Option<CancelFlag>,
) -> Result<SimulationReport> {
    config.validate()?;
    // Jobs watch their own flag so a failure can stop them without cancelling
    // the caller's flag.
    let stop = cancel.as_ref().map_or_else(CancelFlag::new, CancelFlag::child);
    let result = run_jobs(config, seed, &stop).await;
    if result.is_err() {
        stop.cancel();
    }
    result
}

async fn run_jobs(
    config: &SimulationConfig,
    seed: u64,
    stop: &CancelFlag,
) -> Result<SimulationReport> {
    let exp = config.experiment;
    let plan = SeedPlan::new(seed, exp.n_replicates);
    let semaphore = Arc::new(Semaphore::new(config.workers));
    let start = Instant::now();
    info!(
        seed,
        n_samples = exp.n_samples,
        n_replicates = exp.n_replicates,
        tests = config.battery.tests.len(),
        workers = config.workers,
        "parallel simulation started"
    );

    let h0_gen = Arc::new(AbTestGenerator::new(exp.null_hypothesis())?);
    let h1_gen = Arc::new(AbTestGenerator::new(exp)?);
    let h0_battery = TestBattery::from_config(&config.battery, plan.h0_battery)?;
    let h1_battery = TestBattery::from_config(&config.battery, plan.h1_battery)?;

    let baseline_job = {
        let gen = Arc::clone(&h0_gen);
        let baseline_seed = plan.baseline;
        let stop = stop.clone();
        spawn_job(&semaphore, move || {
            gen.generate_seeded(exp.n_samples, &[baseline_seed], Some(&stop))
        })
        .await?
    };
    let chunk_len = exp.n_replicates.div_ceil(config.workers);
    let h0_jobs =
        spawn_generation(&semaphore, &h0_gen, exp.n_samples, &plan.h0, chunk_len, stop).await?;
    let h1_jobs =
        spawn_generation(&semaphore, &h1_gen, exp.n_samples, &plan.h1, chunk_len, stop).await?;

    let baseline = join_job(baseline_job).await?;
    let (estimated_ctr_h0, min_samples_required) = baseline_design(&baseline, &config.design)?;
    let h0_set = Arc::new(collect_generation(h0_jobs, stop).await?);
    let h1_set = Arc::new(collect_generation(h1_jobs, stop).await?);
    debug!(elapsed_ms = start.elapsed().as_millis() as u64, "replicates generated");

    let h0_tests = spawn_battery(&semaphore, &h0_set, &h0_battery, stop).await?;
    let h1_tests = spawn_battery(&semaphore, &h1_set, &h1_battery, stop).await?;
    let h0_results = TestResult::new(join_all(h0_tests, stop).await?);
    let h1_results = TestResult::new(join_all(h1_tests, stop).await?);

    let report = assemble_report(
        config,
        seed,
        estimated_ctr_h0,
        min_samples_required,
        (h0_set.as_ref(), h0_results),
        (h1_set.as_ref(), h1_results),
    );
    info!(elapsed_ms = start.elapsed().as_millis() as u64, "parallel simulation finished");
    Ok(report)
}

/// Wait for a permit, then run `job` on the blocking pool holding it.
async fn spawn_job<T, F>(semaphore: &Arc<Semaphore>, job: F) -> Result<JoinHandle<Result<T>>>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let permit = semaphore
        .clone()
        .acquire_owned()
        .await
        .map_err(|e| SimError::Worker(e.to_string()))?;
    Ok(tokio::task::spawn_blocking(move || {
        let result = job();
        drop(permit);
        result
    }))
}

async fn join_job<T>(handle: JoinHandle<Result<T>>) -> Result<T> {
    handle.await.map_err(|e| SimError::Worker(e.to_string()))?
}

/// Join `jobs` in order. On the first failure `stop` is raised and the
/// handles not yet joined are aborted.
async fn join_all<T>(jobs: Vec<JoinHandle<Result<T>>>, stop: &CancelFlag) -> Result<Vec<T>> {
    let mut results = Vec::with_capacity(jobs.len());
    let mut jobs = jobs.into_iter();
    while let Some(job) = jobs.next() {
        match join_job(job).await {
            Ok(value) => results.push(value),
            Err(e) => {
                stop.cancel();
                jobs.for_each(|j| j.abort());
                return Err(e);
            }
        }
    }
    Ok(results)
}

async fn spawn_generation(
    semaphore: &Arc<Semaphore>,
    generator: &Arc<AbTestGenerator>,
    n_samples: usize,
    seeds: &[u64],
    chunk_len: usize,
    stop: &CancelFlag,
) -> Result<Vec<JoinHandle<Result<ReplicateSet>>>> {
    let mut jobs = Vec::new();
    for chunk in seeds.chunks(chunk_len.max(1)) {
        let gen = Arc::clone(generator);
        let chunk = chunk.to_vec();
        let stop = stop.clone();
        jobs.push(
            spawn_job(semaphore, move || gen.generate_seeded(n_samples, &chunk, Some(&stop)))
                .await?,
        );
    }
    Ok(jobs)
}

async fn collect_generation(
    jobs: Vec<JoinHandle<Result<ReplicateSet>>>,
    stop: &CancelFlag,
) -> Result<ReplicateSet> {
    let replicates = join_all(jobs, stop)
        .await?
        .into_iter()
        .flat_map(ReplicateSet::into_replicates)
        .collect();
    ReplicateSet::from_replicates(replicates)
}

async fn spawn_battery(
    semaphore: &Arc<Semaphore>,
    set: &Arc<ReplicateSet>,
    battery: &TestBattery,
    stop: &CancelFlag,
) -> Result<Vec<JoinHandle<Result<TestPValues>>>> {
    let mut jobs = Vec::with_capacity(battery.tests().len());
    for &test in battery.tests() {
        let set = Arc::clone(set);
        let battery = battery.clone();
        let stop = stop.clone();
        jobs.push(spawn_job(semaphore, move || battery.run_test(test, &set, Some(&stop))).await?);
    }
    Ok(jobs)
}

// ---------------------------------------------------------------------------
// Report assembly
// ---------------------------------------------------------------------------

fn assemble_report(
    config: &SimulationConfig,
    seed: u64,
    estimated_ctr_h0: f64,
    min_samples_required: Option<u64>,
    h0: (&ReplicateSet, TestResult),
    h1: (&ReplicateSet, TestResult),
) -> SimulationReport {
    let alpha = config.design.alpha;
    let calibration = analysis::calibration(&h0.1, alpha, CALIBRATION_Z);
    for c in calibration.iter().filter(|c| c.valid > 0 && !c.within_band) {
        warn!(
            test = %c.name,
            rejections = c.rejections,
            valid = c.valid,
            band_low = c.band.0,
            band_high = c.band.1,
            "type-I error outside the expected band"
        );
    }

    let h0_report = scenario_report(Scenario::H0, 0.0, config, h0.0, h0.1);
    let h1_report = scenario_report(Scenario::H1, config.experiment.uplift, config, h1.0, h1.1);

    SimulationReport {
        schema_version: SCHEMA_VERSION,
        seed,
        config: config.clone(),
        estimated_ctr_h0,
        min_samples_required,
        h0: h0_report,
        h1: h1_report,
        calibration,
    }
}

fn scenario_report(
    scenario: Scenario,
    uplift: f64,
    config: &SimulationConfig,
    set: &ReplicateSet,
    p_values: TestResult,
) -> ScenarioReport {
    for entry in p_values.iter() {
        let excluded = entry.excluded();
        if excluded > 0 {
            warn!(
                scenario = %scenario,
                test = %entry.name,
                "{} of {} replicates excluded",
                excluded,
                entry.p_values.len()
            );
        }
    }

    let power = analysis::power(&p_values, config.design.alpha);
    let p_value_histograms = p_values
        .iter()
        .map(|t| PValueHistogram {
            name: t.name.clone(),
            histogram: analysis::histogram(&t.p_values, config.histogram_bins, 0.0, 1.0),
        })
        .collect();
    let sample_distributions = set
        .get(0)
        .map(|r| {
            [Group::Control, Group::Treatment]
                .into_iter()
                .map(|group| {
                    let g = r.group(group);
                    let views: Vec<f64> = g.views.iter().map(|&v| v as f64).collect();
                    GroupDistribution {
                        group,
                        views: analysis::histogram_auto(&views, config.histogram_bins),
                        ctr: analysis::histogram_auto(&g.ctr, config.histogram_bins),
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    ScenarioReport {
        scenario,
        uplift,
        p_values,
        power,
        p_value_histograms,
        sample_distributions,
        data: config.include_data.then(|| set.clone()),
    }
}
