//! Monte-Carlo A/B test simulator for click-through data.
//!
//! Simulates per-user views and clicks for a control and a treatment group,
//! runs a battery of hypothesis tests over many replicate experiments and
//! reports how well each test controls Type-I error and how much power it
//! has against a given uplift.
//!
//! ```no_run
//! use ab_test_simulator::{engine, SimulationConfig};
//!
//! let config = SimulationConfig { seed: Some(42), ..Default::default() };
//! let report = engine::run(&config, 42, None)?;
//! println!("{:?}", report.h1.power.get("Binomial, CTR"));
//! # Ok::<(), ab_test_simulator::SimError>(())
//! ```

pub mod analysis;
pub mod battery;
pub mod cancel;
pub mod cli;
pub mod config;
pub mod datagen;
pub mod design;
pub mod engine;
pub mod error;

pub use analysis::{empirical_cdf, power, PowerSummary};
pub use battery::{apply_tests, StatTest, TestBattery, TestKind, TestResult};
pub use cancel::CancelFlag;
pub use config::{ExperimentConfig, SimulationConfig};
pub use datagen::{generate, AbTestGenerator, ReplicateSet};
pub use design::{design, EffectScale};
pub use engine::{run, run_parallel, SimulationReport};
pub use error::{Result, SimError};
