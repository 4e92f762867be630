use std::path::PathBuf;

use clap::Parser;
use clap_complete::Shell;

use crate::battery::TestKind;
use crate::config::{self, SimulationConfig};
use crate::design::EffectScale;
use crate::error::Result;

#[derive(Parser, Debug)]
#[command(name = "ab-test-simulator")]
#[command(version)]
#[command(about = "Simulate A/B tests on click data and compare hypothesis tests")]
pub struct Args {
    /// TOML config file; flags below override its values
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Mean click probability of the control group (fraction, e.g. 0.02)
    #[arg(long)]
    pub base_ctr: Option<f64>,

    /// Additive CTR uplift of the treatment group (fraction)
    #[arg(long, allow_hyphen_values = true)]
    pub uplift: Option<f64>,

    /// Beta concentration of per-user click probabilities
    #[arg(long)]
    pub concentration: Option<f64>,

    /// Log-normal scale of per-user view counts
    #[arg(long)]
    pub skew: Option<f64>,

    /// Users per group per replicate
    #[arg(long, short = 'n')]
    pub samples: Option<usize>,

    /// Number of simulated experiments
    #[arg(long, short = 'r')]
    pub replicates: Option<usize>,

    /// Type-I error rate
    #[arg(long)]
    pub alpha: Option<f64>,

    /// Type-II error rate (power = 1 - beta)
    #[arg(long)]
    pub beta: Option<f64>,

    /// Minimum detectable effect for the sample-size design
    #[arg(long)]
    pub mde: Option<f64>,

    /// Whether --mde is an absolute or relative change of the baseline
    #[arg(long, value_enum)]
    pub effect_scale: Option<EffectScale>,

    /// Master seed; omitted means a fresh seed per run
    #[arg(long)]
    pub seed: Option<u64>,

    /// Tests to run, comma separated
    #[arg(long, value_enum, value_delimiter = ',')]
    pub tests: Option<Vec<TestKind>>,

    /// Bootstrap resamples per replicate
    #[arg(long)]
    pub resamples: Option<usize>,

    /// Concurrent worker jobs
    #[arg(long, short)]
    pub workers: Option<usize>,

    /// Bins of the report histograms
    #[arg(long)]
    pub bins: Option<usize>,

    /// Write the JSON report to this file
    #[arg(long, short)]
    pub output: Option<PathBuf>,

    /// Embed the raw replicate sets in the report
    #[arg(long)]
    pub include_data: bool,

    /// Run on the calling thread instead of the worker pool
    #[arg(long)]
    pub sequential: bool,

    /// Print a shell completion script and exit
    #[arg(long, value_enum)]
    pub completions: Option<Shell>,
}

impl Args {
    /// Build the run configuration: file (or defaults), then flag overrides,
    /// then validation.
    pub fn to_config(&self) -> Result<SimulationConfig> {
        let mut cfg = match &self.config {
            Some(path) => config::load_from_file(path)?,
            None => SimulationConfig::default(),
        };
        self.apply_overrides(&mut cfg);
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_overrides(&self, cfg: &mut SimulationConfig) {
        let exp = &mut cfg.experiment;
        override_with(&mut exp.base_ctr, self.base_ctr);
        override_with(&mut exp.uplift, self.uplift);
        override_with(&mut exp.concentration, self.concentration);
        override_with(&mut exp.skew, self.skew);
        override_with(&mut exp.n_samples, self.samples);
        override_with(&mut exp.n_replicates, self.replicates);

        let design = &mut cfg.design;
        override_with(&mut design.alpha, self.alpha);
        override_with(&mut design.beta, self.beta);
        override_with(&mut design.mde, self.mde);
        override_with(&mut design.effect_scale, self.effect_scale);

        override_with(&mut cfg.battery.tests, self.tests.clone());
        override_with(&mut cfg.battery.bootstrap_resamples, self.resamples);
        override_with(&mut cfg.workers, self.workers);
        override_with(&mut cfg.histogram_bins, self.bins);
        if self.seed.is_some() {
            cfg.seed = self.seed;
        }
        if self.include_data {
            cfg.include_data = true;
        }
    }
}

fn override_with<T>(slot: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *slot = v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SimError;
    use std::io::Write;

    #[test]
    fn test_args_parse_minimal() {
        let args = Args::parse_from(["abt"]);
        assert!(args.config.is_none());
        assert!(args.seed.is_none());
        assert!(!args.include_data);
        assert!(!args.sequential);
        assert!(args.completions.is_none());
    }

    #[test]
    fn test_args_parse_full() {
        let args = Args::parse_from([
            "abt",
            "--base-ctr", "0.05",
            "--uplift", "0.01",
            "--concentration", "500",
            "--skew", "1.2",
            "--samples", "200",
            "--replicates", "50",
            "--alpha", "0.01",
            "--beta", "0.1",
            "--mde", "0.2",
            "--effect-scale", "relative",
            "--seed", "42",
            "--tests", "binomial,t-test-ctr",
            "--resamples", "300",
            "--workers", "8",
            "--bins", "30",
            "--output", "out.json",
            "--include-data",
        ]);
        assert_eq!(args.base_ctr, Some(0.05));
        assert_eq!(args.samples, Some(200));
        assert_eq!(args.effect_scale, Some(EffectScale::Relative));
        assert_eq!(args.tests, Some(vec![TestKind::Binomial, TestKind::TTestCtr]));
        assert_eq!(args.output, Some(PathBuf::from("out.json")));
        assert!(args.include_data);
    }

    #[test]
    fn test_args_negative_uplift() {
        let args = Args::parse_from(["abt", "--uplift", "-0.005"]);
        assert_eq!(args.uplift, Some(-0.005));
    }

    #[test]
    fn test_args_short_flags() {
        let args = Args::parse_from(["abt", "-n", "10", "-r", "3", "-w", "2", "-o", "r.json"]);
        assert_eq!(args.samples, Some(10));
        assert_eq!(args.replicates, Some(3));
        assert_eq!(args.workers, Some(2));
    }

    #[test]
    fn test_args_unknown_test_rejected() {
        assert!(Args::try_parse_from(["abt", "--tests", "chi-square"]).is_err());
    }

    #[test]
    fn test_args_completions() {
        let args = Args::parse_from(["abt", "--completions", "bash"]);
        assert_eq!(args.completions, Some(Shell::Bash));
    }

    #[test]
    fn test_to_config_defaults() {
        let cfg = Args::parse_from(["abt"]).to_config().unwrap();
        assert_eq!(cfg, SimulationConfig::default());
    }

    #[test]
    fn test_to_config_overrides() {
        let cfg = Args::parse_from(["abt", "--uplift", "0.0", "--seed", "3", "--tests", "bootstrap"])
            .to_config()
            .unwrap();
        assert_eq!(cfg.experiment.uplift, 0.0);
        assert_eq!(cfg.seed, Some(3));
        assert_eq!(cfg.battery.tests, vec![TestKind::Bootstrap]);
        assert_eq!(cfg.experiment.base_ctr, 0.02);
    }

    #[test]
    fn test_to_config_flags_override_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "seed = 1\n\n[experiment]\nbase_ctr = 0.1\nskew = 0.9").unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let cfg = Args::parse_from(["abt", "--config", &path, "--skew", "0.3"])
            .to_config()
            .unwrap();
        assert_eq!(cfg.seed, Some(1));
        assert_eq!(cfg.experiment.base_ctr, 0.1);
        assert_eq!(cfg.experiment.skew, 0.3);
    }

    #[test]
    fn test_to_config_validates_overrides() {
        let err = Args::parse_from(["abt", "--base-ctr", "1.5"]).to_config().unwrap_err();
        assert!(matches!(err, SimError::InvalidConfig { field: "base_ctr", .. }));
    }
}
