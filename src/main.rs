use std::io;

use ab_test_simulator::cli::Args;
use ab_test_simulator::engine::{self, SimulationReport};
use ab_test_simulator::CancelFlag;
use clap::{CommandFactory, Parser};
use colored::*;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `LOG_FORMAT=json` switches to JSON lines;
/// the level comes from `RUST_LOG` and defaults to `info`. Logs go to stderr
/// so stdout stays clean for the summary.
fn init_tracing() -> Result<(), Box<dyn std::error::Error>> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .try_init(),
    };
    result.map_err(|e| format!("tracing init failed: {e}").into())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if let Some(shell) = args.completions {
        clap_complete::generate(shell, &mut Args::command(), "ab-test-simulator", &mut io::stdout());
        return Ok(());
    }

    init_tracing()?;
    let config = args.to_config()?;
    let seed = config.resolve_seed();

    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, cancelling");
                cancel.cancel();
            }
        });
    }

    let report = if args.sequential {
        let config = config.clone();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || engine::run(&config, seed, Some(&cancel))).await??
    } else {
        engine::run_parallel(&config, seed, Some(cancel)).await?
    };

    print_summary(&report);

    if let Some(path) = &args.output {
        report.write(path)?;
        println!("\n{} {}", "Report written to".green(), path.display());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Terminal summary
// ---------------------------------------------------------------------------

fn fmt_rate(x: f64) -> String {
    if x.is_nan() {
        "n/a".to_string()
    } else {
        format!("{:.3}", x)
    }
}

fn print_summary(report: &SimulationReport) {
    let exp = &report.config.experiment;
    let design = &report.config.design;

    println!("{}", "A/B TEST SIMULATION".bright_cyan().bold());
    println!(
        "  seed {}  |  {} users/group  |  {} replicates  |  base CTR {}  |  uplift {}",
        report.seed, exp.n_samples, exp.n_replicates, exp.base_ctr, exp.uplift
    );
    println!("  estimated CTR (H0)      {}", fmt_rate(report.estimated_ctr_h0));
    match report.min_samples_required {
        Some(n) => println!(
            "  min samples per group   {} (alpha {}, beta {}, mde {} {})",
            n.to_string().bold(),
            design.alpha,
            design.beta,
            design.mde,
            design.effect_scale
        ),
        None => println!("  min samples per group   {}", "undefined".yellow()),
    }

    println!();
    println!(
        "  {:<22} {:>10} {:>10} {:>10}  {}",
        "test".bold(),
        "type I".bold(),
        "power".bold(),
        "excluded".bold(),
        "calibration".bold()
    );
    for (h0, h1) in report.h0.power.entries.iter().zip(&report.h1.power.entries) {
        let calibrated = report
            .calibration
            .iter()
            .find(|c| c.kind == h0.kind)
            .map_or(true, |c| c.valid == 0 || c.within_band);
        let verdict = if calibrated { "ok".green() } else { "off".red().bold() };
        println!(
            "  {:<22} {:>10} {:>10} {:>10}  {}",
            h0.name,
            fmt_rate(h0.power),
            fmt_rate(h1.power),
            h0.excluded + h1.excluded,
            verdict
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fmt_rate() {
        assert_eq!(fmt_rate(0.05), "0.050");
        assert_eq!(fmt_rate(1.0), "1.000");
        assert_eq!(fmt_rate(f64::NAN), "n/a");
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        Args::command().debug_assert();
    }
}
