//! Prints the resolved model configuration and the respaced sampling schedule.

use anyhow::{Context, Result};
use clap::Parser;
use eggdiffusion::diffusion::GaussianDiffusion;
use eggdiffusion::{load_overrides, ModelConfig, DEFAULT_NUM_STEPS};
use log::info;
use serde::Serialize;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Inspect an energy-guided diffusion schedule",
    long_about = None
)]
struct Args {
    /// YAML file with model configuration overrides
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of sampling steps
    #[arg(long, default_value_t = DEFAULT_NUM_STEPS)]
    steps: usize,

    /// Emit JSON instead of YAML and a table
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct ScheduleRow {
    step: usize,
    original_t: usize,
    model_t: f64,
    alpha_bar: f64,
    alpha_bar_weight: f64,
    posterior_variance: f64,
}

#[derive(Serialize)]
struct Report<'a> {
    config: &'a ModelConfig,
    schedule: Vec<ScheduleRow>,
}

fn schedule_rows(diffusion: &GaussianDiffusion) -> Vec<ScheduleRow> {
    let num_steps = diffusion.num_steps();
    (0..num_steps)
        .map(|step| {
            let t = num_steps - 1 - step;
            ScheduleRow {
                step,
                original_t: diffusion.timestep_map()[t],
                model_t: diffusion.model_timestep(t),
                alpha_bar: diffusion.alpha_bar(t),
                alpha_bar_weight: 1.0 - diffusion.alpha_bar(t),
                posterior_variance: diffusion.posterior_variance(t),
            }
        })
        .collect()
}

fn main() -> Result<()> {
    eggdiffusion::logging::init_logger();
    let args = Args::parse();

    let overrides = match &args.config {
        Some(path) => {
            info!("Loading overrides from {}", path.display());
            let overrides = load_overrides(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Some(overrides)
        }
        None => None,
    };
    let config = ModelConfig::resolve(args.steps, overrides.as_ref())?;
    let diffusion = GaussianDiffusion::from_config(&config)?;
    let rows = schedule_rows(&diffusion);

    if args.json {
        let report = Report {
            config: &config,
            schedule: rows,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    print!("{}", serde_yaml::to_string(&config)?);
    println!();
    println!(
        "{:>5} {:>6} {:>9} {:>12} {:>12} {:>12}",
        "step", "t", "model_t", "alpha_bar", "1-alpha_bar", "post_var"
    );
    for row in &rows {
        println!(
            "{:>5} {:>6} {:>9.2} {:>12.6e} {:>12.6e} {:>12.6e}",
            row.step,
            row.original_t,
            row.model_t,
            row.alpha_bar,
            row.alpha_bar_weight,
            row.posterior_variance
        );
    }
    Ok(())
}
