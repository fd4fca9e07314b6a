//! bluefly command line
//!
//! Runs fly scans against the simulated beamline and prints the documents
//! they produce, one JSON object per line.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;

use bluefly::config::{FlyConfig, DEFAULT_CONFIG_PATH};
use bluefly::device::{Device, Flyable};
use bluefly::points::{CompoundGenerator, LineGenerator};
use bluefly::sim::SimBeamline;
use bluefly::tracing_setup;

#[derive(Debug, Parser)]
#[command(name = "bluefly", version, about = "Fly scanning on a simulated beamline")]
struct Cli {
    /// Configuration file, merged over the built-in defaults
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the effective configuration as TOML
    Config,
    /// Fly a snake scan over t1y (slow) and t1x (fast)
    Scan(ScanArgs),
}

#[derive(Debug, Args)]
struct ScanArgs {
    /// Start, stop and number of points along t1y
    #[arg(long, num_args = 3, value_names = ["START", "STOP", "NUM"], default_values_t = [-5.0, 5.0, 5.0])]
    y: Vec<f64>,

    /// Start, stop and number of points along t1x
    #[arg(long, num_args = 3, value_names = ["START", "STOP", "NUM"], default_values_t = [-5.0, 5.0, 10.0])]
    x: Vec<f64>,

    /// Seconds per point
    #[arg(long, default_value_t = 0.1)]
    duration: f64,

    /// Pause once this many points are done, then resume
    #[arg(long)]
    pause_after: Option<usize>,
}

impl ScanArgs {
    fn line(axis: &str, values: &[f64]) -> Result<LineGenerator> {
        let &[start, stop, num] = values else {
            anyhow::bail!("--{} needs START STOP NUM", axis.trim_start_matches("t1"));
        };
        if num < 1.0 || num.fract() != 0.0 {
            anyhow::bail!("number of points along {axis} must be a positive integer, got {num}");
        }
        Ok(LineGenerator::new(axis, "mm", start, stop, num as usize))
    }

    fn generator(&self) -> Result<CompoundGenerator> {
        Ok(CompoundGenerator::new(
            vec![
                Self::line("t1y", &self.y)?,
                Self::line("t1x", &self.x)?.alternating(),
            ],
            self.duration,
        ))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = FlyConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(level) = cli.log_level {
        config.application.log_level = level;
        config.validate()?;
    }
    tracing_setup::init_from_config(&config.application)?;

    match cli.command {
        Command::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Scan(args) => scan(&config, &args).await,
    }
}

async fn scan(config: &FlyConfig, args: &ScanArgs) -> Result<()> {
    let beamline = SimBeamline::new(config)?;
    let fly = &beamline.fly;
    let generator = args.generator()?;
    let total = generator.size();
    fly.configure(generator)?;
    fly.stage()?;
    fly.kickoff().await.context("kickoff")?;
    tracing::info!(points = total, "Kicked off");

    // Detector fields exist once kickoff has opened the files
    for (stream, description) in fly.describe_collect()? {
        println!("{}", json!({ "descriptor": stream, "data_keys": description }));
    }

    let mut complete = fly.complete();
    complete.watch(|update| {
        tracing::info!(done = update.current, of = update.target, "Scan progress");
    });

    if let Some(pause_after) = args.pause_after.filter(|n| *n < total) {
        while fly.completed_steps() < pause_after && !complete.done() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if !complete.done() {
            fly.pause()?.await.context("pause")?;
            print_documents(fly)?;
            tracing::info!(completed = fly.completed_steps(), "Paused, resuming");
            complete = fly.resume()?;
        }
    }

    let outcome = complete.await;
    print_documents(fly)?;
    fly.unstage().await.context("unstage")?;
    outcome.context("complete")?;
    tracing::info!(points = fly.completed_steps(), "Scan finished");
    Ok(())
}

fn print_documents(fly: &impl Flyable) -> Result<()> {
    for doc in fly.collect_asset_docs() {
        println!("{}", serde_json::to_string(&doc)?);
    }
    for event in fly.collect()? {
        println!("{}", json!({ "event": event }));
    }
    Ok(())
}
