//! # Run a single simulation
//! mahler-sim run --config config/default.toml --data data --feed feed.json --signals signals.json
//!
//! # Run the same inputs across many seeds in parallel
//! mahler-sim sweep --config config/default.toml --data data --seeds 1-50
//!
//! # Check a configuration file
//! mahler-sim check --config config/default.toml

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::NaiveDateTime;
use clap::{Parser, Subcommand};
use tracing::info;

use mahler_sim::backtest::{BatchRunner, SimulationConfig, SimulationEngine};
use mahler_sim::data::DataLoader;

const SEPARATOR: &str = "============================================================";

#[derive(Parser)]
#[command(name = "mahler-sim")]
#[command(about = "Deterministic historical simulation engine for options strategies")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single simulation
    Run {
        /// Path to configuration file (defaults apply when omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Path to data directory
        #[arg(short, long, default_value = "data")]
        data: PathBuf,

        /// Feed file, relative to the data directory
        #[arg(long, default_value = "feed.json")]
        feed: String,

        /// Signal script, relative to the data directory
        #[arg(long, default_value = "signals.json")]
        signals: String,

        /// Override the configured seed
        #[arg(long)]
        seed: Option<u64>,

        /// First timestamp to replay (YYYY-MM-DDTHH:MM:SS)
        #[arg(long)]
        start: Option<NaiveDateTime>,

        /// Last timestamp to replay (YYYY-MM-DDTHH:MM:SS)
        #[arg(long)]
        end: Option<NaiveDateTime>,

        /// Write the full result as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run the same inputs across a range of seeds
    Sweep {
        #[arg(short, long)]
        config: Option<PathBuf>,

        #[arg(short, long, default_value = "data")]
        data: PathBuf,

        #[arg(long, default_value = "feed.json")]
        feed: String,

        #[arg(long, default_value = "signals.json")]
        signals: String,

        /// Inclusive seed range, e.g. 1-50
        #[arg(long, default_value = "1-20")]
        seeds: String,
    },

    /// Validate a configuration file
    Check {
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<SimulationConfig> {
    let Some(path) = path else {
        return Ok(SimulationConfig::default());
    };
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    SimulationConfig::from_toml_str(&text)
        .with_context(|| format!("Invalid config {}", path.display()))
}

fn parse_seed_range(s: &str) -> Result<std::ops::RangeInclusive<u64>> {
    let (lo, hi) = s
        .split_once('-')
        .with_context(|| format!("Seed range must look like 1-50, got {s}"))?;
    let lo: u64 = lo.trim().parse().context("Invalid seed range start")?;
    let hi: u64 = hi.trim().parse().context("Invalid seed range end")?;
    if lo > hi {
        bail!("Seed range start {lo} is after end {hi}");
    }
    Ok(lo..=hi)
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("mahler_sim=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            data,
            feed,
            signals,
            seed,
            start,
            end,
            output,
        } => {
            let mut config = load_config(config.as_ref())?;
            if let Some(seed) = seed {
                config.seed = seed;
            }

            let loader = DataLoader::new(&data);
            let feed = loader
                .load_feed(&feed)
                .with_context(|| format!("Failed to load feed from {}", data.display()))?;
            let mut source = loader
                .load_signals(&signals)
                .with_context(|| format!("Failed to load signals from {}", data.display()))?;
            info!("Loaded {} feed items and {} signals", feed.len(), source.len());

            let mut engine = SimulationEngine::new(config)?;
            let result = engine.run(
                &mut source,
                &feed,
                start.unwrap_or(NaiveDateTime::MIN),
                end.unwrap_or(NaiveDateTime::MAX),
            );

            println!("{SEPARATOR}");
            println!("{}", result.metrics.summary());
            println!("{SEPARATOR}");
            println!(
                "Open at end: {}  Events: {}",
                result.open_positions.len(),
                result.events.len()
            );

            if let Some(path) = output {
                let json = serde_json::to_string_pretty(&result)?;
                fs::write(&path, json)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                info!("Wrote result to {}", path.display());
            }
        }

        Commands::Sweep {
            config,
            data,
            feed,
            signals,
            seeds,
        } => {
            let config = load_config(config.as_ref())?;
            let seeds = parse_seed_range(&seeds)?;

            let loader = DataLoader::new(&data);
            let feed = loader.load_feed(&feed)?;
            let script = loader.load_signals(&signals)?;

            let runner = BatchRunner::seed_sweep(&config, seeds);
            info!("Running {} simulations", runner.len());
            let outcomes = runner.run(&feed, |_| script.clone());

            println!("{SEPARATOR}");
            println!(
                "{:>8} {:>8} {:>14} {:>10} {:>8}",
                "seed", "trades", "total P&L", "sharpe", "PF"
            );
            for outcome in &outcomes {
                match outcome.result() {
                    Some(r) => {
                        let pf = r
                            .metrics
                            .profit_factor
                            .ratio()
                            .map_or_else(|| "-".to_string(), |pf| format!("{pf:.2}"));
                        println!(
                            "{:>8} {:>8} {:>14.2} {:>10.2} {:>8}",
                            r.seed,
                            r.metrics.total_trades,
                            r.metrics.total_pnl,
                            r.metrics.sharpe_ratio,
                            pf
                        );
                    }
                    None => println!("{outcome:?}"),
                }
            }
            println!("{SEPARATOR}");
        }

        Commands::Check { config } => {
            load_config(Some(&config))?;
            println!("{} is valid", config.display());
        }
    }

    Ok(())
}
