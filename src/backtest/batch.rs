//! Parallel batch runs.
//!
//! Each run gets its own engine, ledger and random generator, so runs share
//! nothing but the read-only feed. A panic inside one run is reported as a
//! failed outcome without affecting the others.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};

use rayon::prelude::*;
use tracing::{info, warn};

use crate::data::FeedItem;

use super::config::{ConfigError, SimulationConfig};
use super::engine::{SimulationEngine, SimulationResult};
use super::signal::SignalSource;

/// Outcome of one run in a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    Completed(Box<SimulationResult>),
    InvalidConfig { seed: u64, error: ConfigError },
    Failed { seed: u64, message: String },
}

impl BatchOutcome {
    pub fn result(&self) -> Option<&SimulationResult> {
        match self {
            Self::Completed(result) => Some(result),
            _ => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

/// Runs a set of configurations over the same feed in parallel.
#[derive(Debug, Clone, Default)]
pub struct BatchRunner {
    configs: Vec<SimulationConfig>,
}

impl BatchRunner {
    pub fn new(configs: Vec<SimulationConfig>) -> Self {
        Self { configs }
    }

    /// One run per seed, otherwise identical to `base`.
    pub fn seed_sweep<I>(base: &SimulationConfig, seeds: I) -> Self
    where
        I: IntoIterator<Item = u64>,
    {
        let configs = seeds
            .into_iter()
            .map(|seed| SimulationConfig {
                seed,
                ..base.clone()
            })
            .collect();
        Self { configs }
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    /// Run every configuration. `make_source` builds a fresh signal source
    /// per run. Outcomes are returned in configuration order.
    pub fn run<F, S>(&self, feed: &[FeedItem], make_source: F) -> Vec<BatchOutcome>
    where
        F: Fn(&SimulationConfig) -> S + Sync,
        S: SignalSource,
    {
        let progress = AtomicUsize::new(0);
        let total = self.configs.len();

        self.configs
            .par_iter()
            .map(|config| {
                let seed = config.seed;
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| -> Result<_, ConfigError> {
                    let mut engine = SimulationEngine::new(config.clone())?;
                    let mut source = make_source(config);
                    Ok(engine.run_feed(&mut source, feed))
                }));

                let done = progress.fetch_add(1, Ordering::Relaxed) + 1;
                if done % (total / 10).max(1) == 0 || done == total {
                    info!("Batch progress: {}/{} runs", done, total);
                }

                match outcome {
                    Ok(Ok(result)) => BatchOutcome::Completed(Box::new(result)),
                    Ok(Err(error)) => {
                        warn!("Run with seed {} has invalid config: {}", seed, error);
                        BatchOutcome::InvalidConfig { seed, error }
                    }
                    Err(payload) => {
                        let message = payload
                            .downcast_ref::<&str>()
                            .map(|s| (*s).to_string())
                            .or_else(|| payload.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "run panicked".to_string());
                        warn!("Run with seed {} failed: {}", seed, message);
                        BatchOutcome::Failed { seed, message }
                    }
                }
            })
            .collect()
    }
}
