//! Interfaces to the trial engine and the results aggregator.
//!
//! Both collaborators live outside this crate. The submission layer only
//! needs to start trials, ask for a closed-form scale guess, and read a
//! rough scale estimate back from finished trials.

pub mod command;

use crate::models::{AnalysisConfig, ScaleGuess};
use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

pub use command::{CommandAggregator, CommandEngine};

/// One local worker's share of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialTask {
    /// Run name, for logs and error messages.
    pub name: String,
    /// Serialized configuration the worker reads.
    pub config_path: PathBuf,
    /// Trials this worker performs.
    pub trials: u64,
    /// Zero-based worker index.
    pub worker: usize,
}

/// Produces pseudo-experiments for a configuration.
#[async_trait]
pub trait TrialEngine: Send + Sync {
    /// Run the trials of one task to completion.
    async fn run_trials(&self, task: &TrialTask) -> Result<()>;

    /// Closed-form discovery scale estimate for an unmodified configuration.
    async fn guess_scale(&self, config: &AnalysisConfig) -> Result<f64>;
}

/// Loads finished trials and summarises them.
#[async_trait]
pub trait ResultsAggregator: Send + Sync {
    /// Rough sensitivity and discovery scales from the test-statistic
    /// distribution, skipping the full threshold fits.
    async fn estimate_scale(&self, config: &AnalysisConfig, config_path: &Path)
        -> Result<ScaleGuess>;
}
