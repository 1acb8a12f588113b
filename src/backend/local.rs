//! Local execution on a bounded worker pool.

use super::registry::BackendRegistry;
use super::{Backend, BackendContext, SubmitOptions};
use crate::engine::{TrialEngine, TrialTask};
use crate::error::{Result, SubmitError};
use crate::models::AnalysisConfig;
use crate::storage::{write_analysis_config, ArtifactLayout};
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info};

pub const BACKEND_NAME: &str = "local";

/// Number of logical cores on this host.
pub fn host_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Split `total` trials into at most `workers` near-equal, non-empty shares.
pub fn split_trials(total: u64, workers: usize) -> Vec<u64> {
    let workers = (workers.max(1) as u64).min(total);
    if workers == 0 {
        return Vec::new();
    }
    let base = total / workers;
    let extra = total % workers;
    (0..workers)
        .map(|i| base + u64::from(i < extra))
        .collect()
}

/// Worker pool that runs a configuration's trials on this host.
///
/// Every backend carries one, since quick-injection estimation always
/// runs locally regardless of where the final job goes.
#[derive(Clone)]
pub struct LocalPool {
    engine: Arc<dyn TrialEngine>,
    layout: ArtifactLayout,
    requested: Option<usize>,
    host_cores: usize,
    show_progress: bool,
}

impl LocalPool {
    pub fn new(engine: Arc<dyn TrialEngine>, layout: ArtifactLayout, requested: Option<usize>) -> Self {
        Self {
            engine,
            layout,
            requested,
            host_cores: host_cores(),
            show_progress: false,
        }
    }

    /// Pretend the host has `cores` cores.
    pub fn with_host_cores(mut self, cores: usize) -> Self {
        self.host_cores = cores;
        self
    }

    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    /// Configured CPU count: the request, or all cores but one.
    pub fn n_cpu(&self) -> usize {
        self.requested
            .unwrap_or_else(|| self.host_cores.saturating_sub(1))
    }

    /// Workers actually started: never more than host cores minus one.
    pub fn worker_count(&self) -> usize {
        self.n_cpu()
            .min(self.host_cores.saturating_sub(1))
            .max(1)
    }

    /// Serialize the configuration and run all of its trials to completion.
    pub async fn run(&self, config: &AnalysisConfig) -> Result<()> {
        let config_path = write_analysis_config(&self.layout, config)?;
        let shares = split_trials(config.n_trials, self.worker_count());
        info!(
            "Running {} trials for {} on {} local workers",
            config.n_trials,
            config.name,
            shares.len()
        );

        let progress = if self.show_progress {
            let pb = ProgressBar::new(shares.len() as u64);
            if let Ok(style) = ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} workers")
            {
                pb.set_style(style.progress_chars("#>-"));
            }
            pb
        } else {
            ProgressBar::hidden()
        };

        let total = shares.len();
        let mut running: FuturesUnordered<_> = shares
            .into_iter()
            .enumerate()
            .map(|(worker, trials)| {
                let task = TrialTask {
                    name: config.name.clone(),
                    config_path: config_path.clone(),
                    trials,
                    worker,
                };
                let engine = Arc::clone(&self.engine);
                async move {
                    let outcome = engine.run_trials(&task).await;
                    (task.worker, outcome)
                }
            })
            .collect();

        let mut failures = Vec::new();
        while let Some((worker, outcome)) = running.next().await {
            progress.inc(1);
            match outcome {
                Ok(()) => debug!("Worker {} finished for {}", worker, config.name),
                Err(e) => {
                    error!("Worker {} failed for {}: {:#}", worker, config.name, e);
                    failures.push(format!("worker {}: {:#}", worker, e));
                }
            }
        }
        progress.finish_and_clear();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(SubmitError::Workers {
                name: config.name.clone(),
                failed: failures.len(),
                total,
                details: failures.join("; "),
            })
        }
    }
}

/// Runs everything on this host; has no cluster operations.
pub struct LocalBackend {
    pool: LocalPool,
    options: SubmitOptions,
}

impl LocalBackend {
    pub fn new(pool: LocalPool, options: SubmitOptions) -> Self {
        Self { pool, options }
    }

    pub(crate) fn create(ctx: BackendContext) -> Box<dyn Backend> {
        let pool = ctx.local_pool();
        Box::new(Self::new(pool, ctx.options))
    }
}

/// Add the local backend to a registry.
pub fn register(registry: &mut BackendRegistry) {
    registry.register(BACKEND_NAME, LocalBackend::create);
}

impl fmt::Display for LocalBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "----- {} backend -----", BACKEND_NAME)?;
        writeln!(
            f,
            "{}using cluster",
            if self.options.use_cluster { "" } else { "not " }
        )?;
        write!(f, "using {} CPUs locally", self.pool.n_cpu())
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn options(&self) -> SubmitOptions {
        self.options
    }

    fn pool(&self) -> &LocalPool {
        &self.pool
    }
}
