//! Submission backends.
//!
//! A backend takes an analysis configuration and gets its trials run,
//! either on this host or as a job array on a batch cluster. Backends are
//! picked by name through a [`BackendRegistry`].

pub mod cluster;
pub mod local;
pub mod poller;
pub mod registry;
pub mod scheduler;

use crate::config::Settings;
use crate::engine::TrialEngine;
use crate::error::{Result, SubmitError};
use crate::models::{AnalysisConfig, JobId};
use crate::storage::{remove_artifacts, ArtifactLayout};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

pub use cluster::ClusterBackend;
pub use local::{LocalBackend, LocalPool};
pub use registry::BackendRegistry;

/// Choices fixed when a backend is constructed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubmitOptions {
    /// Send the job to the cluster instead of running it here.
    pub use_cluster: bool,
    /// Delete old artifacts of the run before submitting.
    pub remove_old_results: bool,
}

/// Everything a backend constructor needs.
#[derive(Clone)]
pub struct BackendContext {
    pub engine: Arc<dyn TrialEngine>,
    pub layout: ArtifactLayout,
    pub settings: Settings,
    pub options: SubmitOptions,
    pub show_progress: bool,
}

impl BackendContext {
    /// The local worker pool described by these settings.
    pub fn local_pool(&self) -> LocalPool {
        LocalPool::new(
            Arc::clone(&self.engine),
            self.layout.clone(),
            self.settings.local.n_cpu,
        )
        .with_progress(self.show_progress)
    }
}

/// A place where trials can be run.
#[async_trait]
pub trait Backend: Send + Sync + fmt::Display {
    /// Registry name of this backend.
    fn name(&self) -> &'static str;

    fn options(&self) -> SubmitOptions;

    /// Local pool, used for local submission and quick injections.
    fn pool(&self) -> &LocalPool;

    /// Id of the most recent cluster submission, if any.
    fn job_id(&self) -> Option<JobId> {
        None
    }

    /// Human-readable plan for submitting `config`, without running anything.
    fn describe_plan(&self, config: &AnalysisConfig) -> String {
        format!(
            "{} trials for {} on {} local workers",
            config.n_trials,
            config.name,
            self.pool().worker_count()
        )
    }

    /// Serialize the configuration and run it on the local pool.
    async fn submit_local(&self, config: &AnalysisConfig) -> Result<()> {
        self.pool().run(config).await
    }

    /// Submit the configuration as a cluster job.
    async fn submit_cluster(&mut self, _config: &AnalysisConfig) -> Result<()> {
        Err(SubmitError::Unsupported {
            backend: self.name(),
            operation: "cluster submission",
        })
    }

    /// Clean old results if asked to, then submit locally or to the cluster.
    async fn submit(&mut self, config: &AnalysisConfig) -> Result<()> {
        let options = self.options();
        if options.remove_old_results {
            debug!("Removing old results of {}", config.name);
            remove_artifacts(self.pool().layout(), &config.name)?;
        }

        if options.use_cluster {
            self.submit_cluster(config).await
        } else {
            self.submit_local(config).await
        }
    }

    /// Block until the most recent cluster submission has finished.
    async fn wait_for_job(&mut self) -> Result<()> {
        Err(SubmitError::Unsupported {
            backend: self.name(),
            operation: "waiting for a job",
        })
    }

    /// Block until the given jobs, or all of the user's queued jobs, have finished.
    async fn wait_for_cluster(&self, _job_ids: &[JobId]) -> Result<()> {
        Err(SubmitError::Unsupported {
            backend: self.name(),
            operation: "waiting for the cluster",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::local::testing::RecordingEngine;
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn backend(dir: &TempDir, engine: Arc<RecordingEngine>, options: SubmitOptions) -> LocalBackend {
        let pool = LocalPool::new(engine, ArtifactLayout::new(dir.path()), Some(2)).with_host_cores(4);
        LocalBackend::new(pool, options)
    }

    #[tokio::test]
    async fn test_submit_runs_locally_by_default() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(RecordingEngine::default());
        let mut backend = backend(&dir, engine.clone(), SubmitOptions::default());

        let mut config = AnalysisConfig::new("ccsn");
        config.n_trials = 8;
        backend.submit(&config).await.unwrap();

        assert_eq!(engine.trials_run(), 8);
        assert_eq!(backend.job_id(), None);
    }

    #[tokio::test]
    async fn test_submit_removes_old_results_first() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(RecordingEngine::default());
        let options = SubmitOptions {
            use_cluster: false,
            remove_old_results: true,
        };
        let mut backend = backend(&dir, engine, options);

        let layout = ArtifactLayout::new(dir.path());
        let stale = layout.pickle_output_dir("ccsn").join("3.0");
        fs::create_dir_all(&stale).unwrap();

        backend.submit(&AnalysisConfig::new("ccsn")).await.unwrap();
        assert!(!stale.exists());
    }

    #[tokio::test]
    async fn test_cluster_mode_on_local_backend_is_unsupported() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(RecordingEngine::default());
        let options = SubmitOptions {
            use_cluster: true,
            remove_old_results: false,
        };
        let mut backend = backend(&dir, engine.clone(), options);

        let err = backend.submit(&AnalysisConfig::new("ccsn")).await.unwrap_err();
        assert!(matches!(
            err,
            SubmitError::Unsupported {
                operation: "cluster submission",
                ..
            }
        ));
        assert_eq!(engine.trials_run(), 0);
    }

    #[test]
    fn test_describe_plan() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(RecordingEngine::default());
        let backend = backend(&dir, engine, SubmitOptions::default());

        let mut config = AnalysisConfig::new("ccsn");
        config.n_trials = 50;
        assert_eq!(
            backend.describe_plan(&config),
            "50 trials for ccsn on 2 local workers"
        );
    }
}
