//! The `analyse` entry point: estimate, rescale, submit, optionally wait.

use crate::backend::Backend;
use crate::error::Result;
use crate::estimate::{EstimationState, ScaleEstimator};
use crate::models::{AnalysisConfig, EstimationMethod, JobId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Instant;
use tracing::{debug, info};

/// Record of one `analyse` call.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyseOutcome {
    pub name: String,
    pub backend: String,
    pub use_cluster: bool,
    pub methods: Vec<EstimationMethod>,
    pub want_discovery: bool,
    /// Final estimation state, when any method ran.
    pub estimation: Option<EstimationState>,
    pub original_scale: f64,
    pub submitted_scale: f64,
    pub n_trials: u64,
    pub job_id: Option<JobId>,
    /// Whether the call blocked until the cluster job finished.
    pub waited: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_seconds: f64,
}

/// Drives a backend through estimation and submission.
pub struct Orchestrator {
    backend: Box<dyn Backend>,
    estimator: ScaleEstimator,
    methods: Vec<EstimationMethod>,
}

impl Orchestrator {
    pub fn new(
        backend: Box<dyn Backend>,
        estimator: ScaleEstimator,
        methods: Vec<EstimationMethod>,
    ) -> Self {
        Self {
            backend,
            estimator,
            methods,
        }
    }

    /// Estimate the scale if asked to, then submit the rescaled configuration.
    ///
    /// With `wait`, a cluster submission blocks until its job leaves the queue.
    pub async fn analyse(
        &mut self,
        config: &AnalysisConfig,
        want_discovery: bool,
        wait: bool,
    ) -> Result<AnalyseOutcome> {
        let started_at = Utc::now();
        let clock = Instant::now();

        let estimation = if self.methods.is_empty() {
            debug!("No scale estimation requested for {}", config.name);
            None
        } else {
            self.estimator
                .estimate(self.backend.as_ref(), config, &self.methods)
                .await?
        };

        let mut submitted = config.clone();
        if let Some(state) = estimation {
            submitted.scale = state.guess.submission_scale(want_discovery);
            info!(
                "Setting injection scale of {} to {} (from {} guess {})",
                config.name,
                submitted.scale,
                if want_discovery { "discovery" } else { "sensitivity" },
                if want_discovery {
                    state.guess.discovery
                } else {
                    state.guess.sensitivity
                }
            );
        }

        debug!("{}", self.backend);
        self.backend.submit(&submitted).await?;

        let options = self.backend.options();
        let waited = wait && options.use_cluster;
        if waited {
            self.backend.wait_for_job().await?;
        }

        Ok(AnalyseOutcome {
            name: config.name.clone(),
            backend: self.backend.name().to_string(),
            use_cluster: options.use_cluster,
            methods: self.methods.clone(),
            want_discovery,
            estimation,
            original_scale: config.scale,
            submitted_scale: submitted.scale,
            n_trials: submitted.n_trials,
            job_id: self.backend.job_id(),
            waited,
            started_at,
            finished_at: Utc::now(),
            duration_seconds: clock.elapsed().as_secs_f64(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::local::testing::RecordingEngine;
    use crate::backend::poller::PollSchedule;
    use crate::backend::scheduler::testing::{queue_table, ScriptedScheduler};
    use crate::backend::{BackendContext, ClusterBackend, LocalBackend, LocalPool, SubmitOptions};
    use crate::config::Settings;
    use crate::estimate::testing::ScriptedAggregator;
    use crate::storage::ArtifactLayout;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn local(
        dir: &TempDir,
        engine: Arc<RecordingEngine>,
        aggregator: Arc<ScriptedAggregator>,
        methods: Vec<EstimationMethod>,
    ) -> Orchestrator {
        let pool = LocalPool::new(engine.clone(), ArtifactLayout::new(dir.path()), Some(2))
            .with_host_cores(4);
        let backend = LocalBackend::new(pool, SubmitOptions::default());
        Orchestrator::new(
            Box::new(backend),
            ScaleEstimator::new(engine, aggregator),
            methods,
        )
    }

    fn submitted_scales(engine: &RecordingEngine, name: &str) -> Vec<f64> {
        engine
            .seen_configs
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.name == name)
            .map(|c| c.scale)
            .collect()
    }

    #[tokio::test]
    async fn test_closed_form_discovery_run() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(RecordingEngine::guessing(20.0));
        let mut orchestrator = local(
            &dir,
            engine.clone(),
            Arc::new(ScriptedAggregator::default()),
            vec![EstimationMethod::Asimov],
        );

        let mut config = AnalysisConfig::new("tde");
        config.scale = 10.0;
        config.n_trials = 4;
        let outcome = orchestrator.analyse(&config, true, false).await.unwrap();

        assert_eq!(outcome.submitted_scale, 40.0);
        assert_eq!(outcome.original_scale, 10.0);
        let scales = submitted_scales(&engine, "tde");
        assert!(!scales.is_empty());
        assert!(scales.iter().all(|&s| s == 40.0));
    }

    #[tokio::test]
    async fn test_closed_form_sensitivity_run() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(RecordingEngine::guessing(20.0));
        let mut orchestrator = local(
            &dir,
            engine,
            Arc::new(ScriptedAggregator::default()),
            vec![EstimationMethod::Asimov],
        );

        let outcome = orchestrator
            .analyse(&AnalysisConfig::new("tde"), false, false)
            .await
            .unwrap();
        assert!((outcome.submitted_scale - 12.0).abs() < 1e-9);
        assert!(!outcome.waited);
    }

    #[tokio::test]
    async fn test_non_finite_guess_is_never_submitted() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(RecordingEngine::guessing(f64::NAN));
        let mut orchestrator = local(
            &dir,
            engine.clone(),
            Arc::new(ScriptedAggregator::default()),
            vec![EstimationMethod::Asimov],
        );

        let err = orchestrator
            .analyse(&AnalysisConfig::new("tde"), true, false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("'tde'"));
        assert_eq!(engine.trials_run(), 0);
        assert!(!ArtifactLayout::new(dir.path())
            .analysis_config_path("tde")
            .exists());
    }

    #[tokio::test]
    async fn test_without_estimation_scale_is_untouched() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(RecordingEngine::guessing(20.0));
        let mut orchestrator = local(
            &dir,
            engine.clone(),
            Arc::new(ScriptedAggregator::default()),
            Vec::new(),
        );

        let mut config = AnalysisConfig::new("tde");
        config.scale = 7.5;
        let outcome = orchestrator.analyse(&config, true, false).await.unwrap();

        assert_eq!(outcome.submitted_scale, 7.5);
        assert!(outcome.estimation.is_none());
        assert!(submitted_scales(&engine, "tde").iter().all(|&s| s == 7.5));
    }

    #[tokio::test]
    async fn test_cluster_run_estimates_locally_and_waits() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(RecordingEngine::default());
        let aggregator = Arc::new(ScriptedAggregator::replaying(&[(3.0, 8.0)]));
        let scheduler = Arc::new(ScriptedScheduler {
            submit_response: "Your job-array 77.1-5:1 (\"SubmitJob.sh\") has been submitted".to_string(),
            queue: std::sync::Mutex::new(vec![queue_table(&[(77, "r")]), String::new()].into()),
            ..Default::default()
        });

        let mut settings = Settings::default();
        settings.cluster.trials_per_task = 20;
        settings.cluster.cluster_cpu = Some(1);
        settings.cluster.username = Some("jdoe".to_string());
        let ctx = BackendContext {
            engine: engine.clone(),
            layout: ArtifactLayout::new(dir.path()),
            settings,
            options: SubmitOptions {
                use_cluster: true,
                remove_old_results: false,
            },
            show_progress: false,
        };
        let backend = ClusterBackend::new(ctx, scheduler.clone()).with_schedule(PollSchedule::immediate());

        let mut orchestrator = Orchestrator::new(
            Box::new(backend),
            ScaleEstimator::new(engine.clone(), aggregator),
            vec![EstimationMethod::QuickInjections],
        );

        let mut config = AnalysisConfig::new("ccsn");
        config.scale = 10.0;
        config.n_trials = 100;
        let outcome = orchestrator.analyse(&config, false, true).await.unwrap();

        // Quick injections ran on the local pool; the real run went to the scheduler.
        assert_eq!(engine.trials_run(), 10);
        assert_eq!(scheduler.submissions.lock().unwrap().len(), 1);
        assert_eq!(scheduler.submissions.lock().unwrap()[0][1], "1-5:1");

        assert_eq!(outcome.submitted_scale, 6.0);
        assert_eq!(outcome.job_id, Some(JobId(77)));
        assert!(outcome.waited);
        assert_eq!(outcome.backend, "sge");
        assert!(scheduler.queue.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_estimation_failure_stops_before_submission() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(RecordingEngine::default());
        let mut orchestrator = local(
            &dir,
            engine.clone(),
            Arc::new(ScriptedAggregator::default()),
            vec![EstimationMethod::QuickInjections],
        );

        let result = orchestrator
            .analyse(&AnalysisConfig::new("ccsn"), false, false)
            .await;
        assert!(result.is_err());
        assert!(submitted_scales(&engine, "ccsn").is_empty());
    }
}
