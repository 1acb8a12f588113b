//! Grid Engine job-array backend.
//!
//! A run of `n_trials` is split into `n_trials / trials_per_task` identical
//! tasks. Each task reads the same serialized configuration, rewritten so
//! that it performs exactly `trials_per_task` trials.

use super::poller::{wait_for_all_cluster_jobs, wait_for_job, PollSchedule};
use super::registry::BackendRegistry;
use super::scheduler::{job_id_from_submit_response, render_command, GridEngineCommands, SchedulerClient};
use super::{Backend, BackendContext, LocalPool, SubmitOptions};
use crate::error::{Result, SubmitError};
use crate::models::{AnalysisConfig, JobId};
use crate::storage::write_analysis_config;
use async_trait::async_trait;
use chrono::Local;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

pub const BACKEND_NAME: &str = "sge";

/// How a trial count is spread over a job array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskPlan {
    pub n_tasks: u64,
    pub trials_per_task: u64,
}

impl TaskPlan {
    pub fn new(total_trials: u64, trials_per_task: u64) -> Self {
        let trials_per_task = trials_per_task.max(1);
        Self {
            n_tasks: total_trials / trials_per_task,
            trials_per_task,
        }
    }

    /// Task range argument, e.g. `1-20:1`.
    pub fn task_range(&self) -> String {
        format!("1-{}:1", self.n_tasks)
    }
}

/// Default memory request per core: `6/cores + 2` GiB.
pub fn default_ram_per_core(cores: usize) -> String {
    format!("{:.1}G", 6.0 / cores.max(1) as f64 + 2.0)
}

/// Values baked into the generated submission script.
#[derive(Debug, Clone)]
pub struct ScriptParams {
    pub shell: String,
    pub h_cpu: String,
    pub ram_per_core: String,
    pub cores: usize,
    pub setup_lines: Vec<String>,
    pub entry_point: String,
    pub log_dir: PathBuf,
}

/// Render the job script. Tasks receive the config path as `$1` and the
/// core count as `$2`.
pub fn render_script(params: &ScriptParams) -> String {
    let mut text = String::new();
    text.push_str(&format!("#!{}\n", params.shell));
    text.push_str("##\n");
    text.push_str("##(otherwise the default shell would be used)\n");
    text.push_str(&format!("#$ -S {}\n", params.shell));
    text.push_str("##\n");
    text.push_str("##(the running time for this job)\n");
    text.push_str(&format!("#$ -l h_cpu={}\n", params.h_cpu));
    text.push_str(&format!("#$ -l h_rss={}\n", params.ram_per_core));
    if params.cores > 1 {
        text.push_str("##(cores per task)\n");
        text.push_str(&format!("#$ -pe multicore {}\n", params.cores));
        text.push_str("#$ -R y\n");
    }
    text.push_str("##\n");
    text.push_str("##(send mail on job's abort)\n");
    text.push_str("#$ -m a\n");
    text.push_str("##\n");
    text.push_str("##(stderr and stdout are merged together to stdout)\n");
    text.push_str("#$ -j y\n");
    text.push_str("##\n");
    text.push_str("##(redirect output to:)\n");
    text.push_str("#$ -o /dev/null\n");
    text.push_str("##\n");
    text.push_str("sleep $(( ( RANDOM % 60 ) + 1 ))\n");
    text.push_str(
        "exec > \"$TMPDIR\"/${JOB_ID}_${SGE_TASK_ID}_stdout.txt 2>\"$TMPDIR\"/${JOB_ID}_${SGE_TASK_ID}_stderr.txt\n",
    );
    for line in &params.setup_lines {
        text.push_str(line);
        text.push('\n');
    }
    text.push_str(&format!("{} -f $1 -n $2\n", params.entry_point));
    let log_dir = params.log_dir.display();
    text.push_str(&format!(
        "cp \"$TMPDIR\"/${{JOB_ID}}_${{SGE_TASK_ID}}_stdout.txt {}\n",
        log_dir
    ));
    text.push_str(&format!(
        "cp \"$TMPDIR\"/${{JOB_ID}}_${{SGE_TASK_ID}}_stderr.txt {}\n",
        log_dir
    ));
    text
}

/// Arguments for the submission program.
pub fn submit_args(plan: &TaskPlan, script: &Path, config_path: &Path, cores: usize) -> Vec<String> {
    vec![
        "-t".to_string(),
        plan.task_range(),
        script.display().to_string(),
        config_path.display().to_string(),
        cores.to_string(),
    ]
}

fn write_script(name: &str, path: &Path, text: &str) -> Result<()> {
    const OPERATION: &str = "writing submission script";
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(SubmitError::storage(name, OPERATION))?;
    }
    fs::write(path, text).map_err(SubmitError::storage(name, OPERATION))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755))
            .map_err(SubmitError::storage(name, OPERATION))?;
    }

    Ok(())
}

/// Submits job arrays and tracks the last one by id.
pub struct ClusterBackend {
    pool: LocalPool,
    options: SubmitOptions,
    scheduler: Arc<dyn SchedulerClient>,
    schedule: PollSchedule,
    script_path: PathBuf,
    script: ScriptParams,
    trials_per_task: u64,
    job_id: Option<JobId>,
}

impl ClusterBackend {
    pub fn new(ctx: BackendContext, scheduler: Arc<dyn SchedulerClient>) -> Self {
        let pool = ctx.local_pool();
        let cluster = &ctx.settings.cluster;
        let cores = cluster.cluster_cpu.unwrap_or_else(|| pool.n_cpu()).max(1);

        let mut entry_point = ctx.settings.engine.program.clone();
        for arg in &ctx.settings.engine.args {
            entry_point.push(' ');
            entry_point.push_str(arg);
        }

        let script = ScriptParams {
            shell: cluster.shell.clone(),
            h_cpu: cluster.h_cpu.clone(),
            ram_per_core: cluster
                .ram_per_core
                .clone()
                .unwrap_or_else(|| default_ram_per_core(cores)),
            cores,
            setup_lines: cluster.setup_lines.clone(),
            entry_point,
            log_dir: ctx.settings.general.effective_log_dir(),
        };

        Self {
            script_path: cluster.effective_script_path(ctx.layout.root()),
            schedule: cluster.poll_schedule(),
            trials_per_task: cluster.trials_per_task,
            script,
            scheduler,
            options: ctx.options,
            pool,
            job_id: None,
        }
    }

    /// Backend driving the scheduler through its command-line tools.
    pub fn from_context(ctx: BackendContext) -> Self {
        let scheduler = Arc::new(GridEngineCommands::from_config(&ctx.settings.cluster));
        Self::new(ctx, scheduler)
    }

    fn create(ctx: BackendContext) -> Box<dyn Backend> {
        Box::new(Self::from_context(ctx))
    }

    pub fn with_schedule(mut self, schedule: PollSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    fn plan(&self, config: &AnalysisConfig) -> TaskPlan {
        TaskPlan::new(config.n_trials, self.trials_per_task)
    }
}

/// Add the Grid Engine backend to a registry.
pub fn register(registry: &mut BackendRegistry) {
    registry.register(BACKEND_NAME, ClusterBackend::create);
}

impl fmt::Display for ClusterBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "----- {} backend -----", BACKEND_NAME)?;
        writeln!(
            f,
            "{}using cluster",
            if self.options.use_cluster { "" } else { "not " }
        )?;
        writeln!(f, "using {} CPUs locally", self.pool.n_cpu())?;
        match self.job_id {
            Some(id) => writeln!(f, "job-id: {}", id)?,
            None => writeln!(f, "job-id: none")?,
        }
        writeln!(f, "h_cpu: {}", self.script.h_cpu)?;
        writeln!(f, "trials_per_task: {}", self.trials_per_task)?;
        writeln!(f, "cluster_cpu: {}", self.script.cores)?;
        write!(f, "ram_per_core: {}", self.script.ram_per_core)
    }
}

#[async_trait]
impl Backend for ClusterBackend {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    fn options(&self) -> SubmitOptions {
        self.options
    }

    fn pool(&self) -> &LocalPool {
        &self.pool
    }

    fn job_id(&self) -> Option<JobId> {
        self.job_id
    }

    fn describe_plan(&self, config: &AnalysisConfig) -> String {
        if !self.options.use_cluster {
            return format!(
                "{} trials for {} on {} local workers",
                config.n_trials,
                config.name,
                self.pool.worker_count()
            );
        }

        let plan = self.plan(config);
        format!(
            "{} trials for {} as {} cluster tasks of {} trials ({} cores, {} per core)\n\nscript {}:\n{}",
            config.n_trials,
            config.name,
            plan.n_tasks,
            plan.trials_per_task,
            self.script.cores,
            self.script.ram_per_core,
            self.script_path.display(),
            render_script(&self.script)
        )
    }

    async fn submit_cluster(&mut self, config: &AnalysisConfig) -> Result<()> {
        let plan = self.plan(config);
        debug!(
            "Running {} trials for {} in {} tasks",
            config.n_trials, config.name, plan.n_tasks
        );
        if plan.n_tasks == 0 {
            return Err(SubmitError::config(
                &config.name,
                format!(
                    "{} trials is fewer than the {} trials each cluster task runs",
                    config.n_trials, plan.trials_per_task
                ),
            ));
        }

        // Every task runs the stored configuration, so it must ask for one task's worth.
        let mut task_config = config.clone();
        task_config.n_trials = plan.trials_per_task;
        let config_path = write_analysis_config(self.pool.layout(), &task_config)?;

        let text = render_script(&self.script);
        info!("Creating submission script at {}", self.script_path.display());
        write_script(&config.name, &self.script_path, &text)?;
        debug!("Submission script:\n{}", text);

        let args = submit_args(&plan, &self.script_path, &config_path, self.script.cores);
        debug!("Ram per core: {}", self.script.ram_per_core);
        info!(
            "{}: {}",
            Local::now().format("%a %b %e %H:%M:%S %Y"),
            render_command("submit", &args)
        );

        let response = self.scheduler.submit(&args).await?;
        info!("{}", response.trim());

        let job_id = job_id_from_submit_response(&response).ok_or_else(|| SubmitError::JobIdParse {
            name: config.name.clone(),
            response: response.clone(),
        })?;
        info!("Submitted {} as job {}", config.name, job_id);
        self.job_id = Some(job_id);
        Ok(())
    }

    async fn wait_for_job(&mut self) -> Result<()> {
        let job_id = self.job_id.ok_or(SubmitError::NoJob)?;
        wait_for_job(self.scheduler.as_ref(), job_id, &self.schedule).await
    }

    async fn wait_for_cluster(&self, job_ids: &[JobId]) -> Result<()> {
        wait_for_all_cluster_jobs(self.scheduler.as_ref(), job_ids, &self.schedule).await
    }
}
