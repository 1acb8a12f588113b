//! Configuration file handling.
//!
//! This module handles loading and merging tool settings from
//! `.trialrunner.toml` files. The analysis configuration itself is a
//! separate JSON document, see [`crate::models::AnalysisConfig`].

use crate::backend::poller::PollSchedule;
use crate::models::EstimationMethod;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name looked up in the current directory.
pub const SETTINGS_FILE: &str = ".trialrunner.toml";

/// Root settings structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Local worker pool settings.
    #[serde(default)]
    pub local: LocalConfig,

    /// Batch cluster settings.
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Scale estimation settings.
    #[serde(default)]
    pub estimation: EstimationConfig,

    /// External trial engine settings.
    #[serde(default)]
    pub engine: EngineConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Root directory for serialized configurations and trial artifacts.
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,

    /// Where cluster task logs are copied. Defaults to `<storage_root>/logs`.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Host identity used to pick a backend.
    #[serde(default)]
    pub host: Option<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            storage_root: default_storage_root(),
            log_dir: None,
            host: None,
        }
    }
}

impl GeneralConfig {
    pub fn effective_log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| self.storage_root.join("logs"))
    }
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("trialrunner_data")
}

/// Local worker pool settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Requested worker count. Defaults to host cores minus one.
    #[serde(default)]
    pub n_cpu: Option<usize>,
}

/// Batch cluster settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Batch submission program.
    #[serde(default = "default_submit_program")]
    pub submit_program: String,

    /// Queue status program.
    #[serde(default = "default_status_program")]
    pub status_program: String,

    /// User whose queue is inspected. Defaults to `$USER`.
    #[serde(default)]
    pub username: Option<String>,

    /// Where the generated submission script is written.
    /// Defaults to `<storage_root>/cluster/SubmitJob.sh`.
    #[serde(default)]
    pub script_path: Option<PathBuf>,

    /// Interpreter line of the generated script.
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Extra lines run before the trial entry point (environment setup).
    #[serde(default)]
    pub setup_lines: Vec<String>,

    /// Wall-clock limit per task.
    #[serde(default = "default_h_cpu")]
    pub h_cpu: String,

    /// Trials each cluster task performs.
    #[serde(default = "default_trials_per_task")]
    pub trials_per_task: u64,

    /// Cores per task. Defaults to the local CPU count.
    #[serde(default)]
    pub cluster_cpu: Option<usize>,

    /// Memory per core, e.g. `"4.0G"`. Defaults to `6/cores + 2` GiB.
    #[serde(default)]
    pub ram_per_core: Option<String>,

    /// Zero-based whitespace field holding the job id in status output.
    #[serde(default = "default_id_column")]
    pub id_column: usize,

    /// Delay before the first queue query.
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: u64,

    /// Delay between queue queries.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// How often to log the task summary.
    #[serde(default = "default_summary_every")]
    pub summary_every_secs: u64,

    /// How often to log the raw queue table.
    #[serde(default = "default_table_every")]
    pub table_every_secs: u64,

    /// Give up waiting after this long. Unbounded when unset.
    #[serde(default)]
    pub max_wait_secs: Option<u64>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            submit_program: default_submit_program(),
            status_program: default_status_program(),
            username: None,
            script_path: None,
            shell: default_shell(),
            setup_lines: Vec::new(),
            h_cpu: default_h_cpu(),
            trials_per_task: default_trials_per_task(),
            cluster_cpu: None,
            ram_per_core: None,
            id_column: default_id_column(),
            initial_delay_secs: default_initial_delay(),
            poll_interval_secs: default_poll_interval(),
            summary_every_secs: default_summary_every(),
            table_every_secs: default_table_every(),
            max_wait_secs: None,
        }
    }
}

fn default_submit_program() -> String {
    "qsub".to_string()
}

fn default_status_program() -> String {
    "qstat".to_string()
}

fn default_shell() -> String {
    "/bin/zsh".to_string()
}

fn default_h_cpu() -> String {
    "23:59:00".to_string()
}

fn default_trials_per_task() -> u64 {
    1
}

fn default_id_column() -> usize {
    2
}

fn default_initial_delay() -> u64 {
    10
}

fn default_poll_interval() -> u64 {
    30
}

fn default_summary_every() -> u64 {
    240
}

fn default_table_every() -> u64 {
    480
}

impl ClusterConfig {
    /// The queue owner, falling back to the login environment.
    pub fn user(&self) -> String {
        if let Some(ref user) = self.username {
            return user.clone();
        }
        std::env::var("USER")
            .ok()
            .or_else(|| {
                std::env::var("HOME").ok().and_then(|home| {
                    Path::new(&home)
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                })
            })
            .unwrap_or_else(|| "unknown".to_string())
    }

    pub fn effective_script_path(&self, storage_root: &Path) -> PathBuf {
        self.script_path
            .clone()
            .unwrap_or_else(|| storage_root.join("cluster").join("SubmitJob.sh"))
    }

    pub fn poll_schedule(&self) -> PollSchedule {
        PollSchedule {
            initial_delay: Duration::from_secs(self.initial_delay_secs),
            interval: Duration::from_secs(self.poll_interval_secs),
            summary_every: Duration::from_secs(self.summary_every_secs),
            table_every: Duration::from_secs(self.table_every_secs),
            max_wait: self.max_wait_secs.map(Duration::from_secs),
        }
    }
}

/// Scale estimation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EstimationConfig {
    /// Methods run before submission, in order.
    #[serde(default)]
    pub methods: Vec<EstimationMethod>,

    /// Cap on quick-injection rounds. 0 disables the cap.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Trials per quick-injection round.
    #[serde(default = "default_quick_trials")]
    pub quick_trials: u64,
}

impl Default for EstimationConfig {
    fn default() -> Self {
        Self {
            methods: Vec::new(),
            max_iterations: default_max_iterations(),
            quick_trials: default_quick_trials(),
        }
    }
}

impl EstimationConfig {
    /// The round cap for the estimator, `None` when uncapped.
    pub fn iteration_cap(&self) -> Option<usize> {
        (self.max_iterations > 0).then_some(self.max_iterations)
    }
}

fn default_max_iterations() -> usize {
    25
}

fn default_quick_trials() -> u64 {
    10
}

/// External trial engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Trial entry point. Invoked as `<program> <args..> -f <config> -n <cores>`.
    #[serde(default = "default_engine_program")]
    pub program: String,

    /// Leading arguments for the entry point.
    #[serde(default)]
    pub args: Vec<String>,

    /// Results aggregator. Invoked as `<program> <args..> -f <config> --estimate-scale`.
    #[serde(default = "default_aggregator_program")]
    pub aggregator_program: String,

    /// Leading arguments for the aggregator.
    #[serde(default)]
    pub aggregator_args: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: default_engine_program(),
            args: Vec::new(),
            aggregator_program: default_aggregator_program(),
            aggregator_args: Vec::new(),
        }
    }
}

fn default_engine_program() -> String {
    "trialrunner-worker".to_string()
}

fn default_aggregator_program() -> String {
    "trialrunner-results".to_string()
}

impl Settings {
    /// Load settings from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {}", path.display()))?;

        let settings: Settings = toml::from_str(&content)
            .with_context(|| format!("Failed to parse settings file: {}", path.display()))?;

        Ok(settings)
    }

    /// Try to load settings from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(SETTINGS_FILE);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge these settings with CLI arguments.
    ///
    /// CLI arguments take precedence, but only when they were given.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(ref host) = args.host {
            self.general.host = Some(host.clone());
        }
        if let Some(ref root) = args.storage_root {
            self.general.storage_root = root.clone();
        }
        if let Some(n_cpu) = args.n_cpu {
            self.local.n_cpu = Some(n_cpu);
        }
        if let Some(ref methods) = args.estimate {
            self.estimation.methods = methods.clone();
        }
        if let Some(max_iterations) = args.max_iterations {
            self.estimation.max_iterations = max_iterations;
        }
        if let Some(trials_per_task) = args.trials_per_task {
            self.cluster.trials_per_task = trials_per_task;
        }
    }

    /// Generate the default settings file content.
    pub fn default_toml() -> String {
        let settings = Settings::default();
        toml::to_string_pretty(&settings).unwrap_or_else(|_| String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.cluster.submit_program, "qsub");
        assert_eq!(settings.cluster.h_cpu, "23:59:00");
        assert_eq!(settings.cluster.trials_per_task, 1);
        assert_eq!(settings.estimation.max_iterations, 25);
        assert_eq!(settings.estimation.iteration_cap(), Some(25));
        assert_eq!(settings.estimation.quick_trials, 10);
        assert!(settings.estimation.methods.is_empty());
    }

    #[test]
    fn test_parse_settings() {
        let toml_content = r#"
[general]
storage_root = "/scratch/fs"
host = "sge"

[local]
n_cpu = 8

[cluster]
trials_per_task = 50
cluster_cpu = 4
setup_lines = ["export FOO=1"]
max_wait_secs = 86400

[estimation]
methods = ["asimov", "quick-injections"]
max_iterations = 10
"#;

        let settings: Settings = toml::from_str(toml_content).unwrap();
        assert_eq!(settings.general.storage_root, PathBuf::from("/scratch/fs"));
        assert_eq!(settings.general.host.as_deref(), Some("sge"));
        assert_eq!(settings.local.n_cpu, Some(8));
        assert_eq!(settings.cluster.trials_per_task, 50);
        assert_eq!(settings.cluster.cluster_cpu, Some(4));
        assert_eq!(settings.cluster.status_program, "qstat");
        assert_eq!(
            settings.estimation.methods,
            vec![EstimationMethod::Asimov, EstimationMethod::QuickInjections]
        );
        assert_eq!(settings.estimation.iteration_cap(), Some(10));
        assert_eq!(
            settings.cluster.poll_schedule().max_wait,
            Some(Duration::from_secs(86400))
        );
    }

    #[test]
    fn test_zero_max_iterations_disables_the_cap() {
        let settings: Settings = toml::from_str("[estimation]\nmax_iterations = 0\n").unwrap();
        assert_eq!(settings.estimation.max_iterations, 0);
        assert_eq!(settings.estimation.iteration_cap(), None);
    }

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Settings::default_toml();
        assert!(toml_str.contains("[general]"));
        assert!(toml_str.contains("[cluster]"));
        assert!(toml_str.contains("[estimation]"));

        let back: Settings = toml::from_str(&toml_str).unwrap();
        assert_eq!(back.cluster.poll_interval_secs, 30);
    }

    #[test]
    fn test_derived_paths() {
        let settings = Settings::default();
        let root = Path::new("/data");
        assert_eq!(
            settings.cluster.effective_script_path(root),
            PathBuf::from("/data/cluster/SubmitJob.sh")
        );
        assert_eq!(
            settings.general.effective_log_dir(),
            PathBuf::from("trialrunner_data/logs")
        );
    }
}
