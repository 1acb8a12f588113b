//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use crate::models::EstimationMethod;
use clap::Parser;
use std::path::PathBuf;

/// trialrunner - run likelihood trials locally or on a batch cluster
///
/// Takes a JSON analysis configuration, optionally estimates a sensible
/// injection scale first, and runs its trials on a local worker pool or
/// submits them as a Grid Engine job array.
///
/// Examples:
///   trialrunner analyses/tde.json
///   trialrunner analyses/tde.json --estimate asimov --discovery
///   trialrunner analyses/tde.json --host sge --cluster --wait
///   trialrunner analyses/tde.json --cluster --dry-run
///   trialrunner --clean analyses/tde/
///   trialrunner --host sge --wait-for-cluster
///   trialrunner --init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Analysis configuration (JSON)
    ///
    /// Not required with --init-config, --clean or --wait-for-cluster.
    #[arg(value_name = "ANALYSIS")]
    pub analysis: Option<PathBuf>,

    /// Path to settings file
    ///
    /// If not specified, looks for .trialrunner.toml in the current directory
    #[arg(short, long, value_name = "FILE", env = "TRIALRUNNER_SETTINGS")]
    pub settings: Option<PathBuf>,

    /// Host identity used to pick a backend
    ///
    /// Unknown or missing hosts fall back to the local backend.
    #[arg(long, value_name = "HOST", env = "TRIALRUNNER_HOST")]
    pub host: Option<String>,

    /// Backend to use, by name
    ///
    /// Unlike --host there is no fallback: an unknown name is an error.
    #[arg(short, long, value_name = "NAME", conflicts_with = "host")]
    pub backend: Option<String>,

    /// Root directory for configurations and trial artifacts
    #[arg(long, value_name = "DIR")]
    pub storage_root: Option<PathBuf>,

    /// Submit to the cluster instead of running locally
    #[arg(long)]
    pub cluster: bool,

    /// Local CPUs to use (defaults to all cores but one)
    #[arg(short, long, value_name = "NUM")]
    pub n_cpu: Option<usize>,

    /// Trials each cluster task performs
    #[arg(long, value_name = "NUM")]
    pub trials_per_task: Option<u64>,

    /// Scale estimation methods to run before submitting (comma-separated)
    ///
    /// Example: --estimate asimov,quick-injections
    #[arg(short, long, value_name = "METHODS", value_delimiter = ',')]
    pub estimate: Option<Vec<EstimationMethod>>,

    /// Scale the run for discovery instead of sensitivity
    #[arg(short, long)]
    pub discovery: bool,

    /// Delete old results of the run before submitting
    #[arg(long)]
    pub remove_old_results: bool,

    /// Block until the cluster job has finished
    #[arg(short, long)]
    pub wait: bool,

    /// Cap on quick-injection rounds (0 for no cap)
    #[arg(long, value_name = "NUM")]
    pub max_iterations: Option<usize>,

    /// Write a JSON run summary to this file ("-" for stdout)
    #[arg(long, value_name = "FILE")]
    pub summary: Option<PathBuf>,

    /// Show what would be submitted without running anything
    #[arg(long)]
    pub dry_run: bool,

    /// Remove the artifacts of a run and exit
    #[arg(long, value_name = "NAME")]
    pub clean: Option<String>,

    /// Wait for cluster jobs to finish and exit
    ///
    /// Waits for --job-ids if given, otherwise for every job the user has queued.
    #[arg(long)]
    pub wait_for_cluster: bool,

    /// Job ids for --wait-for-cluster (comma-separated)
    #[arg(long, value_name = "IDS", value_delimiter = ',', requires = "wait_for_cluster")]
    pub job_ids: Vec<u64>,

    /// Enable verbose logging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long)]
    pub quiet: bool,

    /// Generate a default .trialrunner.toml settings file
    #[arg(long)]
    pub init_config: bool,
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Whether this invocation analyses a configuration, as opposed to a
    /// standalone maintenance action.
    pub fn runs_analysis(&self) -> bool {
        !self.init_config && self.clean.is_none() && !self.wait_for_cluster
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        // Skip validation for --init-config
        if self.init_config {
            return Ok(());
        }

        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        if self.clean.is_some() && self.wait_for_cluster {
            return Err("Cannot use both --clean and --wait-for-cluster".to_string());
        }

        if let Some(ref name) = self.clean {
            if name.trim().is_empty() {
                return Err("Run name for --clean must not be empty".to_string());
            }
        }

        if let Some(0) = self.n_cpu {
            return Err("CPU count must be at least 1".to_string());
        }

        if let Some(0) = self.trials_per_task {
            return Err("Trials per task must be at least 1".to_string());
        }

        if !self.runs_analysis() {
            return Ok(());
        }

        let analysis = match self.analysis {
            Some(ref path) => path,
            None => return Err("An analysis configuration file is required".to_string()),
        };

        if !analysis.is_file() {
            return Err(format!(
                "Analysis configuration does not exist: {}",
                analysis.display()
            ));
        }

        if self.wait && !self.cluster {
            return Err("--wait only applies to cluster submissions (add --cluster)".to_string());
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn make_args(analysis: Option<PathBuf>) -> Args {
        Args {
            analysis,
            settings: None,
            host: None,
            backend: None,
            storage_root: None,
            cluster: false,
            n_cpu: None,
            trials_per_task: None,
            estimate: None,
            discovery: false,
            remove_old_results: false,
            wait: false,
            max_iterations: None,
            summary: None,
            dry_run: false,
            clean: None,
            wait_for_cluster: false,
            job_ids: Vec::new(),
            verbose: false,
            quiet: false,
            init_config: false,
        }
    }

    #[test]
    fn test_parse_estimation_methods() {
        let args = Args::try_parse_from([
            "trialrunner",
            "tde.json",
            "--estimate",
            "asimov,quick-injections",
            "--discovery",
        ])
        .unwrap();
        assert_eq!(
            args.estimate,
            Some(vec![EstimationMethod::Asimov, EstimationMethod::QuickInjections])
        );
        assert!(args.discovery);
        assert_eq!(args.analysis, Some(PathBuf::from("tde.json")));
    }

    #[test]
    fn test_parse_job_ids() {
        let args =
            Args::try_parse_from(["trialrunner", "--wait-for-cluster", "--job-ids", "4242,17"])
                .unwrap();
        assert_eq!(args.job_ids, vec![4242, 17]);
        assert!(!args.runs_analysis());
    }

    #[test]
    fn test_job_ids_need_wait_for_cluster() {
        assert!(Args::try_parse_from(["trialrunner", "--job-ids", "1"]).is_err());
    }

    #[test]
    fn test_host_and_backend_conflict() {
        assert!(
            Args::try_parse_from(["trialrunner", "x.json", "--host", "sge", "--backend", "sge"])
                .is_err()
        );
    }

    #[test]
    fn test_validation_requires_analysis() {
        let args = make_args(None);
        assert!(args.validate().is_err());

        let mut args = make_args(None);
        args.clean = Some("tde".to_string());
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_validation_missing_file() {
        let args = make_args(Some(PathBuf::from("/nonexistent/analysis.json")));
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_validation_existing_file() {
        let file = NamedTempFile::new().unwrap();
        let mut args = make_args(Some(file.path().to_path_buf()));
        assert!(args.validate().is_ok());

        args.wait = true;
        assert!(args.validate().is_err());
        args.cluster = true;
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_validation_conflicting_options() {
        let mut args = make_args(None);
        args.clean = Some("tde".to_string());
        args.verbose = true;
        args.quiet = true;
        assert!(args.validate().is_err());

        let mut args = make_args(None);
        args.clean = Some("tde".to_string());
        args.wait_for_cluster = true;
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_validation_zero_counts() {
        let mut args = make_args(None);
        args.clean = Some("tde".to_string());
        args.n_cpu = Some(0);
        assert!(args.validate().is_err());

        args.n_cpu = None;
        args.trials_per_task = Some(0);
        assert!(args.validate().is_err());

        args.trials_per_task = None;
        args.max_iterations = Some(0);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_log_level() {
        let mut args = make_args(None);
        assert_eq!(args.log_level(), tracing::Level::INFO);

        args.verbose = true;
        assert_eq!(args.log_level(), tracing::Level::DEBUG);

        args.verbose = false;
        args.quiet = true;
        assert_eq!(args.log_level(), tracing::Level::ERROR);
    }
}
