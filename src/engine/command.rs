//! Collaborators backed by external executables.

use super::{ResultsAggregator, TrialEngine, TrialTask};
use crate::config::EngineConfig;
use crate::models::{AnalysisConfig, ScaleGuess};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::debug;

/// Runs trials by invoking the configured entry point.
///
/// Workers are invoked as
/// `<program> <args..> -f <config> -n 1 --trials <k> --worker <i>`.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    program: String,
    args: Vec<String>,
}

impl CommandEngine {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.program.clone(), config.args.clone())
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}

#[async_trait]
impl TrialEngine for CommandEngine {
    async fn run_trials(&self, task: &TrialTask) -> Result<()> {
        let mut cmd = self.command();
        cmd.arg("-f")
            .arg(&task.config_path)
            .arg("-n")
            .arg("1")
            .arg("--trials")
            .arg(task.trials.to_string())
            .arg("--worker")
            .arg(task.worker.to_string());

        run_to_stdout(cmd, &self.program).await?;
        Ok(())
    }

    async fn guess_scale(&self, config: &AnalysisConfig) -> Result<f64> {
        // The guess must see the configuration as given, not a stored copy.
        let mut file = NamedTempFile::new().context("Failed to create temporary config file")?;
        serde_json::to_writer(&mut file, config)?;
        file.flush()?;

        let mut cmd = self.command();
        cmd.arg("--guess-scale").arg("-f").arg(file.path());

        let stdout = run_to_stdout(cmd, &self.program).await?;
        parse_scale(&stdout)
    }
}

/// Reads rough scale estimates from an aggregator executable.
///
/// Invoked as `<program> <args..> -f <config> --estimate-scale`; the last
/// line of stdout must be `{"sensitivity": .., "discovery": ..}`.
#[derive(Debug, Clone)]
pub struct CommandAggregator {
    program: String,
    args: Vec<String>,
}

impl CommandAggregator {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.aggregator_program.clone(),
            config.aggregator_args.clone(),
        )
    }
}

#[async_trait]
impl ResultsAggregator for CommandAggregator {
    async fn estimate_scale(
        &self,
        config: &AnalysisConfig,
        config_path: &Path,
    ) -> Result<ScaleGuess> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("-f")
            .arg(config_path)
            .arg("--estimate-scale");

        debug!("Estimating scale for {} from {}", config.name, config_path.display());
        let stdout = run_to_stdout(cmd, &self.program).await?;
        parse_scale_guess(&stdout)
    }
}

async fn run_to_stdout(mut cmd: Command, program: &str) -> Result<String> {
    let output = cmd
        .output()
        .await
        .with_context(|| format!("Failed to start {}", program))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("{} exited with {}: {}", program, output.status, stderr.trim());
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

fn last_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).filter(|l| !l.is_empty()).last()
}

fn parse_scale(stdout: &str) -> Result<f64> {
    let line = last_line(stdout).context("Scale guess produced no output")?;
    let scale = line
        .parse::<f64>()
        .with_context(|| format!("Scale guess output is not a number: {:?}", line))?;
    if !scale.is_finite() {
        bail!("Scale guess output is not finite: {:?}", line);
    }
    Ok(scale)
}

fn parse_scale_guess(stdout: &str) -> Result<ScaleGuess> {
    let line = last_line(stdout).context("Aggregator produced no output")?;
    serde_json::from_str(line)
        .with_context(|| format!("Aggregator output is not a scale estimate: {:?}", line))
}
