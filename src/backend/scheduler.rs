//! Batch scheduler commands and parsing of their free-form replies.
//!
//! Only two shapes of text come back from the scheduler: the reply to a
//! submission, which embeds the job-array id, and the queue table. Both
//! parsers are plain functions so they can be fed recorded output.

use crate::config::ClusterConfig;
use crate::error::{Result, SubmitError};
use crate::models::JobId;
use async_trait::async_trait;
use std::collections::BTreeSet;
use tokio::process::Command;
use tracing::debug;

/// Runs submission and status commands against a batch scheduler.
#[async_trait]
pub trait SchedulerClient: Send + Sync {
    /// Submit with the given arguments and return the scheduler's reply.
    async fn submit(&self, args: &[String]) -> Result<String>;

    /// Queue table for the owning user, optionally running tasks only.
    async fn status(&self, running_only: bool) -> Result<String>;

    /// Whitespace field of a table row that holds the job id.
    fn id_column(&self) -> usize {
        2
    }
}

/// `qsub`/`qstat` style scheduler driven through child processes.
#[derive(Debug, Clone)]
pub struct GridEngineCommands {
    submit_program: String,
    status_program: String,
    user: String,
    id_column: usize,
}

impl GridEngineCommands {
    pub fn from_config(config: &ClusterConfig) -> Self {
        Self {
            submit_program: config.submit_program.clone(),
            status_program: config.status_program.clone(),
            user: config.user(),
            id_column: config.id_column,
        }
    }

    fn status_args(&self, running_only: bool) -> Vec<String> {
        let mut args = vec!["-u".to_string(), self.user.clone()];
        if running_only {
            args.push("-s".to_string());
            args.push("r".to_string());
        }
        args
    }
}

#[async_trait]
impl SchedulerClient for GridEngineCommands {
    async fn submit(&self, args: &[String]) -> Result<String> {
        run_command(&self.submit_program, args).await
    }

    async fn status(&self, running_only: bool) -> Result<String> {
        run_command(&self.status_program, &self.status_args(running_only)).await
    }

    fn id_column(&self) -> usize {
        self.id_column
    }
}

async fn run_command(program: &str, args: &[String]) -> Result<String> {
    let rendered = render_command(program, args);
    debug!("Running {}", rendered);

    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| SubmitError::Scheduler {
            command: rendered.clone(),
            reason: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(SubmitError::Scheduler {
            command: rendered,
            reason: format!(
                "{}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Render a command line for logs and error messages.
pub fn render_command(program: &str, args: &[String]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// Extract the job-array id from a submission reply.
///
/// Grid Engine answers `Your job-array 4242.1-10:1 ("SubmitJob.sh") has been submitted`;
/// the id is the integer between `job-array` and the first `.`.
pub fn job_id_from_submit_response(response: &str) -> Option<JobId> {
    let (_, rest) = response.split_once("job-array")?;
    let id = rest.split('.').next()?.trim();
    id.parse().ok().map(JobId)
}

/// One job id per queue-table row, in row order (array tasks repeat ids).
///
/// The first two lines are headers and the last line is a footer. Empty
/// output means nothing is queued and yields no rows.
pub fn job_ids_in_table(text: &str, id_column: usize) -> Result<Vec<JobId>> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let lines: Vec<&str> = text.split('\n').collect();
    if lines.len() < 3 {
        return Ok(Vec::new());
    }

    lines[2..lines.len() - 1]
        .iter()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            line.split_whitespace()
                .nth(id_column)
                .and_then(|field| field.parse().ok())
                .map(JobId)
                .ok_or_else(|| SubmitError::StatusParse {
                    line: line.to_string(),
                })
        })
        .collect()
}

/// Distinct job ids in a queue table.
pub fn list_job_ids(text: &str, id_column: usize) -> Result<BTreeSet<JobId>> {
    Ok(job_ids_in_table(text, id_column)?.into_iter().collect())
}

/// Number of queue rows belonging to one job.
pub fn count_tasks(text: &str, id_column: usize, job_id: JobId) -> Result<usize> {
    Ok(job_ids_in_table(text, id_column)?
        .into_iter()
        .filter(|id| *id == job_id)
        .count())
}

/// Distinct job ids currently queued for the scheduler's user.
pub async fn queued_job_ids(client: &dyn SchedulerClient) -> Result<BTreeSet<JobId>> {
    let table = client.status(false).await?;
    list_job_ids(&table, client.id_column())
}
