//! Error types for job submission and scale estimation.

use std::time::Duration;
use thiserror::Error;

/// Result type alias used by the submission layer.
pub type Result<T> = std::result::Result<T, SubmitError>;

/// Failures surfaced by backends, the poller and the scale estimator.
#[derive(Error, Debug)]
pub enum SubmitError {
    /// The analysis configuration cannot be run the way it was requested.
    #[error("configuration error for run '{name}': {reason}")]
    Config { name: String, reason: String },

    /// An execution mode was requested by name and nothing is registered for it.
    #[error("no backend registered for '{requested}' (known: {known})")]
    UnknownBackend { requested: String, known: String },

    /// The backend has no implementation for this operation.
    #[error("the {backend} backend does not support {operation}")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },

    /// The scheduler accepted the command but its reply carried no job id.
    #[error("could not parse a job id for run '{name}' from scheduler response: {response:?}")]
    JobIdParse { name: String, response: String },

    /// A scheduler command could not be run or exited unsuccessfully.
    #[error("scheduler command `{command}` failed: {reason}")]
    Scheduler { command: String, reason: String },

    /// A line of scheduler status output did not carry an integer job id.
    #[error("could not parse scheduler status line {line:?}")]
    StatusParse { line: String },

    /// One or more local workers failed; all failures are reported together.
    #[error("{failed} of {total} local workers failed for run '{name}': {details}")]
    Workers {
        name: String,
        failed: usize,
        total: usize,
        details: String,
    },

    /// The empirical scale search hit its iteration cap.
    #[error("scale estimation for run '{name}' did not converge after {iterations} iterations (last guess {last_guess})")]
    NoConvergence {
        name: String,
        iterations: usize,
        last_guess: f64,
    },

    /// Waiting was requested before anything was submitted.
    #[error("no cluster job has been submitted by this backend")]
    NoJob,

    /// The poll deadline passed while tasks were still queued.
    #[error("job {job_id} still had {outstanding} queued tasks after {waited:?}")]
    WaitTimeout {
        job_id: u64,
        outstanding: usize,
        waited: Duration,
    },

    /// The trial engine or results aggregator failed.
    #[error("{operation} failed for run '{name}': {source:#}")]
    Engine {
        name: String,
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// Reading or writing a run's files failed.
    #[error("{operation} failed for run '{name}': {source}")]
    Storage {
        name: String,
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SubmitError {
    pub fn config(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Adapter for `map_err` on filesystem results of a named run.
    pub fn storage<'a, E>(name: &'a str, operation: &'static str) -> impl FnOnce(E) -> Self + 'a
    where
        E: Into<std::io::Error>,
    {
        move |source| Self::Storage {
            name: name.to_string(),
            operation,
            source: source.into(),
        }
    }

    pub fn engine(name: impl Into<String>, operation: &'static str, source: anyhow::Error) -> Self {
        Self::Engine {
            name: name.into(),
            operation,
            source,
        }
    }
}
