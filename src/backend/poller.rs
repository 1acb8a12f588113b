//! Blocking wait for a submitted job array to leave the queue.
//!
//! The log cadence is a small state machine advanced once per poll, so it
//! does not depend on how long each sleep actually took.

use super::scheduler::{count_tasks, queued_job_ids, SchedulerClient};
use crate::error::{Result, SubmitError};
use crate::models::JobId;
use chrono::Local;
use std::time::{Duration, Instant};
use tracing::info;

/// Timing of the poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    /// Delay before the first query.
    pub initial_delay: Duration,
    /// Delay between queries.
    pub interval: Duration,
    /// How often the task summary is logged.
    pub summary_every: Duration,
    /// How often the raw queue table is logged.
    pub table_every: Duration,
    /// Optional deadline; `None` waits forever.
    pub max_wait: Option<Duration>,
}

impl Default for PollSchedule {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(10),
            interval: Duration::from_secs(30),
            summary_every: Duration::from_secs(240),
            table_every: Duration::from_secs(480),
            max_wait: None,
        }
    }
}

impl PollSchedule {
    /// No delays at all.
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            interval: Duration::ZERO,
            summary_every: Duration::ZERO,
            table_every: Duration::ZERO,
            max_wait: None,
        }
    }

    fn ticks(&self, every: Duration) -> u32 {
        if self.interval.is_zero() {
            return 1;
        }
        let ticks = every.as_secs_f64() / self.interval.as_secs_f64();
        (ticks.ceil() as u32).max(1)
    }
}

/// What to log on a poll tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TickActions {
    pub log_summary: bool,
    pub log_table: bool,
}

/// Counters deciding when each log is due.
///
/// The summary fires on the first tick. The table first fires one summary
/// period later, then every `table_every`.
#[derive(Debug, Clone)]
pub struct PollState {
    summary_every: u32,
    table_every: u32,
    since_summary: u32,
    since_table: u32,
    ticks: u64,
}

impl PollState {
    pub fn new(schedule: &PollSchedule) -> Self {
        let summary_every = schedule.ticks(schedule.summary_every);
        let table_every = schedule.ticks(schedule.table_every);
        Self {
            summary_every,
            table_every,
            since_summary: summary_every,
            since_table: table_every.saturating_sub(summary_every),
            ticks: 0,
        }
    }

    /// Advance one poll and report which logs are due.
    pub fn tick(&mut self) -> TickActions {
        self.ticks += 1;

        let log_summary = self.since_summary >= self.summary_every;
        if log_summary {
            self.since_summary = 0;
        }
        let log_table = self.since_table >= self.table_every;
        if log_table {
            self.since_table = 0;
        }

        self.since_summary += 1;
        self.since_table += 1;

        TickActions {
            log_summary,
            log_table,
        }
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}

/// Block until no task of `job_id` is left in the queue.
pub async fn wait_for_job(
    client: &dyn SchedulerClient,
    job_id: JobId,
    schedule: &PollSchedule,
) -> Result<()> {
    let started = Instant::now();
    let column = client.id_column();
    tokio::time::sleep(schedule.initial_delay).await;

    let mut state = PollState::new(schedule);
    loop {
        let table = client.status(false).await?;
        let outstanding = count_tasks(&table, column, job_id)?;
        if outstanding == 0 {
            info!(
                "Job {} finished after {} polls ({:.0}s)",
                job_id,
                state.ticks(),
                started.elapsed().as_secs_f64()
            );
            return Ok(());
        }

        let actions = state.tick();
        if actions.log_summary {
            let running = count_tasks(&client.status(true).await?, column, job_id)?;
            info!(
                "{} - Job {}: {} entries in queue. Of these, {} are running tasks, and {} are tasks still waiting to be executed.",
                Local::now().format("%a %b %e %H:%M:%S %Y"),
                job_id,
                outstanding,
                running,
                outstanding.saturating_sub(running)
            );
        }
        if actions.log_table {
            info!("{}", table);
        }

        if let Some(max_wait) = schedule.max_wait {
            let waited = started.elapsed();
            if waited >= max_wait {
                return Err(SubmitError::WaitTimeout {
                    job_id: job_id.0,
                    outstanding,
                    waited,
                });
            }
        }

        tokio::time::sleep(schedule.interval).await;
    }
}

/// Wait for each job in turn. With no ids, wait for everything the user has queued.
pub async fn wait_for_all_cluster_jobs(
    client: &dyn SchedulerClient,
    job_ids: &[JobId],
    schedule: &PollSchedule,
) -> Result<()> {
    let ids: Vec<JobId> = if job_ids.is_empty() {
        queued_job_ids(client).await?.into_iter().collect()
    } else {
        job_ids.to_vec()
    };

    for id in ids {
        info!("Waiting for job {}", id);
        wait_for_job(client, id, schedule).await?;
    }
    Ok(())
}
