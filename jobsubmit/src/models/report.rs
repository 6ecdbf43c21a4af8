//! Point-in-time status reports over the controller's bookkeeping.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::FailureReason;

use super::{Job, JobState};

/// One job as seen by the most recent control-loop pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatusRow {
    pub job_id: String,
    pub scheduler_id: Option<String>,
    pub status: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    pub command: String,
    pub stdout_path: String,
    pub stderr_path: String,
    pub submitted_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Stdout of a finished job, when it is a JSON document.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl From<&Job> for JobStatusRow {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.job_id().to_string(),
            scheduler_id: job.scheduler_id().map(str::to_string),
            status: job.state,
            failure: job.failure.clone(),
            command: job.command.clone(),
            stdout_path: job.paths.stdout.clone(),
            stderr_path: job.paths.stderr.clone(),
            submitted_at: job.submitted_at,
            finished_at: job.finished_at,
            result: None,
        }
    }
}

/// Snapshot of every job the controller still knows about, in submission order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub jobs: Vec<JobStatusRow>,
}

impl StatusReport {
    /// Tally of jobs per state.
    pub fn counts(&self) -> BTreeMap<JobState, usize> {
        let mut counts = BTreeMap::new();
        for row in &self.jobs {
            *counts.entry(row.status).or_insert(0) += 1;
        }
        counts
    }

    /// Jobs currently submitted to or running on the scheduler.
    pub fn num_running(&self) -> usize {
        self.jobs
            .iter()
            .filter(|row| row.status.is_scheduler_tracked())
            .count()
    }

    /// Whether every job has reached a terminal state.
    pub fn is_settled(&self) -> bool {
        self.jobs.iter().all(|row| row.status.is_terminal())
    }

    pub fn get(&self, job_id: &str) -> Option<&JobStatusRow> {
        self.jobs.iter().find(|row| row.job_id == job_id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
