//! Job bookkeeping owned by the control loop.

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use super::handle::JobOutcome;
use crate::error::FailureReason;
use crate::models::{Job, JobState, JobStatusRow, StatusReport};

/// A job plus everything the control loop needs to drive it.
#[derive(Debug)]
pub(crate) struct TrackedJob {
    pub job: Job,
    /// Minimum spacing between the previous submission and this one.
    pub delay: Duration,
    /// Submission attempts made so far.
    pub attempts: u32,
    /// Earliest moment of the next submission attempt.
    pub not_before: Option<Instant>,
    /// First poll at which the scheduler no longer listed the job.
    pub absent_since: Option<Instant>,
    pub cancel_requested: bool,
    pub stdout: String,
    pub stderr: String,
    resolver: Option<oneshot::Sender<JobOutcome>>,
}

impl TrackedJob {
    pub fn new(job: Job, delay: Duration, resolver: oneshot::Sender<JobOutcome>) -> Self {
        Self {
            job,
            delay,
            attempts: 0,
            not_before: None,
            absent_since: None,
            cancel_requested: false,
            stdout: String::new(),
            stderr: String::new(),
            resolver: Some(resolver),
        }
    }

    fn outcome(&self, target: &str) -> JobOutcome {
        JobOutcome {
            job_id: self.job.job_id().to_string(),
            scheduler_id: self.job.scheduler_id().map(str::to_string),
            target: target.to_string(),
            status: self.job.state,
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
            failure: self.job.failure.clone(),
            submitted_at: self.job.submitted_at,
            finished_at: self.job.finished_at,
        }
    }

    /// Report row; finished jobs that printed JSON carry it as their result.
    fn status_row(&self) -> JobStatusRow {
        let mut row = JobStatusRow::from(&self.job);
        if self.job.state == JobState::Done {
            row.result = serde_json::from_str(self.stdout.trim()).ok();
        }
        row
    }

    /// Move to a terminal state and resolve the job's future.
    pub fn finish(&mut self, state: JobState, failure: Option<FailureReason>, target: &str) {
        self.job.finish(state, failure);
        if let Some(resolver) = self.resolver.take() {
            // The caller may have dropped the handle; the outcome stays in
            // the bookkeeping either way.
            let _ = resolver.send(self.outcome(target));
        }
    }
}

/// Every job the controller knows about, in submission order.
#[derive(Debug, Default)]
pub(crate) struct Bookkeeping {
    jobs: Vec<TrackedJob>,
}

impl Bookkeeping {
    pub fn push(&mut self, job: TrackedJob) {
        self.jobs.push(job);
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut TrackedJob> {
        self.jobs.iter_mut()
    }

    pub fn get_mut(&mut self, job_id: &str) -> Option<&mut TrackedJob> {
        self.jobs.iter_mut().find(|t| t.job.job_id() == job_id)
    }

    /// Jobs counted against the concurrency limit.
    pub fn num_running(&self) -> usize {
        self.jobs
            .iter()
            .filter(|t| t.job.state.is_scheduler_tracked())
            .count()
    }

    /// Oldest job still waiting for submission.
    pub fn next_pending(&mut self) -> Option<&mut TrackedJob> {
        self.jobs
            .iter_mut()
            .find(|t| t.job.state == JobState::PendingSubmit)
    }

    /// Scheduler ids of every submitted or running job.
    pub fn tracked_ids(&self) -> Vec<String> {
        self.jobs
            .iter()
            .filter(|t| t.job.state.is_scheduler_tracked())
            .filter_map(|t| t.job.scheduler_id().map(str::to_string))
            .collect()
    }

    pub fn by_scheduler_id(&mut self, scheduler_id: &str) -> Option<&mut TrackedJob> {
        self.jobs
            .iter_mut()
            .find(|t| t.job.scheduler_id() == Some(scheduler_id))
    }

    /// Drop jobs in a terminal state; returns how many were dropped.
    pub fn forget_finished(&mut self) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|t| !t.job.state.is_terminal());
        before - self.jobs.len()
    }

    pub fn report(&self) -> StatusReport {
        StatusReport {
            jobs: self.jobs.iter().map(TrackedJob::status_row).collect(),
        }
    }
}
