//! Job model: one command submitted to the cluster scheduler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::FailureReason;

use super::JobOpts;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Queued locally, not yet accepted by the scheduler.
    PendingSubmit,
    /// Accepted by the scheduler; waiting in its queue.
    Submitted,
    /// The scheduler reports the job as executing.
    Running,
    /// Finished and the success sentinel was found.
    Done,
    /// Finished with an error, or could not be submitted.
    Failed,
    /// Left the scheduler without leaving any logs behind.
    Lost,
}

impl JobState {
    /// Convert state to its report string.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PendingSubmit => "pending_submit",
            Self::Submitted => "submitted",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Lost => "lost",
        }
    }

    /// Parse state from its report string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending_submit" | "pending" => Some(Self::PendingSubmit),
            "submitted" | "queued" => Some(Self::Submitted),
            "running" => Some(Self::Running),
            "done" | "completed" => Some(Self::Done),
            "failed" | "error" => Some(Self::Failed),
            "lost" | "missing" => Some(Self::Lost),
            _ => None,
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Lost)
    }

    /// Counted against the concurrent job limit.
    pub const fn is_scheduler_tracked(self) -> bool {
        matches!(self, Self::Submitted | Self::Running)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Remote file locations belonging to one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPaths {
    /// Final stdout log.
    pub stdout: String,
    /// Final stderr log; its appearance marks completion.
    pub stderr: String,
    /// Generated job script.
    pub script: String,
}

impl LogPaths {
    /// Paths for `job_id` inside the session log directory.
    pub fn for_job(log_dir: &str, job_id: &str) -> Self {
        let dir = log_dir.trim_end_matches('/');
        Self {
            stdout: format!("{dir}/{job_id}.out"),
            stderr: format!("{dir}/{job_id}.err"),
            script: format!("{dir}/{job_id}.sh"),
        }
    }

    pub fn stdout_tmp(&self) -> String {
        format!("{}.tmp", self.stdout)
    }

    pub fn stderr_tmp(&self) -> String {
        format!("{}.tmp", self.stderr)
    }
}

/// A job tracked by the controller.
#[derive(Debug, Clone)]
pub struct Job {
    /// Scheduler-assigned id, set exactly once on submission.
    scheduler_id: Option<String>,
    /// Options, including the session-unique job id.
    pub opts: JobOpts,
    /// Shell command line to execute.
    pub command: String,
    /// Current state.
    pub state: JobState,
    /// Where the wrapper writes logs.
    pub paths: LogPaths,
    /// When the job was handed to the controller.
    pub created_at: DateTime<Utc>,
    /// When the scheduler accepted the job.
    pub submitted_at: Option<DateTime<Utc>>,
    /// When a terminal state was observed.
    pub finished_at: Option<DateTime<Utc>>,
    /// Why the job failed or was lost.
    pub failure: Option<FailureReason>,
}

impl Job {
    /// Create a job waiting for submission.
    pub fn new(opts: JobOpts, command: String, log_dir: &str) -> Self {
        let paths = LogPaths::for_job(log_dir, opts.job_id());
        Self {
            scheduler_id: None,
            opts,
            command,
            state: JobState::PendingSubmit,
            paths,
            created_at: Utc::now(),
            submitted_at: None,
            finished_at: None,
            failure: None,
        }
    }

    /// Session-unique job id.
    pub fn job_id(&self) -> &str {
        self.opts.job_id()
    }

    pub fn scheduler_id(&self) -> Option<&str> {
        self.scheduler_id.as_deref()
    }

    /// Record acceptance by the scheduler.
    ///
    /// Returns `false` and leaves the job untouched if an id was already
    /// assigned.
    pub fn mark_submitted(&mut self, scheduler_id: String) -> bool {
        if self.scheduler_id.is_some() {
            return false;
        }
        self.scheduler_id = Some(scheduler_id);
        self.state = JobState::Submitted;
        self.submitted_at = Some(Utc::now());
        true
    }

    /// Move to a terminal state. Terminal states are final.
    pub fn finish(&mut self, state: JobState, failure: Option<FailureReason>) {
        debug_assert!(state.is_terminal());
        if self.state.is_terminal() {
            return;
        }
        self.state = state;
        self.failure = failure;
        self.finished_at = Some(Utc::now());
    }
}
