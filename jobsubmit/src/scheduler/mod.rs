//! Scheduler command-line dialects.
//!
//! Each dialect knows how to phrase submit, status and cancel requests for
//! one batch system, and how to read back what that system prints. The
//! controller never looks at scheduler output directly.

mod local;
mod pbs;
mod sge;
mod slurm;

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::models::Job;

pub use local::LocalDialect;
pub use pbs::PbsDialect;
pub use sge::SgeDialect;
pub use slurm::SlurmDialect;

/// Where the scheduler says a job is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueState {
    /// Waiting, held, or otherwise not yet executing.
    Queued,
    /// Executing (including suspended and completing).
    Running,
    /// Held in an error state the scheduler will not leave on its own.
    Errored,
    /// No longer listed.
    Absent,
}

/// Command-line contract of one batch scheduler.
pub trait SchedulerDialect: Send + Sync + fmt::Debug {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Command line that submits the script at `job.paths.script`.
    ///
    /// `work_dir` is the directory the job should start in.
    fn submit_command(&self, job: &Job, work_dir: &str) -> String;

    /// Extract the scheduler-assigned id from the submit command's stdout.
    fn parse_job_id(&self, stdout: &str) -> Option<String>;

    /// Command line whose output [`parse_status`](Self::parse_status) understands.
    fn status_command(&self, scheduler_ids: &[&str]) -> String;

    /// State of every id in `scheduler_ids`; unlisted ids map to
    /// [`QueueState::Absent`].
    fn parse_status(&self, stdout: &str, scheduler_ids: &[&str]) -> HashMap<String, QueueState>;

    /// Command line that removes a job from the scheduler.
    fn cancel_command(&self, scheduler_id: &str) -> String;
}

/// Supported schedulers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerKind {
    Sge,
    Pbs,
    Slurm,
    Local,
}

impl SchedulerKind {
    /// Convert to the URL scheme used in connection targets.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sge => "sge",
            Self::Pbs => "pbs",
            Self::Slurm => "slurm",
            Self::Local => "local",
        }
    }

    /// Parse from a URL scheme. `torque` is accepted for PBS.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sge" => Some(Self::Sge),
            "pbs" | "torque" => Some(Self::Pbs),
            "slurm" => Some(Self::Slurm),
            "local" => Some(Self::Local),
            _ => None,
        }
    }

    /// Instantiate the dialect for this scheduler.
    pub fn dialect(self) -> Box<dyn SchedulerDialect> {
        match self {
            Self::Sge => Box::new(SgeDialect),
            Self::Pbs => Box::new(PbsDialect),
            Self::Slurm => Box::new(SlurmDialect),
            Self::Local => Box::new(LocalDialect),
        }
    }
}

impl fmt::Display for SchedulerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// First token of the first non-empty line, the usual shape of a terse
/// submit reply.
fn first_token(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .and_then(|line| line.split_whitespace().next())
        .map(str::to_string)
}

/// Resolve every requested id against a listing of `(id, state)` pairs.
///
/// `same` decides whether a listed id refers to a requested one.
fn resolve<F>(
    listing: &[(String, QueueState)],
    scheduler_ids: &[&str],
    same: F,
) -> HashMap<String, QueueState>
where
    F: Fn(&str, &str) -> bool,
{
    scheduler_ids
        .iter()
        .map(|id| {
            let state = listing
                .iter()
                .find(|(listed, _)| same(listed, id))
                .map_or(QueueState::Absent, |(_, state)| *state);
            ((*id).to_string(), state)
        })
        .collect()
}
