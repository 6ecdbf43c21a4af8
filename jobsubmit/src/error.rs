//! Error taxonomy for the job submitter.

use std::fmt;

use thiserror::Error;

/// Why a job ended in a failed or lost terminal state.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// The wrapper trapped a non-zero exit and wrote the `ERROR!` sentinel.
    CommandFailed,
    /// Final logs exist but carry no success sentinel.
    MissingSentinel,
    /// Only temporary logs were found after the grace period.
    LogsNotPromoted,
    /// The scheduler no longer lists the job and no logs appeared.
    Vanished,
    /// The logs could not be read back before the grace period ran out.
    LogsUnreadable(String),
    /// The scheduler held the job in an error state; it was deleted.
    SchedulerError,
    /// The caller cancelled the job.
    Cancelled,
    /// The scheduler rejected every submission attempt.
    Submission(String),
    /// The remote channel was unusable.
    Connection(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CommandFailed => write!(f, "command exited with a non-zero status"),
            Self::MissingSentinel => write!(f, "logs are final but carry no completion sentinel"),
            Self::LogsNotPromoted => {
                write!(f, "logs were never promoted to their final names (crash or I/O error)")
            }
            Self::Vanished => write!(f, "job left the scheduler queue without producing logs"),
            Self::LogsUnreadable(msg) => write!(f, "logs could not be read: {msg}"),
            Self::SchedulerError => write!(f, "scheduler put the job in an error state"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Submission(msg) => write!(f, "submission failed: {msg}"),
            Self::Connection(msg) => write!(f, "connection failed: {msg}"),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid job options: {0}")]
    Validation(String),

    #[error("Connection to {target} failed: {message}")]
    Connection { target: String, message: String },

    #[error("Scheduler rejected job {job_id}: {message}")]
    Submission { job_id: String, message: String },

    #[error("Job {job_id} failed: {reason}")]
    JobFailed { job_id: String, reason: FailureReason },

    #[error("Job {job_id} was lost: {reason}")]
    JobLost { job_id: String, reason: FailureReason },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Controller is no longer running")]
    ControllerClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub(crate) fn connection(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            target: target.into(),
            message: message.into(),
        }
    }

    /// Whether a retry of the same remote call may succeed.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
