//! Per-job futures and their results.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};

use super::Command;
use crate::error::{Error, FailureReason, Result};
use crate::models::JobState;

/// Final record of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobOutcome {
    pub job_id: String,
    pub scheduler_id: Option<String>,
    /// Where the job ran, for error messages.
    pub target: String,
    /// `Done`, `Failed` or `Lost`.
    pub status: JobState,
    /// Content of the final stdout log; empty when none was produced.
    pub stdout: String,
    /// Content of the final stderr log, sentinel included.
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobOutcome {
    pub fn is_done(&self) -> bool {
        self.status == JobState::Done
    }

    /// `Ok` for finished jobs, the matching error otherwise.
    pub fn into_result(self) -> Result<Self> {
        let reason = match (self.status, self.failure.clone()) {
            (JobState::Done, _) => return Ok(self),
            (_, Some(FailureReason::Submission(message))) => {
                return Err(Error::Submission {
                    job_id: self.job_id,
                    message,
                })
            }
            (_, Some(FailureReason::Connection(message))) => {
                return Err(Error::Connection {
                    target: self.target,
                    message,
                })
            }
            (_, reason) => reason.unwrap_or(FailureReason::MissingSentinel),
        };
        if self.status == JobState::Lost {
            Err(Error::JobLost {
                job_id: self.job_id,
                reason,
            })
        } else {
            Err(Error::JobFailed {
                job_id: self.job_id,
                reason,
            })
        }
    }

    /// Decode stdout as JSON, for jobs that report structured results.
    pub fn stdout_json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_str(self.stdout.trim())
    }
}

/// Future of one submitted job.
///
/// Resolves once the controller has observed the job's terminal state.
/// Resolves to [`Error::ControllerClosed`] if the controller shut down
/// first.
#[derive(Debug)]
pub struct JobHandle {
    job_id: String,
    receiver: oneshot::Receiver<JobOutcome>,
    outcome: Option<JobOutcome>,
    commands: mpsc::WeakUnboundedSender<Command>,
}

impl JobHandle {
    pub(super) fn new(
        job_id: String,
        receiver: oneshot::Receiver<JobOutcome>,
        commands: mpsc::WeakUnboundedSender<Command>,
    ) -> Self {
        Self {
            job_id,
            receiver,
            outcome: None,
            commands,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// The outcome, if the job has already finished. Never waits.
    pub fn try_outcome(&mut self) -> Option<&JobOutcome> {
        if self.outcome.is_none() {
            if let Ok(outcome) = self.receiver.try_recv() {
                self.outcome = Some(outcome);
            }
        }
        self.outcome.as_ref()
    }

    /// Ask the controller to cancel this job.
    ///
    /// A job not yet submitted is dropped without contacting the
    /// scheduler; a submitted one is deleted from the scheduler queue.
    pub fn cancel(&self) -> Result<()> {
        let commands = self.commands.upgrade().ok_or(Error::ControllerClosed)?;
        commands
            .send(Command::Cancel(self.job_id.clone()))
            .map_err(|_| Error::ControllerClosed)
    }
}

impl Future for JobHandle {
    type Output = Result<JobOutcome>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(ref outcome) = this.outcome {
            return Poll::Ready(Ok(outcome.clone()));
        }
        match Pin::new(&mut this.receiver).poll(cx) {
            Poll::Ready(Ok(outcome)) => {
                this.outcome = Some(outcome.clone());
                Poll::Ready(Ok(outcome))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::ControllerClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}
