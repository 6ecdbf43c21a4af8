//! The task that owns the channel and drives every job.
//!
//! Each pass polls the scheduler when a poll is due, admits queued jobs
//! while there is room under the concurrency limit, then publishes a
//! snapshot and sleeps until the next deadline or caller command.

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use super::state::{Bookkeeping, TrackedJob};
use super::{Command, Published};
use crate::channel::{run_with_retry, RemoteChannel};
use crate::config::ControllerConfig;
use crate::error::FailureReason;
use crate::models::JobState;
use crate::scheduler::{QueueState, SchedulerDialect};
use crate::wrapper::{self, LogReport};

pub(super) struct ControlLoop {
    channel: Box<dyn RemoteChannel>,
    dialect: Box<dyn SchedulerDialect>,
    config: ControllerConfig,
    target: String,
    jobs: Bookkeeping,
    commands: mpsc::UnboundedReceiver<Command>,
    publish: watch::Sender<Published>,
    received: u64,
    last_submission: Option<Instant>,
    next_poll: Instant,
    poll_failures: u32,
}

impl ControlLoop {
    pub(super) fn new(
        channel: Box<dyn RemoteChannel>,
        dialect: Box<dyn SchedulerDialect>,
        config: ControllerConfig,
        commands: mpsc::UnboundedReceiver<Command>,
        publish: watch::Sender<Published>,
    ) -> Self {
        let next_poll = Instant::now() + config.poll_interval;
        Self {
            target: config.target.to_string(),
            channel,
            dialect,
            config,
            jobs: Bookkeeping::default(),
            commands,
            publish,
            received: 0,
            last_submission: None,
            next_poll,
            poll_failures: 0,
        }
    }

    pub(super) async fn run(mut self) {
        info!(remote = %self.target, scheduler = self.dialect.name(), "Control loop started");
        let mut shutdown_reply = None;

        loop {
            if Instant::now() >= self.next_poll {
                self.poll().await;
            }
            self.admit().await;
            self.publish_snapshot();

            let wake = self.next_wake();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Submit(jobs)) => self.accept(jobs),
                    Some(Command::Cancel(job_id)) => self.cancel(&job_id).await,
                    Some(Command::Forget(reply)) => {
                        let _ = reply.send(self.jobs.forget_finished());
                    }
                    Some(Command::Shutdown(reply)) => {
                        shutdown_reply = Some(reply);
                        break;
                    }
                    None => break,
                },
                () = sleep_until_opt(wake) => {}
            }
        }

        self.close(shutdown_reply).await;
    }

    fn accept(&mut self, jobs: Vec<TrackedJob>) {
        for job in jobs {
            info!(job_id = job.job.job_id(), "Job queued for submission");
            self.received += 1;
            self.jobs.push(job);
        }
    }

    fn has_capacity(&self) -> bool {
        self.config
            .concurrent_job_limit
            .is_none_or(|limit| self.jobs.num_running() < limit)
    }

    /// When the next pending job may be submitted, ignoring capacity.
    fn next_admission(&mut self) -> Option<Instant> {
        let last = self.last_submission;
        let pending = self.jobs.next_pending()?;
        let paced = last.map(|t| t + pending.delay);
        match (paced, pending.not_before) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => Some(a.or(b).unwrap_or_else(Instant::now)),
        }
    }

    fn next_wake(&mut self) -> Option<Instant> {
        let poll = (!self.jobs.tracked_ids().is_empty()).then_some(self.next_poll);
        let admission = if self.has_capacity() {
            self.next_admission()
        } else {
            None
        };
        match (poll, admission) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Submit queued jobs, oldest first, while the limit and pacing allow.
    async fn admit(&mut self) {
        while self.has_capacity() {
            match self.next_admission() {
                Some(at) if at <= Instant::now() => self.submit_next().await,
                _ => break,
            }
        }
    }

    async fn submit_next(&mut self) {
        let target = self.target.clone();
        let retries = self.config.submit_retries;
        let backoff = self.config.submit_backoff;
        let Some(tracked) = self.jobs.next_pending() else {
            return;
        };

        tracked.attempts += 1;
        let job_id = tracked.job.job_id().to_string();
        let line = wrapper::submit_command_line(&tracked.job, self.dialect.as_ref());
        debug!(job_id = %job_id, attempt = tracked.attempts, "Submitting job");

        let result = run_with_retry(self.channel.as_mut(), &line).await;
        self.last_submission = Some(Instant::now());

        let Some(tracked) = self.jobs.get_mut(&job_id) else {
            return;
        };
        let message = match result {
            Ok(output) if output.success() => {
                match self.dialect.parse_job_id(&output.stdout_str()) {
                    Some(scheduler_id) => {
                        info!(job_id = %job_id, scheduler_id = %scheduler_id, "Job submitted");
                        tracked.job.mark_submitted(scheduler_id);
                        return;
                    }
                    None => format!(
                        "no job id in scheduler reply {:?}",
                        output.stdout_str().trim()
                    ),
                }
            }
            Ok(output) => output.error_message(),
            Err(err) => {
                warn!(job_id = %job_id, error = %err, "Submission lost the connection");
                tracked.finish(
                    JobState::Failed,
                    Some(FailureReason::Connection(err.to_string())),
                    &target,
                );
                return;
            }
        };

        if tracked.attempts > retries {
            warn!(
                job_id = %job_id,
                attempts = tracked.attempts,
                error = %message,
                "Giving up on submission"
            );
            tracked.finish(
                JobState::Failed,
                Some(FailureReason::Submission(message)),
                &target,
            );
        } else {
            let wait = retry_backoff(backoff, tracked.attempts);
            warn!(
                job_id = %job_id,
                attempt = tracked.attempts,
                retry_in_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                error = %message,
                "Submission rejected, will retry"
            );
            tracked.not_before = Some(Instant::now() + wait);
        }
    }

    async fn poll(&mut self) {
        self.next_poll = Instant::now() + self.config.poll_interval;
        let ids = self.jobs.tracked_ids();
        if ids.is_empty() {
            return;
        }

        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let command = self.dialect.status_command(&id_refs);
        let failure = match run_with_retry(self.channel.as_mut(), &command).await {
            Ok(output) if output.success() => {
                self.poll_failures = 0;
                let states = self.dialect.parse_status(&output.stdout_str(), &id_refs);
                self.apply(states).await;
                return;
            }
            Ok(output) => output.error_message(),
            Err(err) => err.to_string(),
        };

        self.poll_failures += 1;
        warn!(
            failures = self.poll_failures,
            limit = self.config.poll_failure_limit,
            error = %failure,
            "Status poll failed"
        );
        if self.poll_failures >= self.config.poll_failure_limit {
            self.fail_outstanding(&failure);
        }
    }

    fn fail_outstanding(&mut self, message: &str) {
        let target = self.target.clone();
        for tracked in self.jobs.iter_mut() {
            if !tracked.job.state.is_terminal() {
                tracked.finish(
                    JobState::Failed,
                    Some(FailureReason::Connection(message.to_string())),
                    &target,
                );
            }
        }
        self.poll_failures = 0;
    }

    async fn apply(&mut self, states: HashMap<String, QueueState>) {
        for (scheduler_id, state) in states {
            let Some(tracked) = self.jobs.by_scheduler_id(&scheduler_id) else {
                continue;
            };
            match state {
                QueueState::Queued => {
                    tracked.absent_since = None;
                    tracked.job.state = JobState::Submitted;
                }
                QueueState::Running => {
                    tracked.absent_since = None;
                    if tracked.job.state != JobState::Running {
                        info!(
                            job_id = tracked.job.job_id(),
                            scheduler_id = %scheduler_id,
                            "Job running"
                        );
                        tracked.job.state = JobState::Running;
                    }
                }
                QueueState::Errored => self.reject(&scheduler_id).await,
                QueueState::Absent => self.settle(&scheduler_id).await,
            }
        }
    }

    /// Inspect the logs of a job the scheduler no longer lists.
    ///
    /// The grace period starts at the first poll that misses the job, so a
    /// job whose logs cannot be read still resolves once it runs out.
    async fn settle(&mut self, scheduler_id: &str) {
        let target = self.target.clone();
        let grace = self.config.lost_grace_period;
        let Some(tracked) = self.jobs.by_scheduler_id(scheduler_id) else {
            return;
        };
        let job_id = tracked.job.job_id().to_string();
        let command = wrapper::inspect_command(&tracked.job.paths);
        let now = Instant::now();
        let absent_since = *tracked.absent_since.get_or_insert(now);
        let grace_over = now.duration_since(absent_since) >= grace;

        let inspected = match run_with_retry(self.channel.as_mut(), &command).await {
            Ok(output) => wrapper::parse_log_report(&output.stdout).ok_or_else(|| {
                let head: String = output.stdout_str().chars().take(80).collect();
                format!("unexpected reply {:?}", head.trim())
            }),
            Err(err) => Err(err.to_string()),
        };
        let Some(tracked) = self.jobs.by_scheduler_id(scheduler_id) else {
            return;
        };

        let (state, failure) = match inspected {
            Ok(LogReport::Final { stdout, stderr }) => {
                let verdict = wrapper::verdict(&stderr);
                tracked.stdout = stdout;
                tracked.stderr = stderr;
                match verdict {
                    Ok(()) => (JobState::Done, None),
                    Err(_) if tracked.cancel_requested => {
                        (JobState::Failed, Some(FailureReason::Cancelled))
                    }
                    Err(reason) => (JobState::Failed, Some(reason)),
                }
            }
            _ if tracked.cancel_requested => (JobState::Failed, Some(FailureReason::Cancelled)),
            Ok(LogReport::Partial) if grace_over => {
                (JobState::Failed, Some(FailureReason::LogsNotPromoted))
            }
            Ok(LogReport::Missing) if grace_over => (JobState::Lost, Some(FailureReason::Vanished)),
            Err(detail) if grace_over => {
                (JobState::Lost, Some(FailureReason::LogsUnreadable(detail)))
            }
            Err(detail) => {
                warn!(job_id = %job_id, error = %detail, "Could not inspect logs");
                return;
            }
            Ok(_) => {
                debug!(job_id = %job_id, "Job left the queue, waiting for logs");
                return;
            }
        };

        match &failure {
            None => info!(job_id = %job_id, scheduler_id, "Job done"),
            Some(reason) => {
                warn!(
                    job_id = %job_id,
                    scheduler_id,
                    state = %state,
                    reason = %reason,
                    "Job finished unsuccessfully"
                );
            }
        }
        tracked.finish(state, failure, &target);
    }

    /// Delete a job the scheduler holds in an error state and fail it.
    async fn reject(&mut self, scheduler_id: &str) {
        let target = self.target.clone();
        let Some(tracked) = self.jobs.by_scheduler_id(scheduler_id) else {
            return;
        };
        let job_id = tracked.job.job_id().to_string();
        warn!(job_id = %job_id, scheduler_id, "Scheduler reports an error state, deleting job");

        let command = self.dialect.cancel_command(scheduler_id);
        match run_with_retry(self.channel.as_mut(), &command).await {
            Ok(output) if output.success() => {}
            Ok(output) => {
                let error = output.error_message();
                warn!(job_id = %job_id, error = %error, "Scheduler refused deletion");
            }
            Err(err) => warn!(job_id = %job_id, error = %err, "Deletion failed"),
        }

        let Some(tracked) = self.jobs.by_scheduler_id(scheduler_id) else {
            return;
        };
        let reason = if tracked.cancel_requested {
            FailureReason::Cancelled
        } else {
            FailureReason::SchedulerError
        };
        tracked.finish(JobState::Failed, Some(reason), &target);
    }

    async fn cancel(&mut self, job_id: &str) {
        let target = self.target.clone();
        let Some(tracked) = self.jobs.get_mut(job_id) else {
            return;
        };
        let state = tracked.job.state;
        match state {
            JobState::PendingSubmit => {
                info!(job_id, "Cancelled before submission");
                tracked.finish(JobState::Failed, Some(FailureReason::Cancelled), &target);
            }
            JobState::Submitted | JobState::Running => {
                tracked.cancel_requested = true;
                let Some(scheduler_id) = tracked.job.scheduler_id().map(str::to_string) else {
                    return;
                };
                info!(job_id, scheduler_id = %scheduler_id, "Cancelling job");
                let command = self.dialect.cancel_command(&scheduler_id);
                match run_with_retry(self.channel.as_mut(), &command).await {
                    Ok(output) if output.success() => {}
                    Ok(output) => {
                        let error = output.error_message();
                        warn!(job_id, error = %error, "Scheduler refused cancellation");
                    }
                    Err(err) => warn!(job_id, error = %err, "Cancellation failed"),
                }
            }
            JobState::Done | JobState::Failed | JobState::Lost => {}
        }
    }

    fn publish_snapshot(&self) {
        let snapshot = Published {
            report: self.jobs.report(),
            received: self.received,
        };
        self.publish.send_replace(snapshot);
    }

    async fn close(mut self, reply: Option<oneshot::Sender<()>>) {
        self.publish_snapshot();
        if let Err(err) = self.channel.close().await {
            warn!(remote = %self.target, error = %err, "Failed to close channel");
        }
        info!(remote = %self.target, "Control loop stopped");
        // Dropping the bookkeeping resolves unfinished futures with ControllerClosed.
        drop(self.jobs);
        if let Some(reply) = reply {
            let _ = reply.send(());
        }
    }
}

/// `backoff * 2^(attempt-1)` plus up to 10% jitter.
fn retry_backoff(backoff: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let base = backoff.saturating_mul(1 << exponent);
    let jitter = base.mul_f64(rand::rng().random_range(0.0..0.1));
    base + jitter
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
