//! Job lifecycle controller.
//!
//! [`Controller`] is the caller-facing side: it validates jobs, hands them
//! to the control loop task and reads the snapshots that task publishes.
//! The control loop owns the remote channel and every job's state; nothing
//! else ever touches them.

mod control_loop;
mod handle;
mod state;

#[cfg(test)]
mod tests;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::info;

use crate::channel::{self, resolve_path, run_with_retry, RemoteChannel};
use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use crate::models::{Job, JobOpts, StatusReport};
use crate::scheduler::SchedulerDialect;
use crate::wrapper::shell_quote;

use control_loop::ControlLoop;
use state::TrackedJob;

pub use handle::{JobHandle, JobOutcome};

/// Requests from callers to the control loop.
#[derive(Debug)]
pub(crate) enum Command {
    Submit(Vec<TrackedJob>),
    Cancel(String),
    Forget(oneshot::Sender<usize>),
    Shutdown(oneshot::Sender<()>),
}

/// What the control loop publishes after every pass.
#[derive(Debug, Clone, Default)]
pub(crate) struct Published {
    report: StatusReport,
    /// Jobs the loop has taken in so far.
    received: u64,
}

/// Submits jobs to a cluster scheduler and tracks them to completion.
///
/// # Example
///
/// ```rust,no_run
/// use jobsubmit::{ConnectionTarget, Controller, ControllerConfig, JobOpts};
///
/// #[tokio::main]
/// async fn main() -> jobsubmit::Result<()> {
///     let target: ConnectionTarget = "sge://alice@head.example.org".parse()?;
///     let config = ControllerConfig::new(target).with_concurrent_job_limit(Some(100));
///     let controller = Controller::open(config).await?;
///
///     let opts = JobOpts::builder("sweep").nproc(4).mem("8G").build()?;
///     let handles = controller.submit(["python run.py 1", "python run.py 2"], &opts, None)?;
///     for handle in handles {
///         let outcome = handle.await?.into_result()?;
///         println!("{}: {}", outcome.job_id, outcome.stdout.trim());
///     }
///     controller.shutdown().await
/// }
/// ```
#[derive(Debug)]
pub struct Controller {
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<Published>,
    task: Mutex<Option<JoinHandle<()>>>,
    job_ids: Mutex<HashSet<String>>,
    sent: AtomicU64,
    log_dir: String,
    default_delay: Duration,
}

impl Controller {
    /// Connect through the channel the configured target calls for.
    pub async fn open(config: ControllerConfig) -> Result<Self> {
        let channel = channel::for_target(&config.target, config.command_timeout);
        Self::connect(config, channel).await
    }

    /// Open `channel`, prepare the log directory and start the control loop.
    pub async fn connect(
        config: ControllerConfig,
        channel: Box<dyn RemoteChannel>,
    ) -> Result<Self> {
        let dialect = config.target.scheduler.dialect();
        Self::connect_with(config, channel, dialect).await
    }

    /// Like [`connect`](Self::connect), with an explicit scheduler dialect.
    pub async fn connect_with(
        config: ControllerConfig,
        mut channel: Box<dyn RemoteChannel>,
        dialect: Box<dyn SchedulerDialect>,
    ) -> Result<Self> {
        config.validate()?;
        channel.open().await?;

        let log_root = resolve_path(channel.as_mut(), &config.log_root).await?;
        let log_dir = format!("{}/{}", log_root.trim_end_matches('/'), config.namespace);
        let mkdir = format!("mkdir -p {}", shell_quote(&log_dir));
        let output = run_with_retry(channel.as_mut(), &mkdir).await?;
        if !output.success() {
            return Err(Error::connection(
                channel.target(),
                format!("cannot create log directory {log_dir}: {}", output.error_message()),
            ));
        }
        info!(remote = %config.target, log_dir = %log_dir, "Connected");

        let default_delay = config.submit_delay;
        let (commands, receiver) = mpsc::unbounded_channel();
        let (publish, snapshots) = watch::channel(Published::default());
        let control = ControlLoop::new(channel, dialect, config, receiver, publish);
        let task = tokio::spawn(control.run());

        Ok(Self {
            commands,
            snapshots,
            task: Mutex::new(Some(task)),
            job_ids: Mutex::new(HashSet::new()),
            sent: AtomicU64::new(0),
            log_dir,
            default_delay,
        })
    }

    /// Directory holding this session's logs and scripts.
    pub fn log_dir(&self) -> &str {
        &self.log_dir
    }

    /// Queue one job per command and return their futures in input order.
    ///
    /// A single command runs under `opts.job_id()`; several run as
    /// `<job_id>-<index>`. `delay` overrides the configured spacing
    /// between submissions.
    pub fn submit<I, S>(
        &self,
        commands: I,
        opts: &JobOpts,
        delay: Option<Duration>,
    ) -> Result<Vec<JobHandle>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let commands: Vec<String> = commands.into_iter().map(Into::into).collect();
        let named = if commands.len() == 1 {
            vec![(opts.job_id().to_string(), commands.into_iter().next().unwrap_or_default())]
        } else {
            commands
                .into_iter()
                .enumerate()
                .map(|(i, command)| (format!("{}-{i}", opts.job_id()), command))
                .collect()
        };
        self.submit_named(named, opts, delay)
    }

    /// Queue jobs with explicit `(job_id, command)` pairs.
    pub fn submit_named<I, K, C>(
        &self,
        jobs: I,
        opts: &JobOpts,
        delay: Option<Duration>,
    ) -> Result<Vec<JobHandle>>
    where
        I: IntoIterator<Item = (K, C)>,
        K: Into<String>,
        C: Into<String>,
    {
        let delay = delay.unwrap_or(self.default_delay);

        let mut prepared = Vec::new();
        let mut batch_ids = HashSet::new();
        for (job_id, command) in jobs {
            let job_opts = opts.with_job_id(job_id)?;
            let command: String = command.into();
            if command.trim().is_empty() {
                return Err(Error::validation(format!(
                    "job {} has an empty command",
                    job_opts.job_id()
                )));
            }
            if !batch_ids.insert(job_opts.job_id().to_string()) {
                return Err(Error::validation(format!(
                    "job id {} appears twice in one submission",
                    job_opts.job_id()
                )));
            }
            prepared.push((job_opts, command));
        }
        if prepared.is_empty() {
            return Ok(Vec::new());
        }

        {
            let mut known = self
                .job_ids
                .lock()
                .map_err(|_| Error::validation("job id registry is poisoned"))?;
            if let Some(dup) = batch_ids.iter().find(|id| known.contains(*id)) {
                return Err(Error::validation(format!(
                    "job id {dup} was already used in this session"
                )));
            }
            known.extend(batch_ids);
        }

        let weak = self.commands.downgrade();
        let mut handles = Vec::with_capacity(prepared.len());
        let mut tracked = Vec::with_capacity(prepared.len());
        for (job_opts, command) in prepared {
            let (tx, rx) = oneshot::channel();
            let job = Job::new(job_opts, command, &self.log_dir);
            handles.push(JobHandle::new(job.job_id().to_string(), rx, weak.clone()));
            tracked.push(TrackedJob::new(job, delay, tx));
        }

        let count = tracked.len() as u64;
        self.sent.fetch_add(count, Ordering::SeqCst);
        self.commands
            .send(Command::Submit(tracked))
            .map_err(|_| Error::ControllerClosed)?;
        Ok(handles)
    }

    /// Jobs submitted to or running on the scheduler, as of the last pass.
    pub fn num_running_jobs(&self) -> usize {
        self.snapshots.borrow().report.num_running()
    }

    /// Snapshot of every job, as of the last pass.
    pub fn job_status(&self) -> StatusReport {
        self.snapshots.borrow().report.clone()
    }

    /// Wait until every job handed to this controller is terminal.
    pub async fn wait_all(&self) -> Result<StatusReport> {
        let sent = self.sent.load(Ordering::SeqCst);
        let mut snapshots = self.snapshots.clone();
        let published = snapshots
            .wait_for(|p| p.received >= sent && p.report.is_settled())
            .await
            .map_err(|_| Error::ControllerClosed)?;
        Ok(published.report.clone())
    }

    /// Drop finished jobs from the bookkeeping; returns how many were dropped.
    ///
    /// Their ids stay reserved for the rest of the session.
    pub async fn forget_finished(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Forget(tx))
            .map_err(|_| Error::ControllerClosed)?;
        rx.await.map_err(|_| Error::ControllerClosed)
    }

    /// Stop the control loop and close the channel.
    ///
    /// Futures of unfinished jobs resolve with [`Error::ControllerClosed`].
    /// Jobs already on the scheduler keep running.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            task.await
                .map_err(|e| Error::Io(std::io::Error::other(e.to_string())))?;
        }
        Ok(())
    }
}
