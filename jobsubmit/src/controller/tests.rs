use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{timeout, Instant};

use super::*;
use crate::channel::CommandOutput;
use crate::config::ConnectionTarget;
use crate::error::FailureReason;
use crate::models::JobState;
use crate::scheduler::QueueState;
use crate::wrapper::LOG_BOUNDARY;

const PATIENCE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
enum FakeLogs {
    Final { stdout: String, stderr: String },
    Partial,
}

#[derive(Debug)]
struct FakeJob {
    scheduler_id: String,
    command: String,
    stderr_path: String,
    polls_left: u32,
    listed: Option<QueueState>,
    logs: Option<FakeLogs>,
}

impl FakeJob {
    /// Leave the queue and write whatever logs the command would leave.
    fn complete(&mut self) {
        self.listed = None;
        self.logs = match self.command.as_str() {
            "vanish" => None,
            "crash" => Some(FakeLogs::Partial),
            cmd if cmd.starts_with("fail") => Some(FakeLogs::Final {
                stdout: String::new(),
                stderr: "Traceback\nERROR!\n".into(),
            }),
            cmd => Some(FakeLogs::Final {
                stdout: cmd
                    .strip_prefix("echo ")
                    .map(|s| format!("{s}\n"))
                    .unwrap_or_default(),
                stderr: "DONE!\n".into(),
            }),
        };
    }
}

/// A scheduler and head node in memory. Commands are recognised by the
/// fixed strings the fake dialect emits.
#[derive(Debug, Default)]
struct FakeCluster {
    refuse_connection: bool,
    reject_submissions: u32,
    fail_status: bool,
    garble_inspect: bool,
    polls_to_finish: u32,
    commands: Vec<String>,
    scripts: HashMap<String, (String, String)>,
    jobs: Vec<FakeJob>,
    submissions: Vec<(String, Instant)>,
    cancels: Vec<String>,
    max_listed: usize,
}

type Shared = Arc<Mutex<FakeCluster>>;

fn reply(exit_code: i32, stdout: impl Into<String>, stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code,
        stdout: stdout.into().into_bytes(),
        stderr: stderr.as_bytes().to_vec(),
    }
}

impl FakeCluster {
    fn run(&mut self, line: &str) -> Result<CommandOutput> {
        self.commands.push(line.to_string());

        if let Some(rest) = line.split("FAKE_SUBMIT ").nth(1) {
            let job_id = rest.split_whitespace().next().unwrap_or_default().to_string();
            return Ok(self.submit(job_id));
        }
        if line == "FAKE_STATUS" {
            return Ok(self.status());
        }
        if let Some(id) = line.strip_prefix("FAKE_CANCEL ") {
            self.cancels.push(id.to_string());
            if let Some(job) = self.jobs.iter_mut().find(|j| j.scheduler_id == id) {
                job.listed = None;
                job.logs = Some(FakeLogs::Final {
                    stdout: String::new(),
                    stderr: "ERROR!\n".into(),
                });
            }
            return Ok(reply(0, "", ""));
        }
        if line.starts_with("if [ -e ") {
            return Ok(self.inspect(line));
        }
        if line.starts_with("printf") {
            return Ok(reply(0, "/home/fake", ""));
        }
        Ok(reply(0, "", ""))
    }

    fn submit(&mut self, job_id: String) -> CommandOutput {
        if self.reject_submissions > 0 {
            self.reject_submissions -= 1;
            return reply(1, "", "qsub: queue is full");
        }
        let (command, stderr_path) = self.scripts.get(&job_id).cloned().unwrap_or_default();
        let scheduler_id = format!("fake-{}", self.jobs.len());
        self.jobs.push(FakeJob {
            scheduler_id: scheduler_id.clone(),
            command,
            stderr_path,
            polls_left: self.polls_to_finish,
            listed: Some(QueueState::Queued),
            logs: None,
        });
        self.submissions.push((job_id, Instant::now()));
        let listed = self.jobs.iter().filter(|j| j.listed.is_some()).count();
        self.max_listed = self.max_listed.max(listed);
        reply(0, format!("{scheduler_id}\n"), "")
    }

    fn status(&mut self) -> CommandOutput {
        if self.fail_status {
            return reply(1, "", "qstat: cannot connect to server");
        }
        let mut out = String::new();
        for job in self.jobs.iter_mut().filter(|j| j.listed.is_some()) {
            if job.command == "broken" {
                job.listed = Some(QueueState::Errored);
                out.push_str(&format!("{} Eqw\n", job.scheduler_id));
                continue;
            }
            if job.polls_left == 0 && job.command != "hang" {
                job.complete();
                continue;
            }
            job.polls_left = job.polls_left.saturating_sub(1);
            job.listed = Some(QueueState::Running);
            out.push_str(&format!("{} R\n", job.scheduler_id));
        }
        reply(0, out, "")
    }

    fn inspect(&self, line: &str) -> CommandOutput {
        if self.garble_inspect {
            return reply(0, "Welcome to the cluster!\n", "");
        }
        let job = self
            .jobs
            .iter()
            .find(|j| line.starts_with(&format!("if [ -e {} ]", shell_quote(&j.stderr_path))));
        match job.and_then(|j| j.logs.clone()) {
            None => reply(0, "missing\n", ""),
            Some(FakeLogs::Partial) => reply(0, "partial\n", ""),
            Some(FakeLogs::Final { stdout, stderr }) => reply(
                0,
                format!("final {}\n{stderr}\n{LOG_BOUNDARY}\n{stdout}", stderr.len()),
                "",
            ),
        }
    }

    fn submitted(&self, job_id: &str) -> bool {
        self.submissions.iter().any(|(id, _)| id == job_id)
    }
}

struct FakeChannel(Shared);

#[async_trait]
impl RemoteChannel for FakeChannel {
    fn target(&self) -> &str {
        "fake"
    }

    async fn open(&mut self) -> Result<()> {
        if self.0.lock().unwrap().refuse_connection {
            return Err(Error::connection("fake", "connection refused"));
        }
        Ok(())
    }

    async fn run(&mut self, command_line: &str) -> Result<CommandOutput> {
        self.0.lock().unwrap().run(command_line)
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
struct FakeDialect(Shared);

impl SchedulerDialect for FakeDialect {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn submit_command(&self, job: &Job, _work_dir: &str) -> String {
        self.0.lock().unwrap().scripts.insert(
            job.job_id().to_string(),
            (job.command.clone(), job.paths.stderr.clone()),
        );
        format!("FAKE_SUBMIT {}", job.job_id())
    }

    fn parse_job_id(&self, stdout: &str) -> Option<String> {
        let id = stdout.trim();
        id.starts_with("fake-").then(|| id.to_string())
    }

    fn status_command(&self, _scheduler_ids: &[&str]) -> String {
        "FAKE_STATUS".to_string()
    }

    fn parse_status(&self, stdout: &str, scheduler_ids: &[&str]) -> HashMap<String, QueueState> {
        let listed: HashMap<&str, &str> = stdout
            .lines()
            .filter_map(|l| l.split_once(' '))
            .collect();
        scheduler_ids
            .iter()
            .map(|id| {
                let state = match listed.get(id) {
                    Some(code) if code.starts_with('E') => QueueState::Errored,
                    Some(_) => QueueState::Running,
                    None => QueueState::Absent,
                };
                ((*id).to_string(), state)
            })
            .collect()
    }

    fn cancel_command(&self, scheduler_id: &str) -> String {
        format!("FAKE_CANCEL {scheduler_id}")
    }
}

fn fast_config() -> ControllerConfig {
    ControllerConfig::new(ConnectionTarget::local())
        .with_log_root("/logs")
        .with_namespace("test")
        .with_poll_interval(Duration::from_millis(20))
        .with_submit_delay(Duration::ZERO)
        .with_submit_backoff(Duration::from_millis(10))
        .with_lost_grace_period(Duration::from_millis(100))
}

async fn fake_controller(
    config: ControllerConfig,
    setup: impl FnOnce(&mut FakeCluster),
) -> (Controller, Shared) {
    let shared = Shared::default();
    {
        let mut cluster = shared.lock().unwrap();
        cluster.polls_to_finish = 1;
        setup(&mut cluster);
    }
    let controller = Controller::connect_with(
        config,
        Box::new(FakeChannel(shared.clone())),
        Box::new(FakeDialect(shared.clone())),
    )
    .await
    .unwrap();
    (controller, shared)
}

async fn patiently<F: Future>(future: F) -> F::Output {
    timeout(PATIENCE, future).await.expect("timed out")
}

fn opts(job_id: &str) -> JobOpts {
    JobOpts::builder(job_id).build().unwrap()
}

#[tokio::test]
async fn echo_hello_finishes_done() {
    let config = fast_config().with_concurrent_job_limit(Some(1));
    let (controller, _) = fake_controller(config, |_| {}).await;

    let mut handles = controller.submit(["echo hello"], &opts("hello"), None).unwrap();
    let outcome = patiently(handles.remove(0)).await.unwrap();

    assert_eq!(outcome.job_id, "hello");
    assert_eq!(outcome.status, JobState::Done);
    assert_eq!(outcome.stdout, "hello\n");
    assert_eq!(outcome.stderr.trim(), "DONE!");
    assert_eq!(outcome.scheduler_id.as_deref(), Some("fake-0"));
    assert!(outcome.into_result().is_ok());
}

#[tokio::test]
async fn futures_follow_input_order_under_the_limit() {
    let config = fast_config().with_concurrent_job_limit(Some(2));
    let (controller, shared) = fake_controller(config, |c| c.polls_to_finish = 2).await;
    let controller = Arc::new(controller);

    let sampler = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            let mut worst = 0;
            loop {
                let report = controller.job_status();
                worst = worst.max(report.num_running());
                if report.len() == 5 && report.is_settled() {
                    return worst;
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
    };

    let commands: Vec<String> = (0..5).map(|i| format!("echo {i}")).collect();
    let handles = controller.submit(commands, &opts("batch"), None).unwrap();
    assert_eq!(handles.len(), 5);

    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.job_id(), format!("batch-{i}"));
        let outcome = patiently(handle).await.unwrap();
        assert_eq!(outcome.job_id, format!("batch-{i}"));
        assert_eq!(outcome.status, JobState::Done);
        assert_eq!(outcome.stdout, format!("{i}\n"));
    }

    let worst = patiently(sampler).await.unwrap();
    assert!(worst <= 2, "snapshot showed {worst} jobs on the scheduler");
    assert!(shared.lock().unwrap().max_listed <= 2);
}

#[tokio::test]
async fn submissions_respect_the_delay() {
    let (controller, shared) = fake_controller(fast_config(), |_| {}).await;
    let delay = Duration::from_millis(80);

    let handles = controller
        .submit(["echo a", "echo b", "echo c"], &opts("paced"), Some(delay))
        .unwrap();
    for handle in handles {
        patiently(handle).await.unwrap();
    }

    let cluster = shared.lock().unwrap();
    assert_eq!(cluster.submissions.len(), 3);
    for pair in cluster.submissions.windows(2) {
        let gap = pair[1].1.duration_since(pair[0].1);
        assert!(gap >= delay, "submissions only {gap:?} apart");
    }
}

#[tokio::test]
async fn invalid_options_never_reach_the_cluster() {
    let (controller, shared) = fake_controller(fast_config(), |_| {}).await;
    let before = shared.lock().unwrap().commands.len();

    let err = JobOpts::builder("job").nproc(0).build().unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let err = controller
        .submit_named([("bad id", "echo x")], &opts("job"), None)
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let err = controller.submit(["  "], &opts("blank"), None).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(shared.lock().unwrap().commands.len(), before);
    assert!(controller.job_status().is_empty());
}

#[tokio::test]
async fn job_ids_are_unique_per_session() {
    let (controller, _) = fake_controller(fast_config(), |_| {}).await;

    let first = controller.submit(["echo 1"], &opts("same"), None).unwrap();
    let err = controller.submit(["echo 2"], &opts("same"), None).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let err = controller
        .submit_named([("twin", "echo 1"), ("twin", "echo 2")], &opts("x"), None)
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    for handle in first {
        patiently(handle).await.unwrap();
    }
    assert_eq!(controller.forget_finished().await.unwrap(), 1);
    assert!(controller.submit(["echo 3"], &opts("same"), None).is_err());
}

#[tokio::test]
async fn cancel_before_submission_issues_no_remote_call() {
    let config = fast_config()
        .with_concurrent_job_limit(Some(1))
        .with_lost_grace_period(Duration::from_secs(3600));
    let (controller, shared) = fake_controller(config, |_| {}).await;

    let mut handles = controller
        .submit_named([("first", "hang"), ("second", "echo 2")], &opts("x"), None)
        .unwrap();
    let second = handles.pop().unwrap();
    let first = handles.pop().unwrap();

    patiently(async {
        while !shared.lock().unwrap().submitted("first") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    second.cancel().unwrap();
    let outcome = patiently(second).await.unwrap();
    assert_eq!(outcome.status, JobState::Failed);
    assert_eq!(outcome.failure, Some(FailureReason::Cancelled));
    assert!(outcome.scheduler_id.is_none());

    // Cancelling a submitted job resolves on the next poll, not after the grace period.
    first.cancel().unwrap();
    let outcome = patiently(first).await.unwrap();
    assert_eq!(outcome.status, JobState::Failed);
    assert_eq!(outcome.failure, Some(FailureReason::Cancelled));

    let cluster = shared.lock().unwrap();
    assert!(!cluster.submitted("second"));
    assert!(!cluster.commands.iter().any(|c| c.contains("FAKE_SUBMIT second")));
    assert_eq!(cluster.cancels, vec!["fake-0".to_string()]);
}

#[tokio::test]
async fn vanished_job_is_lost_after_grace() {
    let (controller, _) = fake_controller(fast_config(), |_| {}).await;
    let started = Instant::now();

    let mut handles = controller.submit(["vanish"], &opts("ghost"), None).unwrap();
    let outcome = patiently(handles.remove(0)).await.unwrap();

    assert_eq!(outcome.status, JobState::Lost);
    assert_eq!(outcome.failure, Some(FailureReason::Vanished));
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert!(matches!(outcome.into_result(), Err(Error::JobLost { .. })));
}

#[tokio::test]
async fn temp_only_logs_fail_after_grace() {
    let (controller, _) = fake_controller(fast_config(), |_| {}).await;

    let mut handles = controller.submit(["crash"], &opts("crash"), None).unwrap();
    let outcome = patiently(handles.remove(0)).await.unwrap();

    assert_eq!(outcome.status, JobState::Failed);
    assert_eq!(outcome.failure, Some(FailureReason::LogsNotPromoted));
}

#[tokio::test]
async fn unreadable_logs_are_lost_after_grace() {
    let (controller, _) = fake_controller(fast_config(), |c| c.garble_inspect = true).await;
    let started = Instant::now();

    let mut handles = controller.submit(["echo hi"], &opts("banner"), None).unwrap();
    let outcome = patiently(handles.remove(0)).await.unwrap();

    assert_eq!(outcome.status, JobState::Lost);
    assert!(matches!(
        outcome.failure,
        Some(FailureReason::LogsUnreadable(ref m)) if m.contains("Welcome to the cluster!")
    ));
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(controller.num_running_jobs(), 0);
}

#[tokio::test]
async fn errored_job_is_deleted_and_failed() {
    let config = fast_config().with_concurrent_job_limit(Some(1));
    let (controller, shared) = fake_controller(config, |_| {}).await;

    let handles = controller
        .submit_named([("broken", "broken"), ("next", "echo next")], &opts("x"), None)
        .unwrap();
    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(patiently(handle).await.unwrap());
    }

    assert_eq!(outcomes[0].status, JobState::Failed);
    assert_eq!(outcomes[0].failure, Some(FailureReason::SchedulerError));
    // The slot is freed for the next job.
    assert_eq!(outcomes[1].status, JobState::Done);
    assert_eq!(shared.lock().unwrap().cancels, vec!["fake-0".to_string()]);
}

#[tokio::test]
async fn error_sentinel_fails_the_job() {
    let (controller, _) = fake_controller(fast_config(), |_| {}).await;

    let mut handles = controller.submit(["fail hard"], &opts("bad"), None).unwrap();
    let outcome = patiently(handles.remove(0)).await.unwrap();

    assert_eq!(outcome.status, JobState::Failed);
    assert_eq!(outcome.failure, Some(FailureReason::CommandFailed));
    assert!(outcome.stderr.contains("ERROR!"));
    assert!(!outcome.stderr.contains("DONE!"));
    assert!(matches!(
        outcome.into_result(),
        Err(Error::JobFailed { reason: FailureReason::CommandFailed, .. })
    ));
}

#[tokio::test]
async fn rejected_submission_is_retried() {
    let config = fast_config().with_submit_retries(3);
    let (controller, shared) = fake_controller(config, |c| c.reject_submissions = 2).await;

    let mut handles = controller.submit(["echo ok"], &opts("retry"), None).unwrap();
    let outcome = patiently(handles.remove(0)).await.unwrap();
    assert_eq!(outcome.status, JobState::Done);

    let cluster = shared.lock().unwrap();
    let attempts = cluster
        .commands
        .iter()
        .filter(|c| c.contains("FAKE_SUBMIT retry"))
        .count();
    assert_eq!(attempts, 3);
}

#[tokio::test]
async fn exhausted_retries_fail_with_submission_error() {
    let config = fast_config().with_submit_retries(2);
    let (controller, shared) = fake_controller(config, |c| c.reject_submissions = 100).await;

    let mut handles = controller.submit(["echo ok"], &opts("doomed"), None).unwrap();
    let outcome = patiently(handles.remove(0)).await.unwrap();

    assert_eq!(outcome.status, JobState::Failed);
    assert!(matches!(
        outcome.failure,
        Some(FailureReason::Submission(ref m)) if m.contains("queue is full")
    ));
    assert!(matches!(outcome.into_result(), Err(Error::Submission { .. })));
    assert_eq!(shared.lock().unwrap().submissions.len(), 0);
    assert_eq!(
        shared
            .lock()
            .unwrap()
            .commands
            .iter()
            .filter(|c| c.contains("FAKE_SUBMIT doomed"))
            .count(),
        3
    );
}

#[tokio::test]
async fn repeated_poll_failures_fail_outstanding_jobs() {
    let config = fast_config().with_poll_failure_limit(3);
    let (controller, _) = fake_controller(config, |c| c.fail_status = true).await;

    let handles = controller.submit(["hang", "hang"], &opts("stuck"), None).unwrap();
    for handle in handles {
        let outcome = patiently(handle).await.unwrap();
        assert_eq!(outcome.status, JobState::Failed);
        assert!(matches!(outcome.failure, Some(FailureReason::Connection(_))));
    }
}

#[tokio::test]
async fn wait_all_then_forget() {
    let (controller, _) = fake_controller(fast_config(), |_| {}).await;

    let _handles = controller
        .submit(["echo 1", "fail", "vanish"], &opts("mixed"), None)
        .unwrap();
    let report = patiently(controller.wait_all()).await.unwrap();

    assert_eq!(report.len(), 3);
    assert!(report.is_settled());
    let counts = report.counts();
    assert_eq!(counts[&JobState::Done], 1);
    assert_eq!(counts[&JobState::Failed], 1);
    assert_eq!(counts[&JobState::Lost], 1);
    assert_eq!(controller.num_running_jobs(), 0);

    assert_eq!(controller.forget_finished().await.unwrap(), 3);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(controller.job_status().is_empty());
}

#[tokio::test]
async fn running_jobs_are_counted() {
    let (controller, _) = fake_controller(fast_config(), |_| {}).await;
    let _handles = controller.submit(["hang"], &opts("busy"), None).unwrap();

    patiently(async {
        while controller.num_running_jobs() != 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    let report = controller.job_status();
    assert_eq!(report.get("busy").map(|r| r.status), Some(JobState::Running));
}

#[tokio::test]
async fn shutdown_resolves_unfinished_jobs_as_closed() {
    let (controller, _) = fake_controller(fast_config(), |_| {}).await;
    let mut handles = controller.submit(["hang"], &opts("forever"), None).unwrap();

    patiently(controller.shutdown()).await.unwrap();
    let result = patiently(handles.remove(0)).await;
    assert!(matches!(result, Err(Error::ControllerClosed)));
    assert!(matches!(
        controller.submit(["echo late"], &opts("late"), None),
        Err(Error::ControllerClosed)
    ));
}

#[tokio::test]
async fn relative_log_root_resolves_against_home() {
    let config = fast_config().with_log_root("runs");
    let (controller, shared) = fake_controller(config, |_| {}).await;

    assert_eq!(controller.log_dir(), "/home/fake/runs/test");
    let cluster = shared.lock().unwrap();
    assert!(cluster
        .commands
        .iter()
        .any(|c| c == "mkdir -p /home/fake/runs/test"));
}

#[tokio::test]
async fn refused_connection_fails_connect() {
    let shared = Shared::default();
    shared.lock().unwrap().refuse_connection = true;
    let err = Controller::connect_with(
        fast_config(),
        Box::new(FakeChannel(shared.clone())),
        Box::new(FakeDialect(shared)),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::Connection { .. }));
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn local_jobs_run_end_to_end() {
    use crate::channel::LocalChannel;

    let dir = tempfile::tempdir().unwrap();
    let config = ControllerConfig::new(ConnectionTarget::local())
        .with_log_root(dir.path().to_str().unwrap())
        .with_namespace("e2e")
        .with_concurrent_job_limit(Some(1))
        .with_poll_interval(Duration::from_millis(100))
        .with_lost_grace_period(Duration::from_secs(5));
    let controller = Controller::connect(config, Box::new(LocalChannel::new()))
        .await
        .unwrap();

    let mut handles = controller
        .submit_named([("ok", "echo hello"), ("bad", "exit 1")], &opts("e2e"), None)
        .unwrap();
    let bad = handles.pop().unwrap();
    let ok = handles.pop().unwrap();

    let outcome = timeout(Duration::from_secs(30), ok).await.unwrap().unwrap();
    assert_eq!(outcome.status, JobState::Done);
    assert_eq!(outcome.stdout, "hello\n");
    assert_eq!(outcome.stderr, "DONE!\n");

    let outcome = timeout(Duration::from_secs(30), bad).await.unwrap().unwrap();
    assert_eq!(outcome.status, JobState::Failed);
    assert!(outcome.stderr.lines().any(|l| l == "ERROR!"));
    assert!(!outcome.stderr.contains("DONE!"));

    assert!(dir.path().join("e2e/ok.sh").exists());
    assert!(!dir.path().join("e2e/ok.out.tmp").exists());
    controller.shutdown().await.unwrap();
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn cancelled_local_job_promotes_its_logs() {
    use crate::channel::LocalChannel;

    let dir = tempfile::tempdir().unwrap();
    let config = ControllerConfig::new(ConnectionTarget::local())
        .with_log_root(dir.path().to_str().unwrap())
        .with_namespace("term")
        .with_poll_interval(Duration::from_millis(100))
        .with_lost_grace_period(Duration::from_secs(5));
    let controller = Controller::connect(config, Box::new(LocalChannel::new()))
        .await
        .unwrap();

    let mut handles = controller
        .submit_named([("sleeper", "echo started; sleep 30")], &opts("term"), None)
        .unwrap();
    let handle = handles.remove(0);

    timeout(Duration::from_secs(30), async {
        while controller.job_status().get("sleeper").map(|r| r.status) != Some(JobState::Running) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    handle.cancel().unwrap();

    let outcome = timeout(Duration::from_secs(30), handle).await.unwrap().unwrap();
    assert_eq!(outcome.status, JobState::Failed);
    assert_eq!(outcome.failure, Some(FailureReason::Cancelled));
    assert_eq!(outcome.stdout, "started\n");
    assert!(outcome.stderr.lines().any(|l| l == "ERROR!"));
    assert!(!outcome.stderr.contains("DONE!"));

    let logs = dir.path().join("term");
    assert!(logs.join("sleeper.err").exists());
    assert!(!logs.join("sleeper.out.tmp").exists());
    assert!(!logs.join("sleeper.err.tmp").exists());
    controller.shutdown().await.unwrap();
}
