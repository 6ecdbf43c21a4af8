//! Background processes on the channel host, no batch system involved.
//!
//! The job id is the PID of the detached wrapper, which also leads its own
//! process group so cancellation reaches every child. Status is read from
//! `/proc`, so this dialect needs a Linux host.

use std::collections::HashMap;

use super::{first_token, resolve, QueueState, SchedulerDialect};
use crate::models::Job;
use crate::wrapper::shell_quote;

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalDialect;

impl SchedulerDialect for LocalDialect {
    fn name(&self) -> &'static str {
        "local"
    }

    fn submit_command(&self, job: &Job, work_dir: &str) -> String {
        format!(
            "cd {dir} && {{ setsid nohup {shell} {script} </dev/null >/dev/null 2>&1 & echo $!; }}",
            dir = shell_quote(work_dir),
            shell = shell_quote(job.opts.shell()),
            script = shell_quote(&job.paths.script),
        )
    }

    fn parse_job_id(&self, stdout: &str) -> Option<String> {
        let pid = first_token(stdout)?;
        (pid.bytes().all(|b| b.is_ascii_digit()) && pid != "0").then_some(pid)
    }

    /// Prints `<pid> <state>` for every live process; field 3 of
    /// `/proc/<pid>/stat` follows the parenthesised command name.
    fn status_command(&self, scheduler_ids: &[&str]) -> String {
        let pids = scheduler_ids
            .iter()
            .filter(|id| !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()))
            .copied()
            .collect::<Vec<_>>()
            .join(" ");
        format!(
            "for pid in {pids}; do \
                 state=$(sed -n 's/^.*) \\([A-Za-z]\\).*$/\\1/p' /proc/$pid/stat 2>/dev/null); \
                 [ -n \"$state\" ] && echo \"$pid $state\"; \
             done; true"
        )
    }

    fn parse_status(&self, stdout: &str, scheduler_ids: &[&str]) -> HashMap<String, QueueState> {
        let listing: Vec<(String, QueueState)> = stdout
            .lines()
            .filter_map(|line| {
                let (pid, state) = line.trim().split_once(' ')?;
                // Zombies and dead processes have finished.
                let state = match state.trim() {
                    "Z" | "X" | "x" => return None,
                    _ => QueueState::Running,
                };
                Some((pid.to_string(), state))
            })
            .collect();
        resolve(&listing, scheduler_ids, |listed, id| listed == id)
    }

    fn cancel_command(&self, scheduler_id: &str) -> String {
        let pid = shell_quote(scheduler_id);
        format!("kill -TERM -- -{pid} 2>/dev/null || kill -TERM {pid}")
    }
}
