//! PBS / Torque.

use std::collections::HashMap;

use super::{first_token, resolve, QueueState, SchedulerDialect};
use crate::models::Job;
use crate::wrapper::shell_quote;

/// `qsub` / `qstat` / `qdel` as spoken by PBS and Torque.
#[derive(Debug, Clone, Copy, Default)]
pub struct PbsDialect;

/// Leading digits of a PBS id. `qstat` truncates the server suffix, so
/// `4411.headnode.cluster` and `4411.headnode` are the same job.
fn numeric_prefix(id: &str) -> &str {
    let end = id.find(|c: char| !c.is_ascii_digit()).unwrap_or(id.len());
    &id[..end]
}

fn same_job(listed: &str, id: &str) -> bool {
    let prefix = numeric_prefix(id);
    !prefix.is_empty() && numeric_prefix(listed) == prefix
}

fn queue_state(code: &str) -> QueueState {
    match code {
        "R" | "E" | "S" => QueueState::Running,
        "C" | "F" | "X" => QueueState::Absent,
        _ => QueueState::Queued,
    }
}

impl SchedulerDialect for PbsDialect {
    fn name(&self) -> &'static str {
        "pbs"
    }

    fn submit_command(&self, job: &Job, work_dir: &str) -> String {
        let opts = &job.opts;

        let mut resources = format!("nodes=1:ppn={}", opts.nproc());
        if let Some(gpus) = opts.gpus() {
            resources.push_str(&format!(":gpus={gpus}"));
        }
        resources.push_str(&format!(",walltime={}", opts.walltime()));
        for (name, value) in [
            ("mem", opts.mem()),
            ("pmem", opts.pmem()),
            ("vmem", opts.vmem()),
            ("pvmem", opts.pvmem()),
        ] {
            if let Some(value) = value {
                resources.push_str(&format!(",{name}={value}"));
            }
        }

        let mut args = vec![
            "qsub".to_string(),
            format!("-S {}", shell_quote(opts.shell())),
            format!("-N {}", shell_quote(job.job_id())),
            "-o /dev/null -e /dev/null".to_string(),
            format!("-d {}", shell_quote(work_dir)),
            format!("-l {}", shell_quote(&resources)),
        ];
        if let Some(queue) = opts.queue() {
            args.push(format!("-q {}", shell_quote(queue)));
        }
        if let Some(account) = opts.account() {
            args.push(format!("-A {}", shell_quote(account)));
        }
        if let Some(email) = opts.email() {
            args.push(format!("-M {} -m a", shell_quote(email)));
        }
        args.push(shell_quote(&job.paths.script));
        args.join(" ")
    }

    fn parse_job_id(&self, stdout: &str) -> Option<String> {
        let token = first_token(stdout)?;
        (!numeric_prefix(&token).is_empty()).then_some(token)
    }

    fn status_command(&self, _scheduler_ids: &[&str]) -> String {
        r#"qstat -u "$USER""#.to_string()
    }

    fn parse_status(&self, stdout: &str, scheduler_ids: &[&str]) -> HashMap<String, QueueState> {
        let listing: Vec<(String, QueueState)> = stdout
            .lines()
            .filter_map(|line| {
                let columns: Vec<&str> = line.split_whitespace().collect();
                let id = columns.first()?;
                if numeric_prefix(id).is_empty() || columns.len() < 3 {
                    return None;
                }
                let state = columns.get(columns.len() - 2)?;
                Some(((*id).to_string(), queue_state(state)))
            })
            .collect();
        resolve(&listing, scheduler_ids, same_job)
    }

    fn cancel_command(&self, scheduler_id: &str) -> String {
        format!("qdel {}", shell_quote(scheduler_id))
    }
}
