//! Sun Grid Engine (and its Son of / Univa descendants).

use std::collections::HashMap;

use super::{first_token, resolve, QueueState, SchedulerDialect};
use crate::models::Job;
use crate::wrapper::shell_quote;

/// `qsub -terse` / `qstat` / `qdel`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SgeDialect;

/// Map an SGE state code (`qw`, `hqw`, `r`, `t`, `Rr`, `dr`, `Eqw`…).
///
/// An `E` marks an error state: the job stays listed until someone
/// deletes it. Anything else still waiting for a slot carries a `q`.
fn queue_state(code: &str) -> QueueState {
    if code.contains('E') {
        QueueState::Errored
    } else if code.contains('q') {
        QueueState::Queued
    } else {
        QueueState::Running
    }
}

impl SchedulerDialect for SgeDialect {
    fn name(&self) -> &'static str {
        "sge"
    }

    fn submit_command(&self, job: &Job, work_dir: &str) -> String {
        let opts = &job.opts;
        let mut args = vec![
            "qsub".to_string(),
            "-terse".to_string(),
            format!("-S {}", shell_quote(opts.shell())),
            format!("-N {}", shell_quote(job.job_id())),
            "-o /dev/null -e /dev/null".to_string(),
            format!("-wd {}", shell_quote(work_dir)),
            format!("-pe smp {}", opts.nproc()),
            format!("-l h_rt={}", shell_quote(opts.walltime())),
        ];
        if let Some(mem) = opts.mem() {
            args.push(format!("-l mem_free={}", shell_quote(mem)));
        }
        if let Some(vmem) = opts.vmem() {
            args.push(format!("-l h_vmem={}", shell_quote(vmem)));
        }
        if let Some(gpus) = opts.gpus() {
            args.push(format!("-l gpu={gpus}"));
        }
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
        // Array jobs answer `4411.1-10:1`.
        let token = first_token(stdout)?;
        let id = token.split('.').next()?;
        (!id.is_empty() && id.bytes().all(|b| b.is_ascii_digit())).then(|| id.to_string())
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
                if !id.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                Some(((*id).to_string(), queue_state(columns.get(4)?)))
            })
            .collect();
        resolve(&listing, scheduler_ids, |listed, id| listed == id)
    }

    fn cancel_command(&self, scheduler_id: &str) -> String {
        format!("qdel {}", shell_quote(scheduler_id))
    }
}
