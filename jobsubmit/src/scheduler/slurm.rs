//! Slurm.

use std::collections::HashMap;

use super::{first_token, resolve, QueueState, SchedulerDialect};
use crate::models::Job;
use crate::wrapper::shell_quote;

/// `sbatch` / `squeue` / `scancel`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlurmDialect;

/// Map a compact `squeue %t` state code. Codes of finished jobs
/// (`CD`, `F`, `CA`, `TO`, `OOM`…) count as absent.
fn queue_state(code: &str) -> QueueState {
    match code {
        "PD" | "CF" | "RD" | "RF" | "RH" | "RQ" => QueueState::Queued,
        "R" | "CG" | "S" | "ST" | "SI" | "SO" | "RS" => QueueState::Running,
        _ => QueueState::Absent,
    }
}

impl SchedulerDialect for SlurmDialect {
    fn name(&self) -> &'static str {
        "slurm"
    }

    fn submit_command(&self, job: &Job, work_dir: &str) -> String {
        let opts = &job.opts;
        let mut args = vec![
            "sbatch".to_string(),
            "--parsable".to_string(),
            format!("--job-name={}", shell_quote(job.job_id())),
            "--output=/dev/null --error=/dev/null".to_string(),
            format!("--chdir={}", shell_quote(work_dir)),
            "--nodes=1".to_string(),
            format!("--cpus-per-task={}", opts.nproc()),
            format!("--time={}", shell_quote(opts.walltime())),
        ];
        // sbatch refuses --mem together with --mem-per-cpu; the node total wins.
        match (opts.mem(), opts.pmem()) {
            (Some(mem), _) => args.push(format!("--mem={}", shell_quote(mem))),
            (None, Some(pmem)) => args.push(format!("--mem-per-cpu={}", shell_quote(pmem))),
            (None, None) => {}
        }
        if let Some(gpus) = opts.gpus() {
            args.push(format!("--gres=gpu:{gpus}"));
        }
        if let Some(queue) = opts.queue() {
            args.push(format!("--partition={}", shell_quote(queue)));
        }
        if let Some(account) = opts.account() {
            args.push(format!("--account={}", shell_quote(account)));
        }
        if let Some(email) = opts.email() {
            args.push(format!("--mail-user={} --mail-type=FAIL", shell_quote(email)));
        }
        args.push(shell_quote(&job.paths.script));
        args.join(" ")
    }

    fn parse_job_id(&self, stdout: &str) -> Option<String> {
        // `--parsable` prints `id` or `id;cluster`.
        let token = first_token(stdout)?;
        let id = token.split(';').next()?;
        (!id.is_empty() && id.bytes().all(|b| b.is_ascii_digit())).then(|| id.to_string())
    }

    fn status_command(&self, _scheduler_ids: &[&str]) -> String {
        r#"squeue -h -u "$USER" -o '%i %t'"#.to_string()
    }

    fn parse_status(&self, stdout: &str, scheduler_ids: &[&str]) -> HashMap<String, QueueState> {
        let listing: Vec<(String, QueueState)> = stdout
            .lines()
            .filter_map(|line| {
                let mut columns = line.split_whitespace();
                let id = columns.next()?;
                let state = columns.next()?;
                Some((id.to_string(), queue_state(state)))
            })
            .collect();
        resolve(&listing, scheduler_ids, |listed, id| listed == id)
    }

    fn cancel_command(&self, scheduler_id: &str) -> String {
        format!("scancel {}", shell_quote(scheduler_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobOpts;

    #[test]
    fn submit_command_uses_long_options() {
        let opts = JobOpts::builder("job_0")
            .nproc(2)
            .walltime("1-00:00:00")
            .queue("gpu")
            .gpus(2)
            .build()
            .unwrap();
        let job = Job::new(opts, "true".into(), "/scratch/logs/run");
        let cmd = SlurmDialect.submit_command(&job, "/data");
        assert_eq!(
            cmd,
            "sbatch --parsable --job-name=job_0 --output=/dev/null --error=/dev/null \
             --chdir=/data --nodes=1 --cpus-per-task=2 --time=1-00:00:00 --gres=gpu:2 \
             --partition=gpu /scratch/logs/run/job_0.sh"
        );
    }

    #[test]
    fn per_process_memory_only_without_node_memory() {
        let opts = JobOpts::builder("job_0").pmem("2G").vmem("8G").build().unwrap();
        let job = Job::new(opts.clone(), "true".into(), "/scratch/logs/run");
        let cmd = SlurmDialect.submit_command(&job, "/data");
        assert!(cmd.contains(" --mem-per-cpu=2G "));
        assert!(!cmd.contains("8G"));

        let opts = opts.to_builder().mem("16G").build().unwrap();
        let job = Job::new(opts, "true".into(), "/scratch/logs/run");
        let cmd = SlurmDialect.submit_command(&job, "/data");
        assert!(cmd.contains(" --mem=16G "));
        assert!(!cmd.contains("--mem-per-cpu"));
    }

    #[test]
    fn parses_parsable_ids() {
        assert_eq!(SlurmDialect.parse_job_id("81234\n"), Some("81234".into()));
        assert_eq!(SlurmDialect.parse_job_id("81234;cluster2\n"), Some("81234".into()));
        assert_eq!(
            SlurmDialect.parse_job_id("sbatch: error: invalid partition\n"),
            None
        );
    }

    #[test]
    fn parses_squeue_codes() {
        let out = "81234 R\n81235 PD\n81236 CG\n81237 CD\n";
        let states = SlurmDialect.parse_status(out, &["81234", "81235", "81236", "81237", "1"]);
        assert_eq!(states["81234"], QueueState::Running);
        assert_eq!(states["81235"], QueueState::Queued);
        assert_eq!(states["81236"], QueueState::Running);
        assert_eq!(states["81237"], QueueState::Absent);
        assert_eq!(states["1"], QueueState::Absent);
        assert_eq!(SlurmDialect.cancel_command("81234"), "scancel 81234");
    }
}
