//! Per-job wrapper script.
//!
//! Every job runs inside a small shell script that sends the command's
//! output to temporary log files and renames them to their final names
//! once the command has finished. The final stderr log is renamed last, so
//! its presence means both logs are complete. The last line of that log is
//! a sentinel: `DONE!` on success, while `ERROR!` marks a trapped failure.

mod logs;

use crate::models::Job;
use crate::scheduler::SchedulerDialect;

pub use logs::{inspect_command, parse_log_report, verdict, LogReport, LOG_BOUNDARY};

/// Success sentinel written as the last line of the final stderr log.
pub const DONE_SENTINEL: &str = "DONE!";

/// Failure sentinel written when the command exits non-zero or is killed.
pub const ERROR_SENTINEL: &str = "ERROR!";

/// Exit status when the logs could not be renamed (`EX_IOERR`).
pub const EXIT_IO_ERROR: i32 = 74;

const HEREDOC_DELIMITER: &str = "JOBSUBMIT_SCRIPT_EOF";

/// Fixed part of every job script. Expects `STDOUT_LOG`, `STDERR_LOG` and
/// `SYSTEM_COMMAND` to be exported above it.
const TEMPLATE: &str = r#"
exec 1>"$STDOUT_LOG.tmp" 2>"$STDERR_LOG.tmp"

promote_logs() {
    mv -f "$STDOUT_LOG.tmp" "$STDOUT_LOG" && mv -f "$STDERR_LOG.tmp" "$STDERR_LOG"
}

trap 'echo "ERROR!" >&2; promote_logs || exit 74; exit 143' TERM

status=0
trap 'status=$?; echo "ERROR!" >&2' ERR
( eval "$SYSTEM_COMMAND" )
trap - ERR

if [ "$status" -eq 0 ]; then
    echo "DONE!" >&2
fi
promote_logs || exit 74
exit "$status"
"#;

/// Quote `s` for a POSIX shell.
///
/// Plain words are returned as they are; anything else is wrapped in
/// single quotes.
pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    if s.chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:@=+,%".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Render the complete script for `job`.
pub fn render_job_script(job: &Job) -> String {
    let mut script = format!("#!{}\n", job.opts.shell());
    let mut export = |name: &str, value: &str| {
        script.push_str(&format!("export {name}={}\n", shell_quote(value)));
    };

    export("STDOUT_LOG", &job.paths.stdout);
    export("STDERR_LOG", &job.paths.stderr);
    export("SYSTEM_COMMAND", &job.command);
    for (name, value) in job.opts.env() {
        export(name, value);
    }

    script.push_str(TEMPLATE);
    script
}

/// Directory holding the job's logs and script.
pub fn log_dir(job: &Job) -> &str {
    job.paths
        .script
        .rsplit_once('/')
        .map_or(".", |(dir, _)| if dir.is_empty() { "/" } else { dir })
}

/// Directory the job starts in: the requested working directory or the
/// log directory.
pub fn work_dir(job: &Job) -> &str {
    job.opts.working_dir().unwrap_or_else(|| log_dir(job))
}

/// One command line that writes the job script and submits it.
///
/// It creates the log and working directories, removes logs left over
/// from an earlier job with the same id, writes the script through a
/// here-document and finally runs the dialect's submit command, whose
/// stdout carries the scheduler id.
pub fn submit_command_line(job: &Job, dialect: &dyn SchedulerDialect) -> String {
    let script = render_job_script(job);
    let log_dir = log_dir(job);
    let work_dir = work_dir(job);

    let mut dirs = shell_quote(log_dir);
    if work_dir != log_dir {
        dirs.push(' ');
        dirs.push_str(&shell_quote(work_dir));
    }

    let stale = [
        job.paths.stdout.clone(),
        job.paths.stderr.clone(),
        job.paths.stdout_tmp(),
        job.paths.stderr_tmp(),
    ]
    .iter()
    .map(|p| shell_quote(p))
    .collect::<Vec<_>>()
    .join(" ");

    let delimiter = heredoc_delimiter(&script);

    format!(
        "mkdir -p {dirs} && rm -f {stale} && cat > {script_path} <<'{delimiter}' && {submit}\n{script}{delimiter}\n",
        script_path = shell_quote(&job.paths.script),
        submit = dialect.submit_command(job, work_dir),
    )
}

/// A delimiter that does not occur as a line of `body`.
fn heredoc_delimiter(body: &str) -> String {
    let mut delimiter = HEREDOC_DELIMITER.to_string();
    while body.lines().any(|line| line == delimiter) {
        delimiter.push('_');
    }
    delimiter
}
