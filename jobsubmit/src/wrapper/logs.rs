//! Reading job logs back from the remote host.

use crate::error::FailureReason;
use crate::models::LogPaths;

use super::{shell_quote, DONE_SENTINEL, ERROR_SENTINEL};

/// Separates stderr from stdout in the output of [`inspect_command`].
pub const LOG_BOUNDARY: &str = "--8<-- jobsubmit stdout --8<--";

/// What [`inspect_command`] found for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogReport {
    /// The final logs exist.
    Final { stdout: String, stderr: String },
    /// Only temporary logs exist: the job is running, or died before
    /// promoting them.
    Partial,
    /// No logs at all.
    Missing,
}

/// Most bytes of each log that [`inspect_command`] sends back: the head of
/// stdout and the tail of stderr, where the sentinel lives.
pub const MAX_LOG_BYTES: u64 = 8 * 1024 * 1024;

/// Command line reporting the state and content of a job's logs.
///
/// Output is a header line (`final <stderr bytes>`, `partial` or
/// `missing`); for `final` it is followed by the stderr log, a newline,
/// [`LOG_BOUNDARY`] on its own line and the stdout log. Each log is cut
/// to [`MAX_LOG_BYTES`].
pub fn inspect_command(paths: &LogPaths) -> String {
    inspect_command_with_limit(paths, MAX_LOG_BYTES)
}

fn inspect_command_with_limit(paths: &LogPaths, limit: u64) -> String {
    let out = shell_quote(&paths.stdout);
    let err = shell_quote(&paths.stderr);
    let out_tmp = shell_quote(&paths.stdout_tmp());
    let err_tmp = shell_quote(&paths.stderr_tmp());
    let boundary = shell_quote(LOG_BOUNDARY);
    format!(
        "if [ -e {err} ]; then \
            printf 'final %s\\n' \"$(tail -c {limit} {err} | wc -c | tr -d ' ')\"; \
            tail -c {limit} {err}; \
            printf '\\n%s\\n' {boundary}; head -c {limit} {out} 2>/dev/null; true; \
         elif [ -e {err_tmp} ] || [ -e {out_tmp} ]; then echo partial; \
         else echo missing; fi"
    )
}

/// Parse the output of [`inspect_command`]. Returns `None` when it is not
/// in the expected shape.
///
/// Lines before the header, such as a login banner, are skipped.
pub fn parse_log_report(output: &[u8]) -> Option<LogReport> {
    let mut rest = output;
    while let Some(newline) = rest.iter().position(|&b| b == b'\n') {
        let line = String::from_utf8_lossy(&rest[..newline]);
        let body = &rest[newline + 1..];
        match line.trim() {
            "missing" => return Some(LogReport::Missing),
            "partial" => return Some(LogReport::Partial),
            header => {
                if let Some(len) = header
                    .strip_prefix("final ")
                    .and_then(|n| n.trim().parse::<usize>().ok())
                {
                    return parse_final(body, len);
                }
            }
        }
        rest = body;
    }
    None
}

fn parse_final(body: &[u8], len: usize) -> Option<LogReport> {
    let separator = format!("\n{LOG_BOUNDARY}\n");
    let (stderr, stdout) =
        if body.len() >= len && body[len..].starts_with(separator.as_bytes()) {
            (&body[..len], &body[len + separator.len()..])
        } else {
            // Log changed between measuring and reading; fall back to the boundary.
            let at = find(body, separator.as_bytes())?;
            (&body[..at], &body[at + separator.len()..])
        };
    Some(LogReport::Final {
        stdout: String::from_utf8_lossy(stdout).into_owned(),
        stderr: String::from_utf8_lossy(stderr).into_owned(),
    })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Classify a final stderr log.
///
/// Any `ERROR!` line means the command failed; otherwise the last
/// non-empty line must be `DONE!`.
pub fn verdict(stderr: &str) -> Result<(), FailureReason> {
    if stderr.lines().any(|line| line.trim() == ERROR_SENTINEL) {
        return Err(FailureReason::CommandFailed);
    }
    match stderr.lines().rev().map(str::trim).find(|line| !line.is_empty()) {
        Some(DONE_SENTINEL) => Ok(()),
        _ => Err(FailureReason::MissingSentinel),
    }
}
