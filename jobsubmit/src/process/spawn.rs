//! One-shot child processes with captured output.
//!
//! Both channels shell out: `bash -c` for local targets, the `ssh` client
//! for remote ones. Output is kept as raw bytes; job logs are not
//! guaranteed to be UTF-8.

use std::io;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;

/// What to run.
#[derive(Debug, Clone, Default)]
pub struct ProcessOptions {
    pub program: String,
    pub args: Vec<String>,
    /// Kill the child if it has not exited by then.
    pub timeout: Option<Duration>,
}

impl ProcessOptions {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub const fn timeout(mut self, limit: Option<Duration>) -> Self {
        self.timeout = limit;
        self
    }
}

/// How a child ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessResult {
    /// `None` when a signal ended the child or the timeout fired.
    pub code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
}

impl ProcessResult {
    pub fn success(&self) -> bool {
        self.code == Some(0) && !self.timed_out
    }

    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Run `options.program` to completion and collect its output.
///
/// Only a failure to start the program is an error. stdin is closed so a
/// child waiting for input (an `ssh` password prompt, say) fails instead of
/// hanging.
pub async fn spawn_process(options: ProcessOptions) -> io::Result<ProcessResult> {
    let child = Command::new(&options.program)
        .args(&options.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| io::Error::new(e.kind(), format!("cannot start {}: {e}", options.program)))?;

    let output = match options.timeout {
        None => child.wait_with_output().await?,
        Some(limit) => match timeout(limit, child.wait_with_output()).await {
            Ok(output) => output?,
            // The child was dropped with the future and killed.
            Err(_) => {
                return Ok(ProcessResult {
                    timed_out: true,
                    ..ProcessResult::default()
                })
            }
        },
    };

    Ok(ProcessResult {
        code: output.status.code(),
        stdout: output.stdout,
        stderr: output.stderr,
        timed_out: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bash(script: &str) -> ProcessOptions {
        ProcessOptions::new("bash").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn captures_both_streams_and_exit_code() {
        let result = spawn_process(bash("printf 'a b'; echo oops >&2; exit 7"))
            .await
            .unwrap();
        assert_eq!(result.code, Some(7));
        assert!(!result.success());
        assert_eq!(result.stdout_string(), "a b");
        assert_eq!(result.stderr_string(), "oops\n");
    }

    #[tokio::test]
    async fn arguments_are_not_reparsed() {
        let result = spawn_process(ProcessOptions::new("printf").args(["%s|", "x y", "$HOME"]))
            .await
            .unwrap();
        assert!(result.success());
        assert_eq!(result.stdout_string(), "x y|$HOME|");
    }

    #[tokio::test]
    async fn stdin_is_closed() {
        let result = spawn_process(bash("cat; echo eof")).await.unwrap();
        assert_eq!(result.stdout_string(), "eof\n");
    }

    #[tokio::test]
    async fn signal_death_has_no_code() {
        let result = spawn_process(bash("kill -KILL $$")).await.unwrap();
        assert_eq!(result.code, None);
        assert!(!result.timed_out);
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let result = spawn_process(bash("sleep 10").timeout(Some(Duration::from_millis(100))))
            .await
            .unwrap();
        assert!(result.timed_out);
        assert!(!result.success());
    }

    #[tokio::test]
    async fn missing_program_is_an_error() {
        let err = spawn_process(ProcessOptions::new("jobsubmit-no-such-program"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(err.to_string().contains("jobsubmit-no-such-program"));
    }
}
