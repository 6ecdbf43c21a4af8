//! Channel that runs command lines on this machine.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{CommandOutput, RemoteChannel};
use crate::error::{Error, Result};
use crate::process::{spawn_process, ProcessOptions};

const TARGET: &str = "local://";

/// Executes command lines with the local `bash`.
#[derive(Debug, Clone, Default)]
pub struct LocalChannel {
    timeout: Option<Duration>,
}

impl LocalChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill commands that run longer than `timeout`.
    pub const fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl RemoteChannel for LocalChannel {
    fn target(&self) -> &str {
        TARGET
    }

    async fn open(&mut self) -> Result<()> {
        Ok(())
    }

    async fn run(&mut self, command_line: &str) -> Result<CommandOutput> {
        debug!(command = command_line, "Running local command");
        let result = spawn_process(
            ProcessOptions::new("bash")
                .arg("-c")
                .arg(command_line)
                .timeout(self.timeout),
        )
        .await
        .map_err(|e| Error::connection(TARGET, e.to_string()))?;

        if result.timed_out {
            return Err(Error::connection(TARGET, "command timed out"));
        }

        Ok(CommandOutput {
            // Killed by a signal; report it the way the shell would.
            exit_code: result.code.unwrap_or(128),
            stdout: result.stdout,
            stderr: result.stderr,
        })
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
