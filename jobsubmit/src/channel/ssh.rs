//! Channel over the system `ssh` client.
//!
//! One multiplexing master connection is started on open; every command
//! then rides on it through a private control socket, so authentication
//! happens once per session.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{CommandOutput, RemoteChannel};
use crate::error::{Error, Result};
use crate::process::{spawn_process, ProcessOptions};
use crate::wrapper::shell_quote;

/// `ssh` exits with 255 when the transport itself failed.
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// How long establishing the master connection may take.
const OPEN_TIMEOUT: Duration = Duration::from_secs(60);

/// Executes command lines on a remote host through `ssh`.
#[derive(Debug)]
pub struct SshChannel {
    destination: String,
    port: Option<u16>,
    control_path: PathBuf,
    timeout: Option<Duration>,
    options: Vec<String>,
    is_open: bool,
}

impl SshChannel {
    /// Channel to `[user@]host`, optionally on a non-default port.
    pub fn new(destination: impl Into<String>, port: Option<u16>) -> Self {
        let control_path =
            std::env::temp_dir().join(format!("jobsubmit-{}.sock", Uuid::now_v7().simple()));
        Self {
            destination: destination.into(),
            port,
            control_path,
            timeout: None,
            options: Vec::new(),
            is_open: false,
        }
    }

    /// Kill commands that run longer than `timeout`.
    pub const fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Pass an extra `-o` option to every `ssh` invocation.
    pub fn with_option(mut self, option: impl Into<String>) -> Self {
        self.options.push(option.into());
        self
    }

    pub const fn is_open(&self) -> bool {
        self.is_open
    }

    /// Arguments shared by every invocation, up to but excluding the destination.
    fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", self.control_path.display()),
        ];
        if let Some(port) = self.port {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        for option in &self.options {
            args.push("-o".to_string());
            args.push(option.clone());
        }
        args
    }

    async fn ssh(&self, extra: &[&str], timeout: Option<Duration>) -> Result<CommandOutput> {
        let options = ProcessOptions::new("ssh")
            .args(self.base_args())
            .args(extra.iter().copied())
            .timeout(timeout);

        let result = spawn_process(options)
            .await
            .map_err(|e| Error::connection(&self.destination, e.to_string()))?;

        if result.timed_out {
            return Err(Error::connection(&self.destination, "ssh command timed out"));
        }

        Ok(CommandOutput {
            exit_code: result.code.unwrap_or(SSH_TRANSPORT_FAILURE),
            stdout: result.stdout,
            stderr: result.stderr,
        })
    }

    fn exit_master_command(&self) -> std::process::Command {
        let mut command = std::process::Command::new("ssh");
        command
            .args(self.base_args())
            .args(["-O", "exit", &self.destination])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        command
    }

    async fn master_alive(&self) -> bool {
        matches!(
            self.ssh(&["-O", "check", &self.destination], Some(OPEN_TIMEOUT)).await,
            Ok(output) if output.success()
        )
    }
}

#[async_trait]
impl RemoteChannel for SshChannel {
    fn target(&self) -> &str {
        &self.destination
    }

    async fn open(&mut self) -> Result<()> {
        if self.is_open {
            return Ok(());
        }

        info!(destination = %self.destination, "Opening ssh master connection");
        let output = self
            .ssh(
                &["-o", "ControlMaster=yes", "-M", "-N", "-f", &self.destination],
                Some(OPEN_TIMEOUT),
            )
            .await?;

        if !output.success() {
            return Err(Error::connection(&self.destination, output.error_message()));
        }

        self.is_open = true;
        Ok(())
    }

    async fn run(&mut self, command_line: &str) -> Result<CommandOutput> {
        if !self.is_open {
            return Err(Error::connection(&self.destination, "channel is not open"));
        }

        debug!(destination = %self.destination, command = command_line, "Running remote command");
        let remote = format!("bash -c {}", shell_quote(command_line));
        let output = self
            .ssh(
                &["-o", "ControlMaster=no", &self.destination, "--", &remote],
                self.timeout,
            )
            .await?;

        if output.exit_code == SSH_TRANSPORT_FAILURE {
            return Err(Error::connection(&self.destination, output.error_message()));
        }

        Ok(output)
    }

    async fn reconnect(&mut self) -> Result<()> {
        if self.is_open && self.master_alive().await {
            return Ok(());
        }
        warn!(destination = %self.destination, "ssh master connection lost, reopening");
        self.is_open = false;
        self.open().await
    }

    async fn close(&mut self) -> Result<()> {
        if !self.is_open {
            return Ok(());
        }
        self.is_open = false;

        info!(destination = %self.destination, "Closing ssh master connection");
        let output = self
            .ssh(&["-O", "exit", &self.destination], Some(OPEN_TIMEOUT))
            .await?;
        let _ = std::fs::remove_file(&self.control_path);

        if output.success() {
            Ok(())
        } else {
            Err(Error::connection(&self.destination, output.error_message()))
        }
    }
}

/// Stops a master connection that [`close`](RemoteChannel::close) never
/// stopped. Inside a runtime the request is sent without waiting for it;
/// the master removes its own socket when it exits.
impl Drop for SshChannel {
    fn drop(&mut self) {
        if !self.is_open {
            return;
        }
        let result = if tokio::runtime::Handle::try_current().is_ok() {
            tokio::process::Command::from(self.exit_master_command())
                .spawn()
                .map(drop)
        } else {
            self.exit_master_command().status().map(drop)
        };
        if let Err(e) = result {
            warn!(destination = %self.destination, error = %e, "Failed to stop ssh master");
        }
    }
}
