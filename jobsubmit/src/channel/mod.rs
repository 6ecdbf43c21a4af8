//! Remote execution channels.
//!
//! A channel runs shell command lines on the cluster head node and hands
//! back the exit status together with everything the command printed.
//! The controller owns exactly one channel for its whole lifetime.

mod local;
mod ssh;

use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::config::ConnectionTarget;
use crate::error::{Error, Result};

pub use local::LocalChannel;
pub use ssh::SshChannel;

/// Outcome of one remote command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Trimmed stderr, or the exit code when stderr is empty.
    pub fn error_message(&self) -> String {
        let stderr = self.stderr_str();
        let stderr = stderr.trim();
        if stderr.is_empty() {
            format!("exit status {}", self.exit_code)
        } else {
            stderr.to_string()
        }
    }
}

/// A connection to a host that can execute shell command lines.
///
/// A non-zero exit of the command itself is reported through
/// [`CommandOutput::exit_code`]; only transport problems are errors.
#[async_trait]
pub trait RemoteChannel: Send {
    /// Where this channel points, for messages.
    fn target(&self) -> &str;

    /// Establish the connection. Calling it on an open channel is a no-op.
    async fn open(&mut self) -> Result<()>;

    /// Execute `command_line` under `bash`.
    async fn run(&mut self, command_line: &str) -> Result<CommandOutput>;

    /// Re-establish a connection that may have dropped.
    async fn reconnect(&mut self) -> Result<()> {
        Ok(())
    }

    /// Tear the connection down.
    async fn close(&mut self) -> Result<()>;
}

/// Run a command, retrying exactly once after a transient failure.
///
/// The second failure is returned as is.
pub async fn run_with_retry(
    channel: &mut dyn RemoteChannel,
    command_line: &str,
) -> Result<CommandOutput> {
    match channel.run(command_line).await {
        Err(err) if err.is_transient() => {
            warn!(remote = channel.target(), error = %err, "Remote command failed, retrying once");
            if let Err(reconnect_err) = channel.reconnect().await {
                warn!(remote = channel.target(), error = %reconnect_err, "Reconnect failed");
            }
            channel.run(command_line).await
        }
        other => other,
    }
}

/// Absolute path on the remote side: relative paths (and `~/`) are taken
/// from the remote `$HOME`.
pub async fn resolve_path(channel: &mut dyn RemoteChannel, path: &str) -> Result<String> {
    if path.starts_with('/') {
        return Ok(path.to_string());
    }
    let output = run_with_retry(channel, r#"printf '%s' "$HOME""#).await?;
    let home = output.stdout_str();
    let home = home.trim();
    if !output.success() || !home.starts_with('/') {
        return Err(Error::connection(
            channel.target(),
            format!("cannot resolve remote home directory: {}", output.error_message()),
        ));
    }
    let relative = path.strip_prefix("~/").unwrap_or(path);
    let relative = if relative == "~" { "" } else { relative };
    Ok(format!("{}/{}", home.trim_end_matches('/'), relative)
        .trim_end_matches('/')
        .to_string())
}

/// Build the channel a connection target calls for: local targets run
/// commands on this machine, everything else goes through `ssh`.
pub fn for_target(
    target: &ConnectionTarget,
    command_timeout: Option<Duration>,
) -> Box<dyn RemoteChannel> {
    match target.ssh_destination() {
        Some(destination) => Box::new(
            SshChannel::new(destination, target.port).with_timeout(command_timeout),
        ),
        None => Box::new(LocalChannel::new().with_timeout(command_timeout)),
    }
}
