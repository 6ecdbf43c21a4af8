//! Controller configuration, connection targets and cluster profiles.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::JobOpts;
use crate::scheduler::SchedulerKind;

/// Pause between consecutive submissions unless a call asks otherwise.
pub const DEFAULT_SUBMIT_DELAY: Duration = Duration::from_millis(50);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_SUBMIT_RETRIES: u32 = 3;
pub const DEFAULT_SUBMIT_BACKOFF: Duration = Duration::from_secs(1);
/// How long a job may be unlisted by the scheduler with no logs before it
/// is declared lost.
pub const DEFAULT_LOST_GRACE_PERIOD: Duration = Duration::from_secs(60);
pub const DEFAULT_POLL_FAILURE_LIMIT: u32 = 5;
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_LOG_ROOT: &str = "jobsubmit";
pub const DEFAULT_NAMESPACE: &str = "default";

/// Which scheduler to drive and where it lives.
///
/// Written as `scheme://[user@]host[:port]` with scheme `sge`, `pbs`,
/// `slurm` or `local`. Without a host, commands run on this machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    pub scheduler: SchedulerKind,
    pub user: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
}

impl ConnectionTarget {
    /// Background processes on this machine.
    pub const fn local() -> Self {
        Self {
            scheduler: SchedulerKind::Local,
            user: None,
            host: None,
            port: None,
        }
    }

    /// Parse a target URL.
    pub fn parse(url: &str) -> Result<Self> {
        let invalid = |why: &str| Error::Config(format!("invalid target {url:?}: {why}"));

        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| invalid("expected scheme://[user@]host[:port]"))?;
        let scheduler = SchedulerKind::from_str(scheme)
            .ok_or_else(|| invalid("scheme must be one of sge, pbs, slurm, local"))?;

        let authority = rest.trim_end_matches('/');
        if authority.contains('/') {
            return Err(invalid("paths are not supported"));
        }
        if authority.is_empty() {
            return Ok(Self {
                scheduler,
                user: None,
                host: None,
                port: None,
            });
        }
        if scheduler == SchedulerKind::Local {
            return Err(invalid("local targets take no host"));
        }

        let (user, host_port) = match authority.rsplit_once('@') {
            Some((user, host_port)) if !user.is_empty() => (Some(user.to_string()), host_port),
            Some(_) => return Err(invalid("empty user name")),
            None => (None, authority),
        };
        let (host, port) = match host_port.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| invalid("bad port"))?;
                (host, Some(port))
            }
            None => (host_port, None),
        };
        if host.is_empty() {
            return Err(invalid("empty host name"));
        }

        Ok(Self {
            scheduler,
            user,
            host: Some(host.to_string()),
            port,
        })
    }

    /// `[user@]host` for `ssh`, or `None` when commands run locally.
    pub fn ssh_destination(&self) -> Option<String> {
        let host = self.host.as_deref()?;
        Some(match self.user.as_deref() {
            Some(user) => format!("{user}@{host}"),
            None => host.to_string(),
        })
    }
}

impl Default for ConnectionTarget {
    fn default() -> Self {
        Self::local()
    }
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.scheduler)?;
        if let Some(ref destination) = self.ssh_destination() {
            write!(f, "{destination}")?;
        }
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        Ok(())
    }
}

impl FromStr for ConnectionTarget {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Everything the controller needs to know before connecting.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub target: ConnectionTarget,
    /// Subdirectory of `log_root` holding this session's logs.
    pub namespace: String,
    /// Log directory root; relative paths are resolved against the remote `$HOME`.
    pub log_root: String,
    /// Options new jobs start from.
    pub defaults: JobOpts,
    /// Maximum jobs submitted or running at once; `None` is unbounded.
    pub concurrent_job_limit: Option<usize>,
    pub submit_delay: Duration,
    pub poll_interval: Duration,
    pub submit_retries: u32,
    pub submit_backoff: Duration,
    pub lost_grace_period: Duration,
    pub poll_failure_limit: u32,
    pub command_timeout: Option<Duration>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            target: ConnectionTarget::local(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            log_root: DEFAULT_LOG_ROOT.to_string(),
            defaults: JobOpts::default(),
            concurrent_job_limit: None,
            submit_delay: DEFAULT_SUBMIT_DELAY,
            poll_interval: DEFAULT_POLL_INTERVAL,
            submit_retries: DEFAULT_SUBMIT_RETRIES,
            submit_backoff: DEFAULT_SUBMIT_BACKOFF,
            lost_grace_period: DEFAULT_LOST_GRACE_PERIOD,
            poll_failure_limit: DEFAULT_POLL_FAILURE_LIMIT,
            command_timeout: Some(DEFAULT_COMMAND_TIMEOUT),
        }
    }
}

impl ControllerConfig {
    pub fn new(target: ConnectionTarget) -> Self {
        Self {
            target,
            ..Self::default()
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_log_root(mut self, log_root: impl Into<String>) -> Self {
        self.log_root = log_root.into();
        self
    }

    pub fn with_defaults(mut self, defaults: JobOpts) -> Self {
        self.defaults = defaults;
        self
    }

    pub const fn with_concurrent_job_limit(mut self, limit: Option<usize>) -> Self {
        self.concurrent_job_limit = limit;
        self
    }

    pub const fn with_submit_delay(mut self, delay: Duration) -> Self {
        self.submit_delay = delay;
        self
    }

    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub const fn with_submit_retries(mut self, retries: u32) -> Self {
        self.submit_retries = retries;
        self
    }

    pub const fn with_submit_backoff(mut self, backoff: Duration) -> Self {
        self.submit_backoff = backoff;
        self
    }

    pub const fn with_lost_grace_period(mut self, grace: Duration) -> Self {
        self.lost_grace_period = grace;
        self
    }

    pub const fn with_poll_failure_limit(mut self, limit: u32) -> Self {
        self.poll_failure_limit = limit;
        self
    }

    pub const fn with_command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Default options under the given job id.
    pub fn job_opts(&self, job_id: impl Into<String>) -> Result<JobOpts> {
        self.defaults.with_job_id(job_id)
    }

    /// Reject settings the controller cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty()
            || self.namespace.contains('/')
            || self.namespace.starts_with('.')
        {
            return Err(Error::Config(format!(
                "namespace {:?} must be a plain directory name",
                self.namespace
            )));
        }
        if self.log_root.trim().is_empty() {
            return Err(Error::Config("log root must not be empty".to_string()));
        }
        if self.concurrent_job_limit == Some(0) {
            return Err(Error::Config(
                "concurrent job limit must be at least 1".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::Config("poll interval must be positive".to_string()));
        }
        Ok(())
    }
}

/// One `[clusters.<name>]` table of the profiles file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterProfile {
    /// Connection target URL.
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_root: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrent_job_limit: Option<usize>,
    /// Default queue for jobs on this cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
}

impl ClusterProfile {
    /// Controller configuration for this cluster.
    pub fn to_config(&self) -> Result<ControllerConfig> {
        let mut config = ControllerConfig::new(self.target.parse()?)
            .with_concurrent_job_limit(self.concurrent_job_limit);
        if let Some(ref log_root) = self.log_root {
            config = config.with_log_root(log_root.clone());
        }
        if let Some(ref queue) = self.queue {
            config.defaults = config.defaults.to_builder().queue(queue.clone()).build()?;
        }
        Ok(config)
    }
}

/// Named cluster profiles, as loaded from `clusters.toml`.
///
/// ```toml
/// [clusters.hpc]
/// target = "slurm://alice@login.hpc.example.org"
/// log_root = "/scratch/alice/jobs"
/// concurrent_job_limit = 200
/// queue = "short"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterProfiles {
    #[serde(default)]
    pub clusters: BTreeMap<String, ClusterProfile>,
}

impl ClusterProfiles {
    /// `$XDG_CONFIG_HOME/jobsubmit/clusters.toml` or the platform equivalent.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("jobsubmit").join("clusters.toml"))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(format!("invalid profiles file: {e}")))
    }

    /// Load profiles from `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read profiles file {}: {e}", path.display()))
        })?;
        Self::from_toml(&text)
    }

    /// Load from `path` if given, otherwise from [`default_path`](Self::default_path).
    /// A missing default file yields no profiles.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::load(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn get(&self, name: &str) -> Result<&ClusterProfile> {
        self.clusters
            .get(name)
            .ok_or_else(|| Error::Config(format!("no cluster profile named {name:?}")))
    }
}
