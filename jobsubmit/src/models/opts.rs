//! Resource options shared by one or more jobs.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::error::{Error, Result};

/// Default walltime requested when none is given, `hh:mm:ss`.
pub const DEFAULT_WALLTIME: &str = "02:00:00";

/// Default interpreter for generated job scripts.
pub const DEFAULT_SHELL: &str = "/bin/bash";

static JOB_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9._-]{0,199}$").expect("valid regex"));

static MEM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\d+(\.\d+)?([kmgtp](b|ib)?)?$").expect("valid regex")
});

static ENV_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid regex"));

/// Validated, immutable resource request for a job.
///
/// Build one with [`JobOpts::builder`]; invalid values are rejected by
/// [`JobOptsBuilder::build`] before anything reaches the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobOpts {
    job_id: String,
    nproc: u32,
    queue: Option<String>,
    walltime: String,
    mem: Option<String>,
    pmem: Option<String>,
    vmem: Option<String>,
    pvmem: Option<String>,
    gpus: Option<u32>,
    account: Option<String>,
    email: Option<String>,
    working_dir: Option<String>,
    shell: String,
    env: BTreeMap<String, String>,
}

impl JobOpts {
    /// Start building options for the given job id.
    pub fn builder(job_id: impl Into<String>) -> JobOptsBuilder {
        JobOptsBuilder::new(job_id)
    }

    /// Reopen these options for modification.
    pub fn to_builder(&self) -> JobOptsBuilder {
        JobOptsBuilder {
            job_id: self.job_id.clone(),
            nproc: i64::from(self.nproc),
            queue: self.queue.clone(),
            walltime: self.walltime.clone(),
            mem: self.mem.clone(),
            pmem: self.pmem.clone(),
            vmem: self.vmem.clone(),
            pvmem: self.pvmem.clone(),
            gpus: self.gpus.map(i64::from),
            account: self.account.clone(),
            email: self.email.clone(),
            working_dir: self.working_dir.clone(),
            shell: self.shell.clone(),
            env: self.env.clone(),
        }
    }

    /// Same options under a different job id.
    pub fn with_job_id(&self, job_id: impl Into<String>) -> Result<Self> {
        let job_id = job_id.into();
        validate_job_id(&job_id)?;
        Ok(Self {
            job_id,
            ..self.clone()
        })
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub const fn nproc(&self) -> u32 {
        self.nproc
    }

    pub fn queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    pub fn walltime(&self) -> &str {
        &self.walltime
    }

    pub fn mem(&self) -> Option<&str> {
        self.mem.as_deref()
    }

    pub fn pmem(&self) -> Option<&str> {
        self.pmem.as_deref()
    }

    pub fn vmem(&self) -> Option<&str> {
        self.vmem.as_deref()
    }

    pub fn pvmem(&self) -> Option<&str> {
        self.pvmem.as_deref()
    }

    pub const fn gpus(&self) -> Option<u32> {
        self.gpus
    }

    pub fn account(&self) -> Option<&str> {
        self.account.as_deref()
    }

    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    pub fn working_dir(&self) -> Option<&str> {
        self.working_dir.as_deref()
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }

    pub const fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }
}

impl Default for JobOpts {
    /// One core, default walltime and shell, job id `job`.
    fn default() -> Self {
        Self {
            job_id: "job".to_string(),
            nproc: 1,
            queue: None,
            walltime: DEFAULT_WALLTIME.to_string(),
            mem: None,
            pmem: None,
            vmem: None,
            pvmem: None,
            gpus: None,
            account: None,
            email: None,
            working_dir: None,
            shell: DEFAULT_SHELL.to_string(),
            env: BTreeMap::new(),
        }
    }
}

/// Builder for [`JobOpts`].
///
/// Counts are taken as signed integers so that nonsense such as `-1` cores
/// is reported as a validation error rather than silently wrapping.
#[derive(Debug, Clone)]
pub struct JobOptsBuilder {
    job_id: String,
    nproc: i64,
    queue: Option<String>,
    walltime: String,
    mem: Option<String>,
    pmem: Option<String>,
    vmem: Option<String>,
    pvmem: Option<String>,
    gpus: Option<i64>,
    account: Option<String>,
    email: Option<String>,
    working_dir: Option<String>,
    shell: String,
    env: BTreeMap<String, String>,
}

impl JobOptsBuilder {
    fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            nproc: 1,
            queue: None,
            walltime: DEFAULT_WALLTIME.to_string(),
            mem: None,
            pmem: None,
            vmem: None,
            pvmem: None,
            gpus: None,
            account: None,
            email: None,
            working_dir: None,
            shell: DEFAULT_SHELL.to_string(),
            env: BTreeMap::new(),
        }
    }

    /// Set the job id.
    pub fn job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = job_id.into();
        self
    }

    /// Number of processors per node.
    pub const fn nproc(mut self, nproc: i64) -> Self {
        self.nproc = nproc;
        self
    }

    /// Scheduler queue (partition on Slurm).
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    /// Maximum run time, e.g. `01:30:00`.
    pub fn walltime(mut self, walltime: impl Into<String>) -> Self {
        self.walltime = walltime.into();
        self
    }

    /// Memory per node, e.g. `1700M`.
    pub fn mem(mut self, mem: impl Into<String>) -> Self {
        self.mem = Some(mem.into());
        self
    }

    /// Memory per process.
    pub fn pmem(mut self, pmem: impl Into<String>) -> Self {
        self.pmem = Some(pmem.into());
        self
    }

    /// Virtual memory for the whole job. Not every scheduler enforces it.
    pub fn vmem(mut self, vmem: impl Into<String>) -> Self {
        self.vmem = Some(vmem.into());
        self
    }

    /// Virtual memory per process.
    pub fn pvmem(mut self, pvmem: impl Into<String>) -> Self {
        self.pvmem = Some(pvmem.into());
        self
    }

    pub const fn gpus(mut self, gpus: i64) -> Self {
        self.gpus = Some(gpus);
        self
    }

    pub fn account(mut self, account: impl Into<String>) -> Self {
        self.account = Some(account.into());
        self
    }

    /// Address the scheduler mails when a job aborts.
    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Set an environment variable for the job.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set multiple environment variables.
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in vars {
            self.env.insert(k.into(), v.into());
        }
        self
    }

    /// Validate and freeze the options.
    pub fn build(self) -> Result<JobOpts> {
        validate_job_id(&self.job_id)?;

        if self.nproc <= 0 {
            return Err(Error::validation(format!(
                "nproc must be a positive integer, got {}",
                self.nproc
            )));
        }
        let nproc = u32::try_from(self.nproc)
            .map_err(|_| Error::validation(format!("nproc {} is out of range", self.nproc)))?;

        let gpus = match self.gpus {
            Some(g) if g <= 0 => {
                return Err(Error::validation(format!(
                    "gpus must be a positive integer, got {g}"
                )))
            }
            Some(g) => Some(
                u32::try_from(g)
                    .map_err(|_| Error::validation(format!("gpus {g} is out of range")))?,
            ),
            None => None,
        };

        validate_walltime(&self.walltime)?;
        for (name, value) in [
            ("mem", &self.mem),
            ("pmem", &self.pmem),
            ("vmem", &self.vmem),
            ("pvmem", &self.pvmem),
        ] {
            if let Some(value) = value {
                validate_mem(name, value)?;
            }
        }

        for key in self.env.keys() {
            if !ENV_KEY_RE.is_match(key) {
                return Err(Error::validation(format!(
                    "environment variable name {key:?} is not a valid shell identifier"
                )));
            }
        }

        if self.shell.trim().is_empty() {
            return Err(Error::validation("shell must not be empty"));
        }
        if matches!(self.queue.as_deref(), Some(q) if q.trim().is_empty()) {
            return Err(Error::validation("queue must not be empty when given"));
        }

        Ok(JobOpts {
            job_id: self.job_id,
            nproc,
            queue: self.queue,
            walltime: self.walltime,
            mem: self.mem,
            pmem: self.pmem,
            vmem: self.vmem,
            pvmem: self.pvmem,
            gpus,
            account: self.account,
            email: self.email,
            working_dir: self.working_dir,
            shell: self.shell,
            env: self.env,
        })
    }
}

fn validate_job_id(job_id: &str) -> Result<()> {
    if JOB_ID_RE.is_match(job_id) {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "job id {job_id:?} must be 1-200 characters of [A-Za-z0-9._-] and not start with '.' or '-'"
        )))
    }
}

/// Accepts `N` (minutes), `MM:SS`, `HH:MM:SS` and `D-HH[:MM[:SS]]`.
fn validate_walltime(walltime: &str) -> Result<()> {
    let invalid = || {
        Error::validation(format!(
            "walltime {walltime:?} is not one of N, MM:SS, HH:MM:SS or D-HH:MM:SS"
        ))
    };

    let (days, clock) = match walltime.split_once('-') {
        Some((d, rest)) => (Some(d), rest),
        None => (None, walltime),
    };
    if let Some(d) = days {
        if d.is_empty() || !d.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
    }

    let fields: Vec<&str> = clock.split(':').collect();
    if fields.is_empty() || fields.len() > 3 {
        return Err(invalid());
    }
    for (i, field) in fields.iter().enumerate() {
        if field.is_empty() || !field.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let leading = i == 0;
        if !leading {
            if field.len() != 2 {
                return Err(invalid());
            }
            let value: u32 = field.parse().map_err(|_| invalid())?;
            if value >= 60 {
                return Err(invalid());
            }
        }
    }
    if days.is_some() {
        let hours: u32 = fields[0].parse().map_err(|_| invalid())?;
        if hours >= 24 {
            return Err(invalid());
        }
    }
    Ok(())
}

fn validate_mem(name: &str, value: &str) -> Result<()> {
    if MEM_RE.is_match(value) {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "{name} {value:?} must be a number with an optional K/M/G/T/P unit"
        )))
    }
}
