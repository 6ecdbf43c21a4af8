//! jobsubmit - run shell commands as batch jobs on a cluster scheduler.
//!
//! Commands are wrapped in a generated script, submitted to SGE, PBS/Torque,
//! Slurm or a plain local shell, and tracked by a single control loop that
//! polls the scheduler and reads the logs each job leaves behind.
//!
//! Architecture:
//! - `channel` runs command lines on the head node (over `ssh` or locally)
//! - `scheduler` knows each scheduler's submit/status/cancel commands
//! - `wrapper` renders the job script and reads its logs back
//! - `controller` owns the channel and resolves one future per job

pub mod channel;
pub mod config;
pub mod controller;
pub mod error;
pub mod models;
pub mod process;
pub mod scheduler;
pub mod wrapper;

pub use channel::{CommandOutput, LocalChannel, RemoteChannel, SshChannel};
pub use config::{ClusterProfile, ClusterProfiles, ConnectionTarget, ControllerConfig};
pub use controller::{Controller, JobHandle, JobOutcome};
pub use error::{Error, FailureReason, Result};
pub use models::{JobOpts, JobOptsBuilder, JobState, JobStatusRow, StatusReport};
pub use scheduler::{SchedulerDialect, SchedulerKind};
