//! Data models for jobs, their options and status reports.

mod job;
mod opts;
mod report;

pub use job::{Job, JobState, LogPaths};
pub use opts::{JobOpts, JobOptsBuilder, DEFAULT_SHELL, DEFAULT_WALLTIME};
pub use report::{JobStatusRow, StatusReport};
