//! CLI argument definitions.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// jobsubmit - run shell commands as batch jobs on a cluster scheduler
#[derive(Parser, Debug)]
#[command(name = "jobsubmit")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Cluster profiles file (defaults to the user config directory)
    #[arg(long, global = true)]
    pub profiles: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Submit commands as jobs and wait for all of them
    Submit(SubmitArgs),

    /// Classify the logs of jobs from an earlier session
    Inspect {
        #[command(flatten)]
        cluster: ClusterArgs,

        /// Job ids to inspect
        #[arg(required = true)]
        job_ids: Vec<String>,
    },

    /// List configured cluster profiles
    Profiles,
}

/// Where jobs go and where their logs live.
#[derive(Args, Debug, Clone)]
pub struct ClusterArgs {
    /// Connection target, e.g. slurm://alice@login.example.org
    #[arg(short, long, conflicts_with = "profile")]
    pub target: Option<String>,

    /// Named cluster profile
    #[arg(short, long)]
    pub profile: Option<String>,

    /// Log directory root on the cluster (relative paths are under $HOME)
    #[arg(long)]
    pub log_root: Option<String>,

    /// Session namespace; logs go to <log-root>/<name>
    #[arg(short, long)]
    pub name: Option<String>,
}

#[derive(Args, Debug)]
pub struct SubmitArgs {
    #[command(flatten)]
    pub cluster: ClusterArgs,

    /// Job id; several commands run as <job-id>-<index>
    #[arg(long, default_value = "job")]
    pub job_id: String,

    /// Processors per job
    #[arg(long, default_value = "1")]
    pub nproc: i64,

    /// Scheduler queue or partition
    #[arg(short, long)]
    pub queue: Option<String>,

    /// Wall time limit, e.g. 01:00:00
    #[arg(short, long)]
    pub walltime: Option<String>,

    /// Memory per job, e.g. 4G
    #[arg(short, long)]
    pub mem: Option<String>,

    /// Memory per process
    #[arg(long)]
    pub pmem: Option<String>,

    /// Virtual memory per job
    #[arg(long)]
    pub vmem: Option<String>,

    /// Virtual memory per process
    #[arg(long)]
    pub pvmem: Option<String>,

    /// Environment override for the jobs (repeatable)
    #[arg(short, long = "env", value_name = "KEY=VALUE", value_parser = parse_env)]
    pub env: Vec<(String, String)>,

    /// Maximum jobs on the scheduler at once
    #[arg(short, long)]
    pub limit: Option<usize>,

    /// Seconds between consecutive submissions
    #[arg(long)]
    pub delay: Option<f64>,

    /// Seconds between status polls
    #[arg(long)]
    pub poll: Option<f64>,

    /// Read commands from a file, one per line
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    /// Output format for the final report
    #[arg(short, long, value_enum, default_value = "table")]
    pub output: OutputFormat,

    /// Commands to run, one job each
    #[arg(trailing_var_arg = true)]
    pub commands: Vec<String>,
}

/// Report formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Aligned table
    Table,
    /// JSON status report
    Json,
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {s:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_collects_trailing_commands() {
        let cli = Cli::parse_from([
            "jobsubmit", "submit", "-t", "slurm://login", "--limit", "2", "-e", "A=1", "echo a",
            "echo b",
        ]);
        let Commands::Submit(args) = cli.command else {
            panic!("expected submit");
        };
        assert_eq!(args.cluster.target.as_deref(), Some("slurm://login"));
        assert_eq!(args.limit, Some(2));
        assert_eq!(args.env, vec![("A".to_string(), "1".to_string())]);
        assert_eq!(args.commands, vec!["echo a", "echo b"]);
        assert_eq!(args.output, OutputFormat::Table);
    }

    #[test]
    fn env_needs_a_key() {
        assert!(parse_env("=1").is_err());
        assert!(parse_env("PATH").is_err());
        assert_eq!(parse_env("X=a=b").unwrap(), ("X".into(), "a=b".into()));
    }

    #[test]
    fn target_and_profile_conflict() {
        let parsed = Cli::try_parse_from([
            "jobsubmit", "inspect", "-t", "local://", "-p", "hpc", "job-1",
        ]);
        assert!(parsed.is_err());
    }
}
