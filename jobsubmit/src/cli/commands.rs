//! CLI command execution.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::info;

use jobsubmit::channel::{self, resolve_path, run_with_retry};
use jobsubmit::models::LogPaths;
use jobsubmit::wrapper::{inspect_command, parse_log_report, verdict, LogReport};
use jobsubmit::{
    ClusterProfiles, ConnectionTarget, Controller, ControllerConfig, JobOpts, JobState,
    StatusReport,
};

use super::args::{Cli, ClusterArgs, Commands, OutputFormat, SubmitArgs};

// === Command Execution ===

pub async fn execute(cli: Cli) -> Result<()> {
    let profiles = cli.profiles.as_deref();
    match cli.command {
        Commands::Submit(args) => submit(args, profiles).await,
        Commands::Inspect { cluster, job_ids } => inspect(&cluster, &job_ids, profiles).await,
        Commands::Profiles => list_profiles(profiles),
    }
}

/// Controller configuration from a profile or target plus overrides.
fn cluster_config(args: &ClusterArgs, profiles: Option<&Path>) -> Result<ControllerConfig> {
    let mut config = if let Some(ref name) = args.profile {
        let loaded =
            ClusterProfiles::load_or_default(profiles).context("Failed to load cluster profiles")?;
        loaded.get(name)?.to_config()?
    } else if let Some(ref target) = args.target {
        let target = ConnectionTarget::parse(target)
            .with_context(|| format!("Invalid target {target}"))?;
        ControllerConfig::new(target)
    } else {
        ControllerConfig::default()
    };

    if let Some(ref log_root) = args.log_root {
        config = config.with_log_root(log_root.clone());
    }
    if let Some(ref name) = args.name {
        config = config.with_namespace(name.clone());
    }
    Ok(config)
}

fn seconds(value: f64, flag: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .with_context(|| format!("--{flag} must be a non-negative number of seconds"))
}

/// Commands from the arguments followed by those in `--file`.
fn collect_commands(args: &SubmitArgs) -> Result<Vec<String>> {
    let mut commands = args.commands.clone();
    if let Some(ref path) = args.file {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        commands.extend(
            text.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string),
        );
    }
    if commands.is_empty() {
        bail!("No commands given; pass them as arguments or with --file");
    }
    Ok(commands)
}

async fn submit(args: SubmitArgs, profiles: Option<&Path>) -> Result<()> {
    let commands = collect_commands(&args)?;
    let mut config = cluster_config(&args.cluster, profiles)?;

    if args.limit.is_some() {
        config = config.with_concurrent_job_limit(args.limit);
    }
    if let Some(delay) = args.delay {
        config = config.with_submit_delay(seconds(delay, "delay")?);
    }
    if let Some(poll) = args.poll {
        config = config.with_poll_interval(seconds(poll, "poll")?);
    }

    let mut builder = config
        .defaults
        .to_builder()
        .job_id(args.job_id.clone())
        .nproc(args.nproc)
        .envs(args.env.clone());
    if let Some(ref queue) = args.queue {
        builder = builder.queue(queue.clone());
    }
    if let Some(ref walltime) = args.walltime {
        builder = builder.walltime(walltime.clone());
    }
    if let Some(ref mem) = args.mem {
        builder = builder.mem(mem.clone());
    }
    if let Some(ref pmem) = args.pmem {
        builder = builder.pmem(pmem.clone());
    }
    if let Some(ref vmem) = args.vmem {
        builder = builder.vmem(vmem.clone());
    }
    if let Some(ref pvmem) = args.pvmem {
        builder = builder.pvmem(pvmem.clone());
    }
    let opts = builder.build()?;

    let target = config.target.to_string();
    let controller = Controller::open(config)
        .await
        .with_context(|| format!("Failed to connect to {target}"))?;
    info!(log_dir = controller.log_dir(), jobs = commands.len(), "Submitting");

    let handles = controller.submit(commands, &opts, None)?;
    let report = controller.wait_all().await?;
    drop(handles);
    controller.shutdown().await?;

    match args.output {
        OutputFormat::Table => print_report(&report),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }

    let unfinished = report
        .jobs
        .iter()
        .filter(|row| row.status != JobState::Done)
        .count();
    if unfinished > 0 {
        bail!("{unfinished} of {} jobs did not finish", report.len());
    }
    Ok(())
}

fn print_report(report: &StatusReport) {
    println!(
        "{:<24} {:<12} {:<10} {}",
        "JOB ID", "SCHEDULER", "STATUS", "DETAIL"
    );
    println!("{}", "-".repeat(70));

    for row in &report.jobs {
        let detail = match row.failure {
            Some(ref reason) => reason.to_string(),
            None => row.stdout_path.clone(),
        };
        println!(
            "{:<24} {:<12} {:<10} {}",
            row.job_id,
            row.scheduler_id.as_deref().unwrap_or("-"),
            row.status.as_str(),
            detail,
        );
    }

    let tally: Vec<String> = report
        .counts()
        .iter()
        .map(|(state, count)| format!("{count} {state}"))
        .collect();
    println!("\n{}", tally.join(", "));
}

/// Classify the logs of jobs from an earlier session without resubmitting.
async fn inspect(cluster: &ClusterArgs, job_ids: &[String], profiles: Option<&Path>) -> Result<()> {
    let config = cluster_config(cluster, profiles)?;
    config.validate()?;

    let mut channel = channel::for_target(&config.target, config.command_timeout);
    channel
        .open()
        .await
        .with_context(|| format!("Failed to connect to {}", config.target))?;
    let log_root = resolve_path(channel.as_mut(), &config.log_root).await?;
    let log_dir = format!("{}/{}", log_root.trim_end_matches('/'), config.namespace);

    println!("{:<24} {:<10} {}", "JOB ID", "STATE", "LOG");
    println!("{}", "-".repeat(70));

    for job_id in job_ids {
        let opts = JobOpts::builder(job_id.as_str()).build()?;
        let paths = LogPaths::for_job(&log_dir, opts.job_id());
        let output = run_with_retry(channel.as_mut(), &inspect_command(&paths)).await?;
        let state = match parse_log_report(&output.stdout) {
            Some(LogReport::Final { ref stderr, .. }) => match verdict(stderr) {
                Ok(()) => "done".to_string(),
                Err(reason) => format!("failed ({reason})"),
            },
            Some(LogReport::Partial) => "running".to_string(),
            Some(LogReport::Missing) => "missing".to_string(),
            None => "unknown".to_string(),
        };
        println!("{:<24} {:<10} {}", job_id, state, paths.stderr);
    }

    channel.close().await?;
    Ok(())
}

fn list_profiles(profiles: Option<&Path>) -> Result<()> {
    let loaded =
        ClusterProfiles::load_or_default(profiles).context("Failed to load cluster profiles")?;
    if loaded.clusters.is_empty() {
        let path = profiles
            .map(Path::to_path_buf)
            .or_else(ClusterProfiles::default_path);
        match path {
            Some(path) => println!("No cluster profiles found in {}.", path.display()),
            None => println!("No cluster profiles found."),
        }
        return Ok(());
    }

    println!("{:<16} {:<40} {:<8} {}", "NAME", "TARGET", "LIMIT", "QUEUE");
    println!("{}", "-".repeat(70));
    for (name, profile) in &loaded.clusters {
        let limit = profile
            .concurrent_job_limit
            .map_or_else(|| "-".to_string(), |l| l.to_string());
        println!(
            "{:<16} {:<40} {:<8} {}",
            name,
            profile.target,
            limit,
            profile.queue.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}
