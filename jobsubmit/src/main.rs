//! jobsubmit - run shell commands as batch jobs on a cluster scheduler.
//!
//! The binary is a thin client over the library: `submit` runs a batch and
//! waits for it, `inspect` reads back logs of an earlier session and
//! `profiles` lists configured clusters. Logs go to stderr, reports to stdout.

mod cli;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{execute, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    execute(cli).await
}
