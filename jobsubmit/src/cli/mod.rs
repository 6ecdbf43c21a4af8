//! Command-line front end: `submit`, `inspect` and `profiles`.

mod args;
mod commands;

pub use args::Cli;
pub use commands::execute;
