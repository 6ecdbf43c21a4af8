//! Child process execution for the channels.

mod spawn;

pub use spawn::{spawn_process, ProcessOptions, ProcessResult};
