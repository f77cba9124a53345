//! Command-line interface for tubeworker.
//!
//! Provides the `run` worker command with the import-job demo handler and a
//! `stats` command for inspecting the server.

mod commands;
pub mod import_job;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands, RunArgs, StatsArgs};
