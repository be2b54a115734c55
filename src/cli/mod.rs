//! Command-line interface for frameflow.
//!
//! Provides commands for running workers, enqueueing jobs and sessions, and
//! inspecting queues, statuses, teams and sessions.

mod commands;
mod handler;

pub use commands::{parse_cli, run_with_cli, Cli, Commands};
pub use handler::CommandHandler;
