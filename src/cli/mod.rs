//! Command-line interface for jobforge.
//!
//! Provides commands for schema management, task submission and inspection,
//! running workers and the health monitor, and printing queue statistics.

mod commands;
pub mod demo_tasks;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
