//! Command-line interface for analysis-rpc.
//!
//! Provides the `serve` command that runs the worker pool, plus `submit`
//! and `dead-letters` utilities for operating a queue.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
