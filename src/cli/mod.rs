//! Command-line interface for dx-forge.
//!
//! Provides commands for running and resuming pipelines, listing pending
//! checkpoints, ad-hoc verification batches and output recovery.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
