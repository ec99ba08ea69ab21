//! Command-line interface for dacrew.
//!
//! Provides the ingest server, the worker pool and queue inspection
//! commands.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, shutdown_signal, Cli};
