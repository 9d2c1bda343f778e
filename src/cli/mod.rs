//! Command-line interface definitions for the `flotilla` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `flotilla` binary.
#[derive(Debug, Parser)]
#[command(
    name = "flotilla",
    about = "Provision ephemeral VMs and run integration tests against them",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Run registered tests on fresh clusters.
    #[command(name = "run", about = "Run registered tests on fresh clusters")]
    Run(RunCommand),
    /// List registered tests.
    #[command(name = "list", about = "List registered tests and their constraints")]
    List(ListCommand),
}

/// Arguments for the `flotilla run` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct RunCommand {
    /// Platform to provision on. Overrides `FLOTILLA_PLATFORM`.
    #[arg(long, value_name = "PLATFORM")]
    pub(crate) platform: Option<String>,
    /// Maximum number of tests, and clusters, active at once.
    #[arg(long, value_name = "N")]
    pub(crate) parallel: Option<usize>,
    /// Seconds a single test may run before it is abandoned.
    #[arg(long, value_name = "SECS")]
    pub(crate) timeout: Option<u64>,
    /// Glob (`*`, `?`) selecting tests by name when no names are given.
    #[arg(long, value_name = "GLOB")]
    pub(crate) pattern: Option<String>,
    /// Include manual tests in pattern-based selections.
    #[arg(long)]
    pub(crate) include_manual: bool,
    /// Tests to run. Named manual tests always run.
    #[arg(value_name = "TEST")]
    pub(crate) names: Vec<String>,
}

/// Arguments for the `flotilla list` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct ListCommand {
    /// Only list tests eligible for this platform.
    #[arg(long, value_name = "PLATFORM")]
    pub(crate) platform: Option<String>,
}
