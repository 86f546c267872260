//! Command-line interface definitions for the `tether` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Args, Parser, ValueEnum};

/// Top-level CLI for the `tether` binary.
#[derive(Debug, Parser)]
#[command(
    name = "tether",
    about = "Run commands and copy files on SSH hosts, pods, and scheduler allocations",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Run a command on the remote unit, streaming its output.
    #[command(name = "run", about = "Run a command on the remote unit, streaming its output")]
    Run(RunCommand),
    /// Copy a local file to the remote unit.
    #[command(name = "copy", about = "Copy a local file to the remote unit")]
    Copy(CopyCommand),
}

/// Backend reached by a subcommand.
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub(crate) enum BackendKind {
    /// A host reached through `ssh`; settings come from `TETHER_SSH_*`.
    Ssh,
    /// A pod reached through `kubectl exec`; settings come from `TETHER_POD_*`.
    Pod,
    /// A scheduler allocation reached through `nomad alloc exec`; settings
    /// come from `TETHER_ALLOC_*`.
    Allocation,
}

/// Interval function applied between retry attempts.
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub(crate) enum BackoffKind {
    /// Wait the base interval between attempts.
    Fixed,
    /// Wait `base * 2^attempt`.
    Exponential,
    /// Wait `base * fib(attempt)`.
    Fibonacci,
}

/// Options shared by every subcommand.
#[derive(Debug, Args)]
pub(crate) struct TargetArgs {
    /// Backend that executes the work.
    #[arg(long, value_enum, default_value_t = BackendKind::Ssh, env = "TETHER_BACKEND")]
    pub(crate) backend: BackendKind,
    /// Total attempts before giving up; 1 disables retries.
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
    pub(crate) attempts: u32,
    /// Interval function between attempts.
    #[arg(long, value_enum, default_value_t = BackoffKind::Fixed)]
    pub(crate) backoff: BackoffKind,
    /// Base interval between attempts, in milliseconds.
    #[arg(long, value_name = "MILLIS", default_value_t = 1000)]
    pub(crate) backoff_ms: u64,
    /// Overall deadline for the operation including retries, in seconds.
    #[arg(long, value_name = "SECONDS")]
    pub(crate) timeout: Option<u64>,
}

/// Arguments for the `tether run` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct RunCommand {
    #[command(flatten)]
    pub(crate) target: TargetArgs,
    /// Command to execute on the remote unit (use -- to separate flags).
    #[arg(required = true, trailing_var_arg = true)]
    pub(crate) command: Vec<String>,
}

/// Arguments for the `tether copy` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct CopyCommand {
    #[command(flatten)]
    pub(crate) target: TargetArgs,
    /// Local file to copy.
    #[arg(value_name = "SOURCE")]
    pub(crate) source: String,
    /// Remote destination path, including the file name.
    #[arg(value_name = "DEST")]
    pub(crate) destination: String,
}
