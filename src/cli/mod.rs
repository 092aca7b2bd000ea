//! Command-line interface definitions for the `tagmirror` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{Parser, ValueEnum};

/// Top-level CLI for the `tagmirror` binary.
#[derive(Debug, Parser)]
#[command(
    name = "tagmirror",
    about = "Mirror the latest upstream releases into a destination repository and archive",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Mirror every configured upstream source once.
    #[command(name = "sync", about = "Mirror every configured upstream source once")]
    Sync(SyncCommand),
}

/// Arguments for the `tagmirror sync` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct SyncCommand {
    /// Override the configured asset processing mode for this run.
    #[arg(long, value_enum, value_name = "MODE")]
    pub(crate) mode: Option<ModeArg>,
    /// Log debug events when `RUST_LOG` is unset.
    #[arg(long, short)]
    pub(crate) verbose: bool,
}

/// Processing modes accepted on the command line.
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub(crate) enum ModeArg {
    /// Fetch, fan out and clean one asset at a time.
    Stream,
    /// Fetch every asset before uploading any.
    Batch,
}
