//! Command-line interface built on clap.
//!
//! Defines [`Cli`] with the [`Command`] subcommands (demo, merge, table) and
//! the global `--config` and `--verbose` flags.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// turnstile: locked state transitions, optimistic merges and an audit trail.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the configuration file (defaults to ./turnstile.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enables debug logging (overridden by RUST_LOG).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Races workers to move one ticket to different states.
    Demo {
        /// Number of concurrent workers.
        #[arg(long, default_value_t = 6, value_parser = clap::value_parser!(u16).range(1..))]
        workers: u16,
    },

    /// Has workers append to one history field concurrently without a lock.
    Merge {
        /// Number of concurrent workers.
        #[arg(long, default_value_t = 50, value_parser = clap::value_parser!(u16).range(1..))]
        workers: u16,
    },

    /// Prints the sample ticket transition table.
    Table,
}
