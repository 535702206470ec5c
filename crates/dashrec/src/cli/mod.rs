//! Command-line interface for dashrec.
//!
//! This module provides the CLI structure for the `dashrec` binary.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use commands::{ClipsCommand, ConfigCommand, RunCommand, StatusCommand};

/// dashrec - Keep the last seconds of road, save the ones that matter
///
/// Records continuously into an in-memory ring buffer and writes clips and
/// stills to disk when the sensor link or an operator flags an event.
#[derive(Debug, Parser)]
#[command(name = "dashrec")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Record until SIGINT or SIGTERM
    Run(RunCommand),

    /// Show clip storage and configuration summary
    Status(StatusCommand),

    /// Inspect or prune saved clips
    #[command(subcommand)]
    Clips(ClipsCommand),

    /// View or validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Get the verbosity level based on flags.
    #[must_use]
    pub fn verbosity(&self) -> crate::logging::Verbosity {
        if self.quiet {
            crate::logging::Verbosity::Quiet
        } else {
            match self.verbose {
                0 => crate::logging::Verbosity::Normal,
                1 => crate::logging::Verbosity::Verbose,
                _ => crate::logging::Verbosity::Trace,
            }
        }
    }
}
