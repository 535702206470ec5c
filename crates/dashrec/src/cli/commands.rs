//! CLI command definitions.

use std::path::PathBuf;

use clap::{Args, Subcommand};

/// Run command arguments.
#[derive(Debug, Args)]
pub struct RunCommand {
    /// Do not read the sensor link, even if it is enabled in the configuration
    #[arg(long)]
    pub no_sensor: bool,

    /// Do not register clips with the upload server
    #[arg(long)]
    pub no_upload: bool,
}

impl RunCommand {
    /// Recorder options for these flags.
    #[must_use]
    pub fn options(&self) -> crate::recorder::RecorderOptions {
        crate::recorder::RecorderOptions {
            sensor: !self.no_sensor,
            upload: !self.no_upload,
        }
    }
}

/// Status command arguments.
#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Clip directory commands.
#[derive(Debug, Subcommand)]
pub enum ClipsCommand {
    /// List saved clips, oldest first
    List {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Delete the oldest clips until the directory is under quota
    Prune,
}

/// Configuration commands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show the configuration file path
    Path,

    /// Validate configuration
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}
