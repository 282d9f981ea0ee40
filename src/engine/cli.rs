//! Webpatch CLI Module
//! Command-line interface for checking, installing and publishing web updates

pub mod formatter;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use super::config::resolve_data_dir;

#[derive(Parser, Debug)]
#[command(name = "webpatch")]
#[command(author = "Webpatch Team")]
#[command(version)]
#[command(about = "Signed web content updates", long_about = None)]
pub struct Cli {
    /// Data directory holding the config and the installed update
    #[arg(short, long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Output format (json for scripting)
    #[arg(short, long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check for a web update and install it
    Check {
        /// Install without asking
        #[arg(short, long)]
        yes: bool,
    },

    /// Verify and apply the installed update
    Load,

    /// Remove the installed update and go back to the built-in content
    Remove {
        /// Remove without asking
        #[arg(short, long)]
        yes: bool,
    },

    /// Show the running version and last check
    Status,

    /// Check periodically until interrupted
    Watch {
        /// Check right away instead of after the first interval
        #[arg(long)]
        now: bool,

        /// Also report checks that found nothing or were rejected
        #[arg(long)]
        report_all: bool,
    },

    /// Build an update package from a directory
    Pack {
        /// Web content directory
        dir: PathBuf,

        /// Package file to write
        out: PathBuf,
    },

    /// Sign an update record and package
    Sign {
        /// Private key as hex
        #[arg(short, long, env = "WEBPATCH_SIGNING_KEY", hide_env_values = true)]
        key: String,

        /// Update record (JSON, manifest format)
        #[arg(short, long)]
        record: PathBuf,

        /// Package file
        #[arg(short, long)]
        package: PathBuf,
    },

    /// Verify an update record and package against the built-in signers
    Verify {
        /// Update record (JSON, manifest format)
        #[arg(short, long)]
        record: PathBuf,

        /// Package file
        #[arg(short, long)]
        package: PathBuf,
    },
}

impl Cli {
    pub fn get_data_dir(&self) -> PathBuf {
        resolve_data_dir(self.data_dir.clone())
    }
}
