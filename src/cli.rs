//! Command-line interface

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::runtime::StoreKind;

/// Tutoring-assignment aggregation pipeline.
#[derive(Debug, Parser)]
#[command(name = "tutorflow", version, about)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose logging (structured fields, span close events).
    #[arg(long, short, global = true)]
    pub verbose: bool,

    /// Emit JSON logs (non-interactive deployments).
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Store adapter to run against.
    #[arg(long, global = true, value_enum, default_value_t = StoreArg::Postgres)]
    pub store: StoreArg,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreArg {
    Postgres,
    Memory,
}

impl std::fmt::Display for StoreArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postgres => write!(f, "postgres"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

impl From<StoreArg> for StoreKind {
    fn from(arg: StoreArg) -> Self {
        match arg {
            StoreArg::Postgres => Self::Postgres,
            StoreArg::Memory => Self::Memory,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the extraction worker pool with supervisor and freshness jobs.
    Worker,

    /// Enqueue extraction jobs for collected raw messages.
    Enqueue {
        /// Upstream channel identifier, e.g. `c/acme-tuition`.
        #[arg(long)]
        channel: String,
        /// Message ids to enqueue, comma separated.
        #[arg(long, value_delimiter = ',', required = true)]
        message_ids: Vec<String>,
        /// Reset even jobs that already completed ok.
        #[arg(long)]
        force: bool,
    },

    /// One-shot freshness retier sweep.
    Freshness,

    /// Requeue stale processing jobs older than the given age.
    RequeueStale {
        /// Age threshold in seconds; 0 requeues everything processing.
        #[arg(long, default_value_t = 0)]
        older_than_s: u64,
    },

    /// Load the configuration and print the effective values.
    ConfigCheck,
}
