//! CLI command definitions
//!
//! Defines the clap commands for the test runner CLI.

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute every test scheduled by a run plan
    Run {
        /// Path to the plan (.toml, .yaml or .yml)
        plan: PathBuf,

        /// Maximum number of tests running at the same time
        #[arg(long, short = 'j')]
        jobs: Option<usize>,

        /// Working directory for workers and output files
        #[arg(long)]
        workdir: Option<PathBuf>,

        /// Write a JSON report of the run to this file
        #[arg(long)]
        report: Option<PathBuf>,

        /// Identifier handed to storage when the run starts
        #[arg(long)]
        client_id: Option<String>,

        /// Don't show the progress bar
        #[arg(long)]
        no_progress: bool,

        /// Also write debug logs to the log directory
        #[arg(long)]
        log_file: bool,
    },

    /// List the tests and scenarios declared by a run plan
    List {
        /// Path to the plan (.toml, .yaml or .yml)
        plan: PathBuf,

        /// Output the declarations as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration
    Config,
}

impl Commands {
    /// Whether the command asked for file logging
    pub fn wants_log_file(&self) -> bool {
        matches!(self, Commands::Run { log_file: true, .. })
    }
}
