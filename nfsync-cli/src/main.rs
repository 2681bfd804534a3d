//! nfsync — fiscal document synchronization CLI.
//!
//! # Usage
//!
//! ```text
//! nfsync ids list [--json]
//! nfsync ids add <id>
//! nfsync ids remove <id>...
//! nfsync run (--ids <id,..> | --all) --start <YYYY-MM-DD> --end <YYYY-MM-DD> [--foreground]
//! nfsync status [--json]
//! nfsync reset --yes
//! nfsync daemon start|stop|status|logs|stop-schedule
//! ```

mod commands;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use commands::{
    daemon::DaemonCommand, ids::IdsCommand, reset::ResetArgs, run::RunArgs, status::StatusArgs,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "nfsync",
    version,
    about = "Synchronize fiscal documents from the source provider to the sink",
    long_about = None,
)]
struct Cli {
    /// Data directory. Defaults to $NFSYNC_DATA_DIR, then ~/.nfsync.
    #[arg(long, global = true, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage registered taxpayer identifiers.
    Ids {
        #[command(subcommand)]
        command: IdsCommand,
    },

    /// Start a sync run for a date range.
    Run(RunArgs),

    /// Show the last run summary and live processing state.
    Status(StatusArgs),

    /// Clear identifiers, the uploaded-document ledger and run status.
    Reset(ResetArgs),

    /// Manage the background daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => nfsync_core::paths::default_data_dir()
            .context("could not determine the data directory")?,
    };

    match cli.command {
        Commands::Ids { command } => commands::ids::run(&data_dir, command),
        Commands::Run(args) => args.run(&data_dir),
        Commands::Status(args) => args.run(&data_dir),
        Commands::Reset(args) => args.run(&data_dir),
        Commands::Daemon { command } => commands::daemon::run(&data_dir, command),
    }
}
