//! `nfsync run` — trigger a sync run through the daemon, or in-process.

use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;

use nfsync_core::{DateRange, IdentifierRegistry, RunSummary};
use nfsync_daemon::{request_run, DaemonError, DaemonRequest};
use nfsync_engine::{pipeline::load_engine, RunOutcome, RunRequest};

use super::via_daemon;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Comma-separated identifiers to process.
    #[arg(long, value_delimiter = ',', conflicts_with = "all", required_unless_present = "all")]
    pub ids: Vec<String>,

    /// Process every registered identifier.
    #[arg(long)]
    pub all: bool,

    /// First day of the range (YYYY-MM-DD).
    #[arg(long)]
    pub start: String,

    /// Last day of the range, inclusive (YYYY-MM-DD).
    #[arg(long)]
    pub end: String,

    /// Run in this process and wait for completion instead of asking the daemon.
    #[arg(long)]
    pub foreground: bool,
}

impl RunArgs {
    pub fn run(self, data_dir: &Path) -> Result<()> {
        let range = DateRange::parse(&self.start, &self.end).context("invalid date range")?;
        let identifiers = self.identifiers(data_dir)?;
        if identifiers.is_empty() {
            bail!("no identifiers selected. Register some with `nfsync ids add <id>`");
        }

        if self.foreground {
            return run_foreground(data_dir, identifiers, range);
        }

        match request_run(data_dir, identifiers, &self.start, &self.end) {
            Ok(reply) => {
                if reply["started"].as_bool() == Some(true) {
                    println!("{} run started; follow it with `nfsync status`", "✓".green());
                    Ok(())
                } else {
                    let reason = reply["reason"].as_str().unwrap_or("unknown reason");
                    bail!("run not started: {reason}")
                }
            }
            Err(DaemonError::DaemonNotRunning { .. }) => bail!(
                "daemon is not running. Start it with `nfsync daemon start` or pass --foreground"
            ),
            Err(err) => Err(err).context("failed to trigger run"),
        }
    }

    fn identifiers(&self, data_dir: &Path) -> Result<Vec<String>> {
        if !self.all {
            return Ok(self.ids.clone());
        }
        let records = IdentifierRegistry::at(data_dir)
            .list_all()
            .context("failed to load the identifier registry")?;
        Ok(records.into_iter().map(|r| r.id.to_string()).collect())
    }
}

/// In-process run. Refused while a daemon is live: its run guard only covers
/// its own process, so two engines would upload and save the ledger at once.
fn run_foreground(data_dir: &Path, identifiers: Vec<String>, range: DateRange) -> Result<()> {
    if via_daemon(data_dir, &DaemonRequest::command("status"))
        .context("failed to check for a running daemon")?
        .is_some()
    {
        bail!("a daemon is running; use `nfsync run` without --foreground");
    }

    nfsync_daemon::init_tracing(data_dir, false).context("failed to initialize logging")?;
    let (_, engine) = load_engine(data_dir).context("failed to load configuration")?;

    match engine
        .run(RunRequest::new(identifiers, range))
        .context("run aborted")?
    {
        RunOutcome::Completed(report) => {
            print_summary(&report.summary);
            if report.identifiers_in_error > 0 {
                println!(
                    "{}",
                    format!("{} identifier(s) in error", report.identifiers_in_error).red()
                );
            }
            Ok(())
        }
        RunOutcome::AlreadyRunning => bail!("a run is already in progress"),
        RunOutcome::MissingParameters => bail!("identifiers and a date range are required"),
        RunOutcome::NoValidIdentifiers => {
            bail!("none of the selected identifiers are registered")
        }
    }
}

pub(crate) fn print_summary(summary: &RunSummary) {
    println!(
        "identifiers: {} | found: {} | sent: {} | skipped: {} | failed: {}",
        summary.processed_identifiers,
        summary.found,
        summary.sent.to_string().green(),
        summary.skipped,
        if summary.failed > 0 {
            summary.failed.to_string().red().to_string()
        } else {
            summary.failed.to_string()
        },
    );
}
