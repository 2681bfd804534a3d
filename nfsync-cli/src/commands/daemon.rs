//! `nfsync daemon` — background scheduler lifecycle.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use nfsync_daemon::paths::{log_path, socket_path};
use nfsync_daemon::{
    request_status, request_stop, request_stop_schedule, start_blocking, DaemonError,
};

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Run the daemon in the foreground (scheduler + socket server).
    Start {
        /// Write logs to <data-dir>/logs/daemon.log instead of stderr.
        #[arg(long)]
        log_file: bool,
    },
    /// Request graceful daemon shutdown.
    Stop,
    /// Query daemon runtime status.
    Status,
    /// Print recent daemon log lines.
    Logs(DaemonLogsArgs),
    /// Stop scheduled runs until the daemon restarts. Triggered runs still work.
    StopSchedule,
}

#[derive(Args, Debug)]
pub struct DaemonLogsArgs {
    /// Number of trailing lines to show.
    #[arg(long, default_value_t = 100)]
    pub lines: usize,
}

pub fn run(data_dir: &Path, command: DaemonCommand) -> Result<()> {
    match command {
        DaemonCommand::Start { log_file } => {
            start_blocking(data_dir, log_file).context("daemon exited with error")?;
        }
        DaemonCommand::Stop => match request_stop(data_dir) {
            Ok(()) => println!("daemon stop requested"),
            Err(DaemonError::DaemonNotRunning { .. }) => println!("daemon is not running"),
            Err(err) => return Err(err).context("failed to stop daemon"),
        },
        DaemonCommand::Status => {
            let payload = match request_status(data_dir) {
                Ok(status) => status,
                Err(DaemonError::DaemonNotRunning { .. }) => serde_json::json!({
                    "running": false,
                    "socket": socket_path(data_dir).display().to_string(),
                }),
                Err(err) => return Err(err).context("failed to query daemon status"),
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&payload)
                    .context("failed to render daemon status JSON")?
            );
        }
        DaemonCommand::Logs(args) => {
            print_tail(&log_path(data_dir), args.lines).context("failed to read daemon log")?;
        }
        DaemonCommand::StopSchedule => match request_stop_schedule(data_dir) {
            Ok(_) => println!("scheduled runs stopped"),
            Err(DaemonError::DaemonNotRunning { .. }) => println!("daemon is not running"),
            Err(err) => return Err(err).context("failed to stop the schedule"),
        },
    }

    Ok(())
}

fn print_tail(path: &Path, lines: usize) -> Result<()> {
    if !path.exists() {
        println!("log file not found: {}", path.display());
        return Ok(());
    }

    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let mut tail = VecDeque::<String>::with_capacity(lines);
    for line in BufReader::new(file).lines() {
        let line = line.with_context(|| format!("read {}", path.display()))?;
        if lines == 0 {
            continue;
        }
        if tail.len() == lines {
            tail.pop_front();
        }
        tail.push_back(line);
    }

    for line in tail {
        println!("{line}");
    }
    Ok(())
}
