//! `nfsync status` — last run summary plus live processing state.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde_json::{json, Value};

use nfsync_core::{RunStatus, RunStatusStore};
use nfsync_daemon::{request_status, DaemonError};

use super::run::print_summary;

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl StatusArgs {
    pub fn run(self, data_dir: &Path) -> Result<()> {
        let payload = match request_status(data_dir) {
            Ok(payload) => payload,
            Err(DaemonError::DaemonNotRunning { .. }) => offline_payload(data_dir)?,
            Err(err) => return Err(err).context("failed to query daemon status"),
        };

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&payload).context("failed to serialize status JSON")?
            );
            return Ok(());
        }

        print_human(&payload)
    }
}

/// Status read straight from disk when no daemon answers.
fn offline_payload(data_dir: &Path) -> Result<Value> {
    let status = RunStatusStore::at(data_dir)
        .load()
        .context("failed to read the last run status")?;
    Ok(json!({
        "running": false,
        "status": status,
    }))
}

fn print_human(payload: &Value) -> Result<()> {
    let running = payload["running"].as_bool().unwrap_or(false);
    if running {
        println!("daemon: {}", "running".green().bold());
        let state = &payload["state"];
        let message = state["status_message"].as_str().unwrap_or_default();
        if state["is_processing"].as_bool() == Some(true) {
            let current = state["current_identifier"].as_str().unwrap_or("-");
            println!(
                "processing: {}% (current: {current}) {message}",
                state["progress"].as_u64().unwrap_or(0)
            );
        } else {
            println!("state: {message}");
        }
        if payload["schedule_enabled"].as_bool() == Some(false) {
            println!("schedule: {}", "stopped".yellow());
        }
    } else {
        println!("daemon: {}", "not running".bright_black());
    }

    if let Some(err) = payload["status_error"].as_str() {
        println!("{} {err}", "status unreadable:".red());
        return Ok(());
    }
    let status: RunStatus = serde_json::from_value(payload["status"].clone())
        .context("daemon returned a malformed run status")?;
    match (status.last_run_at, status.summary) {
        (Some(at), Some(summary)) => {
            println!("last run: {}", at.format("%Y-%m-%d %H:%M:%S UTC"));
            print_summary(&summary);
        }
        _ => println!("no run recorded yet"),
    }
    Ok(())
}
