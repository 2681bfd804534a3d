//! `nfsync ids list|add|remove`
//!
//! A live daemon owns the registry, so edits go through its socket and
//! only touch the file directly when no daemon is running.

use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::Subcommand;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use nfsync_core::{IdentifierRecord, IdentifierRegistry};
use nfsync_daemon::DaemonRequest;
use nfsync_engine::engine::DEFAULT_FAILURE_THRESHOLD;

use super::via_daemon;

/// Manage the taxpayer identifiers a run may select.
#[derive(Subcommand, Debug)]
pub enum IdsCommand {
    /// List registered identifiers with their last check.
    List {
        /// Emit machine-readable JSON.
        #[arg(long)]
        json: bool,
    },

    /// Register a CPF (11 digits) or CNPJ (14 digits). Punctuation is ignored.
    Add { id: String },

    /// Remove one or more identifiers.
    #[command(alias = "rm")]
    Remove {
        #[arg(required = true)]
        ids: Vec<String>,
    },
}

pub fn run(data_dir: &Path, cmd: IdsCommand) -> Result<()> {
    match cmd {
        IdsCommand::List { json } => list(data_dir, json),
        IdsCommand::Add { id } => add(data_dir, &id),
        IdsCommand::Remove { ids } => remove(data_dir, ids),
    }
}

#[derive(Tabled)]
struct IdentifierRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "LAST CHECK")]
    last_checked: String,
    #[tabled(rename = "FOUND")]
    found: String,
    #[tabled(rename = "FAILURES")]
    failures: String,
    #[tabled(rename = "LAST ERROR")]
    last_error: String,
}

fn list(data_dir: &Path, json: bool) -> Result<()> {
    let records = match via_daemon(data_dir, &DaemonRequest::command("list"))
        .context("failed to list identifiers through the daemon")?
    {
        Some(data) => serde_json::from_value::<Vec<IdentifierRecord>>(data)
            .context("daemon sent a malformed identifier list")?,
        None => IdentifierRegistry::at(data_dir)
            .list_all()
            .context("failed to load the identifier registry")?,
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&records).context("failed to serialize identifiers")?
        );
        return Ok(());
    }

    if records.is_empty() {
        println!("No identifiers registered.");
        println!("Run: nfsync ids add <cpf-or-cnpj>");
        return Ok(());
    }

    let rows: Vec<IdentifierRow> = records.iter().map(row_for).collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
    Ok(())
}

fn row_for(record: &IdentifierRecord) -> IdentifierRow {
    let failures = record.consecutive_failures.to_string();
    let failures = if record.consecutive_failures >= DEFAULT_FAILURE_THRESHOLD {
        failures.red().bold().to_string()
    } else {
        failures
    };
    IdentifierRow {
        id: record.id.to_string(),
        last_checked: record
            .last_checked_at
            .map(format_timestamp)
            .unwrap_or_else(|| "never".to_string()),
        found: record
            .last_result
            .map(|r| r.found.to_string())
            .unwrap_or_else(|| "-".to_string()),
        failures,
        last_error: record.last_error.clone().unwrap_or_default(),
    }
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M").to_string()
}

fn add(data_dir: &Path, raw: &str) -> Result<()> {
    let request = DaemonRequest {
        id: Some(raw.to_string()),
        ..DaemonRequest::command("add")
    };
    let record = match via_daemon(data_dir, &request).context("failed to register identifier")? {
        Some(data) => Some(
            serde_json::from_value::<IdentifierRecord>(data)
                .context("daemon sent a malformed identifier record")?,
        ),
        None => IdentifierRegistry::at(data_dir)
            .add(raw)
            .context("failed to register identifier")?,
    };
    match record {
        Some(record) => {
            println!("{} registered {}", "✓".green(), record.id);
            Ok(())
        }
        None => bail!("identifier {raw} is already registered"),
    }
}

fn remove(data_dir: &Path, ids: Vec<String>) -> Result<()> {
    let request = DaemonRequest {
        ids: Some(ids.clone()),
        ..DaemonRequest::command("remove")
    };
    let removed = match via_daemon(data_dir, &request).context("failed to remove identifiers")? {
        Some(data) => data["removed"].as_u64().unwrap_or(0) as usize,
        None => IdentifierRegistry::at(data_dir)
            .delete_many(&ids)
            .context("failed to remove identifiers")?,
    };
    if removed == 0 {
        bail!("none of the given identifiers are registered");
    }
    println!("removed {removed} identifier(s)");
    Ok(())
}
