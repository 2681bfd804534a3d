//! `nfsync reset` — wipe identifiers, the uploaded-document ledger and run status.

use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::Args;

use nfsync_core::{IdentifierRegistry, LedgerStore, RunStatusStore};
use nfsync_daemon::{request_reset, DaemonError};

#[derive(Args, Debug)]
pub struct ResetArgs {
    /// Confirm the reset. Without it nothing is deleted.
    #[arg(long)]
    pub yes: bool,
}

impl ResetArgs {
    pub fn run(self, data_dir: &Path) -> Result<()> {
        if !self.yes {
            bail!("reset deletes every identifier and the upload history; pass --yes to confirm");
        }

        // A live daemon owns the stores; let it refuse while a run is active.
        match request_reset(data_dir) {
            Ok(_) => {}
            Err(DaemonError::DaemonNotRunning { .. }) => reset_local(data_dir)?,
            Err(err) => return Err(err).context("daemon refused the reset"),
        }
        println!("registry, ledger and run status cleared");
        Ok(())
    }
}

fn reset_local(data_dir: &Path) -> Result<()> {
    IdentifierRegistry::at(data_dir)
        .reset()
        .context("failed to reset the identifier registry")?;
    LedgerStore::at(data_dir)
        .reset()
        .context("failed to reset the upload ledger")?;
    RunStatusStore::at(data_dir)
        .reset()
        .context("failed to reset the run status")?;
    Ok(())
}
