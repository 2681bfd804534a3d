//! Data directory layout.
//!
//! ```text
//! <data_dir>/                 (default ~/.nfsync, mode 0700)
//!   config.yaml
//!   identifiers.yaml          (identifier registry)
//!   processed.json            (ledger of uploaded document keys)
//!   status.json               (last run summary)
//!   daemon.sock
//!   logs/
//! ```

use std::path::{Path, PathBuf};

use crate::error::StoreError;

pub const DATA_DIR_NAME: &str = ".nfsync";
pub const DATA_DIR_ENV: &str = "NFSYNC_DATA_DIR";

pub const CONFIG_FILE: &str = "config.yaml";
pub const IDENTIFIERS_FILE: &str = "identifiers.yaml";
pub const LEDGER_FILE: &str = "processed.json";
pub const STATUS_FILE: &str = "status.json";

/// `$NFSYNC_DATA_DIR` if set, otherwise `~/.nfsync`.
pub fn default_data_dir() -> Result<PathBuf, StoreError> {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    let home = dirs::home_dir().ok_or(StoreError::HomeNotFound)?;
    Ok(data_dir_in(&home))
}

/// `<home>/.nfsync` — pure, no I/O.
pub fn data_dir_in(home: &Path) -> PathBuf {
    home.join(DATA_DIR_NAME)
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE)
}

pub fn identifiers_path(data_dir: &Path) -> PathBuf {
    data_dir.join(IDENTIFIERS_FILE)
}

pub fn ledger_path(data_dir: &Path) -> PathBuf {
    data_dir.join(LEDGER_FILE)
}

pub fn status_path(data_dir: &Path) -> PathBuf {
    data_dir.join(STATUS_FILE)
}
