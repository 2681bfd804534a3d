//! Run status store — the summary of the most recent run.

use std::path::{Path, PathBuf};

use crate::error::{json_err, StoreError};
use crate::paths::status_path;
use crate::persist::{read_optional, write_atomic};
use crate::types::RunStatus;

/// Handle on `<data_dir>/status.json`.
#[derive(Debug, Clone)]
pub struct RunStatusStore {
    path: PathBuf,
}

impl RunStatusStore {
    pub fn at(data_dir: &Path) -> Self {
        Self {
            path: status_path(data_dir),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last saved status, or `{ last_run_at: None, summary: None }` if unset.
    pub fn load(&self) -> Result<RunStatus, StoreError> {
        match read_optional(&self.path)? {
            None => Ok(RunStatus::default()),
            Some(contents) if contents.trim().is_empty() => Ok(RunStatus::default()),
            Some(contents) => {
                serde_json::from_str(&contents).map_err(|e| json_err(&self.path, e))
            }
        }
    }

    /// Unconditional overwrite.
    pub fn save(&self, status: &RunStatus) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(status).map_err(|e| json_err(&self.path, e))?;
        write_atomic(&self.path, json.as_bytes())
    }

    pub fn reset(&self) -> Result<(), StoreError> {
        self.save(&RunStatus::default())
    }
}
