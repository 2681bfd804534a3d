//! Ledger store — the durable set of document keys already uploaded.
//!
//! Persists a [`LedgerFile`] JSON document at `<data_dir>/processed.json`.
//! Loading also accepts the legacy layout, a flat JSON array of keys.
//! Writes use the shared atomic `.tmp` + rename protocol.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{json_err, StoreError};
use crate::paths::ledger_path;
use crate::persist::{read_optional, write_atomic};

/// In-memory ledger: the set of uploaded document keys.
pub type LedgerSet = BTreeSet<String>;

/// On-disk ledger payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerFile {
    pub updated_at: DateTime<Utc>,
    pub keys: LedgerSet,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LedgerCompat {
    Legacy(Vec<String>),
    Structured(LedgerStructuredCompat),
}

#[derive(Debug, Deserialize)]
struct LedgerStructuredCompat {
    #[serde(default)]
    keys: LedgerSet,
}

/// Handle on the ledger file.
#[derive(Debug, Clone)]
pub struct LedgerStore {
    path: PathBuf,
}

impl LedgerStore {
    /// Ledger stored under `data_dir`.
    pub fn at(data_dir: &Path) -> Self {
        Self::with_path(ledger_path(data_dir))
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the key set. A missing or empty file is an empty set.
    pub fn load(&self) -> Result<LedgerSet, StoreError> {
        let Some(contents) = read_optional(&self.path)? else {
            return Ok(LedgerSet::new());
        };
        if contents.trim().is_empty() {
            return Ok(LedgerSet::new());
        }
        let compat: LedgerCompat =
            serde_json::from_str(&contents).map_err(|e| json_err(&self.path, e))?;
        match compat {
            LedgerCompat::Legacy(keys) => Ok(keys.into_iter().collect()),
            LedgerCompat::Structured(file) => Ok(file.keys),
        }
    }

    /// Replace the persisted set with `keys`, atomically.
    pub fn save(&self, keys: &LedgerSet) -> Result<(), StoreError> {
        let file = LedgerFile {
            updated_at: Utc::now(),
            keys: keys.clone(),
        };
        let json = serde_json::to_string_pretty(&file).map_err(|e| json_err(&self.path, e))?;
        write_atomic(&self.path, json.as_bytes())
    }

    /// Forget every key.
    pub fn reset(&self) -> Result<(), StoreError> {
        self.save(&LedgerSet::new())
    }
}
