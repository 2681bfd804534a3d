//! Identifier registry — durable sync state per taxpayer identifier.
//!
//! # Storage
//!
//! A single YAML document at `<data_dir>/identifiers.yaml`:
//!
//! ```yaml
//! version: 1
//! identifiers:
//!   - id: "12345678000195"
//!     created_at: 2024-05-01T12:00:00Z
//!     consecutive_failures: 0
//!     ...
//! ```
//!
//! Every operation reads the whole file, mutates it and writes it back
//! atomically. Every handle on the same file shares one process-wide lock,
//! so edits arriving from the daemon socket cannot interleave with engine
//! updates even when each side opened its own handle. Other processes go
//! through the daemon while it runs. A missing file is an empty registry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::paths::identifiers_path;
use crate::persist::{read_optional, write_atomic};
use crate::types::{normalize_digits, CheckResult, IdentifierRecord, TaxId};

const REGISTRY_VERSION: u32 = 1;

/// One lock per registry file, shared by all handles in this process.
static FILE_LOCKS: LazyLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn lock_for(path: &Path) -> Arc<Mutex<()>> {
    let key = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut locks = FILE_LOCKS.lock().unwrap_or_else(PoisonError::into_inner);
    locks.entry(key).or_default().clone()
}

/// On-disk registry payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct RegistryFile {
    version: u32,
    #[serde(default)]
    identifiers: Vec<IdentifierRecord>,
}

impl Default for RegistryFile {
    fn default() -> Self {
        Self {
            version: REGISTRY_VERSION,
            identifiers: Vec::new(),
        }
    }
}

/// Handle on the identifier registry file.
#[derive(Debug)]
pub struct IdentifierRegistry {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl IdentifierRegistry {
    /// Registry stored under `data_dir`.
    pub fn at(data_dir: &Path) -> Self {
        Self::with_path(identifiers_path(data_dir))
    }

    pub fn with_path(path: PathBuf) -> Self {
        let lock = lock_for(&path);
        Self { path, lock }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All records, in insertion order.
    pub fn list_all(&self) -> Result<Vec<IdentifierRecord>, StoreError> {
        let _guard = self.lock();
        Ok(self.load()?.identifiers)
    }

    pub fn get(&self, id: &TaxId) -> Result<Option<IdentifierRecord>, StoreError> {
        Ok(self.list_all()?.into_iter().find(|r| &r.id == id))
    }

    /// Register `raw` after normalization.
    ///
    /// Returns `Ok(None)` if the identifier is already present and
    /// [`StoreError::Validation`] if it is not 11 or 14 digits.
    pub fn add(&self, raw: &str) -> Result<Option<IdentifierRecord>, StoreError> {
        let id = TaxId::parse(raw)?;
        self.mutate(|records| {
            if records.iter().any(|r| r.id == id) {
                return None;
            }
            let record = IdentifierRecord::new(id, Utc::now());
            records.push(record.clone());
            Some(record)
        })
    }

    /// Remove one identifier; [`StoreError::NotFound`] if it is absent.
    pub fn delete(&self, raw: &str) -> Result<(), StoreError> {
        let target = normalize_digits(raw);
        let removed = self.mutate(|records| {
            let before = records.len();
            records.retain(|r| r.id.as_str() != target);
            before - records.len()
        })?;
        if removed == 0 {
            return Err(StoreError::NotFound { id: target });
        }
        Ok(())
    }

    /// Remove every listed identifier that is present. Returns how many went.
    pub fn delete_many(&self, ids: &[String]) -> Result<usize, StoreError> {
        let targets: Vec<String> = ids.iter().map(|raw| normalize_digits(raw)).collect();
        self.mutate(|records| {
            let before = records.len();
            records.retain(|r| !targets.iter().any(|t| t == r.id.as_str()));
            before - records.len()
        })
    }

    /// Drop every record.
    pub fn reset(&self) -> Result<(), StoreError> {
        let _guard = self.lock();
        self.save(&RegistryFile::default())
    }

    /// Mark a successful check: stores the result, clears the error and
    /// resets the failure counter. Returns `false` if `id` is unknown.
    pub fn record_success(
        &self,
        id: &TaxId,
        checked_at: DateTime<Utc>,
        result: CheckResult,
    ) -> Result<bool, StoreError> {
        self.update(id, |record| {
            record.last_checked_at = Some(checked_at);
            record.last_result = Some(result);
            record.last_error = None;
            record.consecutive_failures = 0;
        })
    }

    /// Store the last error message. The failure counter is left untouched;
    /// see [`IdentifierRegistry::increment_failure_count`].
    pub fn record_error(&self, id: &TaxId, message: &str) -> Result<bool, StoreError> {
        self.update(id, |record| {
            record.last_error = Some(message.to_owned());
        })
    }

    pub fn increment_failure_count(&self, id: &TaxId) -> Result<bool, StoreError> {
        self.update(id, |record| {
            record.consecutive_failures = record.consecutive_failures.saturating_add(1);
        })
    }

    // -----------------------------------------------------------------------
    // Private helpers
    // -----------------------------------------------------------------------

    fn update(
        &self,
        id: &TaxId,
        apply: impl FnOnce(&mut IdentifierRecord),
    ) -> Result<bool, StoreError> {
        self.mutate(|records| match records.iter_mut().find(|r| &r.id == id) {
            Some(record) => {
                apply(record);
                record.updated_at = Utc::now();
                true
            }
            None => false,
        })
    }

    fn mutate<T>(
        &self,
        apply: impl FnOnce(&mut Vec<IdentifierRecord>) -> T,
    ) -> Result<T, StoreError> {
        let _guard = self.lock();
        let mut file = self.load()?;
        let before = file.identifiers.clone();
        let out = apply(&mut file.identifiers);
        if file.identifiers != before {
            self.save(&file)?;
        }
        Ok(out)
    }

    fn load(&self) -> Result<RegistryFile, StoreError> {
        match read_optional(&self.path)? {
            None => Ok(RegistryFile::default()),
            Some(contents) if contents.trim().is_empty() => Ok(RegistryFile::default()),
            Some(contents) => serde_yaml::from_str(&contents).map_err(|e| StoreError::Parse {
                path: self.path.clone(),
                source: e,
            }),
        }
    }

    fn save(&self, file: &RegistryFile) -> Result<(), StoreError> {
        let yaml = serde_yaml::to_string(file)?;
        write_atomic(&self.path, yaml.as_bytes())
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;
    use tempfile::TempDir;

    fn make_registry() -> (TempDir, IdentifierRegistry) {
        let dir = TempDir::new().expect("tempdir");
        let registry = IdentifierRegistry::at(dir.path());
        (dir, registry)
    }

    #[test]
    fn missing_file_is_empty_registry() {
        let (_dir, registry) = make_registry();
        assert!(registry.list_all().unwrap().is_empty());
        assert!(!registry.path().exists(), "listing must not create the file");
    }

    #[test]
    fn add_rejects_wrong_length() {
        let (_dir, registry) = make_registry();
        let err = registry.add("1234").unwrap_err();
        assert!(matches!(
            err,
            StoreError::Validation(ValidationError::InvalidTaxId { .. })
        ));
        assert!(registry.list_all().unwrap().is_empty());
    }

    #[test]
    fn record_success_clears_error_and_counter() {
        let (_dir, registry) = make_registry();
        let record = registry.add("12345678000195").unwrap().expect("added");
        registry.record_error(&record.id, "boom").unwrap();
        registry.increment_failure_count(&record.id).unwrap();
        registry.increment_failure_count(&record.id).unwrap();

        let failing = registry.get(&record.id).unwrap().expect("present");
        assert_eq!(failing.consecutive_failures, 2);
        assert_eq!(failing.last_error.as_deref(), Some("boom"));

        let now = Utc::now();
        registry
            .record_success(&record.id, now, CheckResult { found: 7 })
            .unwrap();
        let healthy = registry.get(&record.id).unwrap().expect("present");
        assert_eq!(healthy.consecutive_failures, 0);
        assert!(healthy.last_error.is_none());
        assert_eq!(healthy.last_checked_at, Some(now));
        assert_eq!(healthy.last_found(), 7);
    }

    #[test]
    fn record_error_leaves_counter_untouched() {
        let (_dir, registry) = make_registry();
        let record = registry.add("12345678901").unwrap().expect("added");
        registry.record_error(&record.id, "timeout").unwrap();
        let loaded = registry.get(&record.id).unwrap().expect("present");
        assert_eq!(loaded.consecutive_failures, 0);
    }

    #[test]
    fn updates_on_unknown_id_report_false() {
        let (_dir, registry) = make_registry();
        let id = TaxId::parse("12345678901").unwrap();
        assert!(!registry.increment_failure_count(&id).unwrap());
        assert!(!registry.path().exists());
    }

    #[test]
    fn handles_on_one_file_share_a_lock() {
        let (dir, registry) = make_registry();
        let other = IdentifierRegistry::at(dir.path());
        assert!(Arc::ptr_eq(&registry.lock, &other.lock));

        let elsewhere = TempDir::new().unwrap();
        let unrelated = IdentifierRegistry::at(elsewhere.path());
        assert!(!Arc::ptr_eq(&registry.lock, &unrelated.lock));
    }

    #[test]
    fn delete_unknown_id_is_not_found() {
        let (_dir, registry) = make_registry();
        let err = registry.delete("12345678901").unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }
}
