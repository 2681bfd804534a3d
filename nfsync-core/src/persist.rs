//! Atomic file replacement shared by every store.
//!
//! Write flow: bytes → uniquely named `.<name>.XXXXXX.tmp` sibling →
//! `chmod 0600` → `rename`. The temporary file lives in the same directory as
//! the target, so the rename never crosses filesystems and readers see either
//! the old or the new file. Concurrent writers each get their own temporary
//! file; the last rename wins.

use std::io::Write;
use std::path::Path;

use crate::error::{io_err, StoreError};

/// Suffix carried by in-flight temporary files.
pub const TMP_SUFFIX: &str = ".tmp";

/// Atomically replace `path` with `contents`, creating the parent (mode `0700`).
///
/// The temporary file is removed if anything fails before the rename.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StoreError> {
    let Some(dir) = path.parent() else {
        return Err(io_err(path, std::io::Error::other("store path has no parent")));
    };
    ensure_dir(dir)?;

    let prefix = match path.file_name() {
        Some(name) => format!(".{}.", name.to_string_lossy()),
        None => ".store.".to_string(),
    };
    let mut tmp = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(TMP_SUFFIX)
        .tempfile_in(dir)
        .map_err(|e| io_err(dir, e))?;
    tmp.write_all(contents)
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|e| io_err(tmp.path(), e))?;
    set_file_permissions(tmp.path())?;
    tmp.persist(path).map_err(|e| io_err(path, e.error))?;
    Ok(())
}

/// Read `path`, mapping "not found" to `None`.
pub fn read_optional(path: &Path) -> Result<Option<String>, StoreError> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_err(path, e)),
    }
}

/// Create `dir` (mode `0700`) if it does not yet exist.
pub fn ensure_dir(dir: &Path) -> Result<(), StoreError> {
    if !dir.exists() {
        std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        set_dir_permissions(dir)?;
    }
    Ok(())
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Leftover temporary files in `dir`.
    fn leftovers(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(TMP_SUFFIX))
            .collect()
    }

    #[test]
    fn write_atomic_creates_parent_and_cleans_tmp() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("status.json");
        write_atomic(&path, b"{}").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{}");
        assert!(leftovers(path.parent().unwrap()).is_empty());
    }

    #[test]
    fn concurrent_writers_never_share_a_temporary_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("identifiers.yaml");

        std::thread::scope(|scope| {
            for writer in 0..8u8 {
                let path = &path;
                scope.spawn(move || {
                    for _ in 0..25 {
                        let body = vec![b'a' + writer; 4096];
                        write_atomic(path, &body).expect("every write succeeds");
                    }
                });
            }
        });

        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents.len(), 4096);
        assert!(contents.iter().all(|b| *b == contents[0]), "torn write");
        assert!(leftovers(dir.path()).is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn written_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("identifiers.yaml");
        write_atomic(&path, b"version: 1\n").unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[test]
    fn read_optional_missing_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(read_optional(&dir.path().join("absent")).unwrap().is_none());
    }
}
