//! The passthrough table: the set of key codes the user has authorized
//! for forwarding to the macro daemon.
//!
//! The set is the union of the `key_code` columns of the CSV files in the
//! keys directory. Each file's contribution is tracked separately so a
//! deleted or rewritten file only retracts its own codes. Files are
//! accepted only with mode 0644 and the daemon's own uid; every other key
//! on the keyboard stays invisible to the unprivileged peer.

use crate::security;
use keywarden_common::tracing;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum PassthroughError {
    #[error("cannot resolve path {0}: {1}")]
    Canonicalize(PathBuf, io::Error),
    #[error("invalid permissions on {path}: require rw-r--r-- owned by the daemon user, but was {mode} uid {uid}")]
    Permissions { path: PathBuf, mode: String, uid: u32 },
    #[error("CSV error in {0}: {1}")]
    Csv(PathBuf, csv::Error),
    #[error("no key_code column in {0}")]
    MissingColumn(PathBuf),
    #[error("I/O error on {0}: {1}")]
    Io(PathBuf, io::Error),
}

/// Key-code membership for the read loop, plus per-file ownership of
/// contributions for hot reload.
#[derive(Debug, Default)]
pub struct PassthroughTable {
    keys: HashSet<u16>,
    sources: HashMap<PathBuf, Vec<u16>>,
}

impl PassthroughTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Membership test on the hot path.
    pub fn contains(&self, code: u16) -> bool {
        self.keys.contains(&code)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Number of files currently contributing codes.
    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Load (or reload) one key file. Returns the canonical path under
    /// which the file's contribution is recorded, so the caller can watch
    /// it. On any error the previously loaded state is preserved, minus
    /// the file's own prior contribution.
    pub fn load_file<P: AsRef<Path>>(&mut self, path: P) -> Result<PathBuf, PassthroughError> {
        let path = path.as_ref();
        let canonical = fs::canonicalize(path)
            .map_err(|e| PassthroughError::Canonicalize(path.to_path_buf(), e))?;

        // A reload replaces the file's previous contribution entirely.
        self.unload(&canonical);

        let meta = fs::metadata(&canonical)
            .map_err(|e| PassthroughError::Io(canonical.clone(), e))?;
        if !security::key_file_permissions_ok(&meta) {
            return Err(PassthroughError::Permissions {
                path: canonical,
                mode: security::describe_mode(meta.mode()),
                uid: meta.uid(),
            });
        }

        let codes = parse_key_codes(&canonical)?;
        for &code in &codes {
            self.keys.insert(code);
        }
        info!(
            "Loaded {} passthrough keys from {}",
            codes.len(),
            canonical.display()
        );
        self.sources.insert(canonical.clone(), codes);
        Ok(canonical)
    }

    /// Retract a file's contribution. Codes also contributed by other
    /// files survive: the global set is rebuilt as the union of the
    /// remaining contributions.
    pub fn unload<P: AsRef<Path>>(&mut self, path: P) {
        let path = path.as_ref();
        if let Some(codes) = self.sources.remove(path) {
            for code in codes {
                self.keys.remove(&code);
            }
            info!("Removed passthrough keys from {}", path.display());

            for codes in self.sources.values() {
                for &code in codes {
                    self.keys.insert(code);
                }
            }
        }
    }
}

/// Extract the `key_code` column. Cells that do not parse as a key code
/// (non-integer, negative, out of range) are skipped; the files are
/// hand-edited and partial junk is expected.
fn parse_key_codes(path: &Path) -> Result<Vec<u16>, PassthroughError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(|e| PassthroughError::Csv(path.to_path_buf(), e))?;

    let headers = reader
        .headers()
        .map_err(|e| PassthroughError::Csv(path.to_path_buf(), e))?;
    let column = headers
        .iter()
        .position(|h| h.trim() == "key_code")
        .ok_or_else(|| PassthroughError::MissingColumn(path.to_path_buf()))?;

    let mut codes = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| PassthroughError::Csv(path.to_path_buf(), e))?;
        let Some(cell) = record.get(column) else {
            continue;
        };
        if let Ok(code) = cell.trim().parse::<u16>() {
            codes.push(code);
        }
    }
    Ok(codes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn write_keys(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, body).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
        path
    }

    #[test]
    fn test_load_basic() {
        let dir = TempDir::new().unwrap();
        let file = write_keys(dir.path(), "a.csv", "key_code\n30\n31\n");

        let mut table = PassthroughTable::new();
        let canonical = table.load_file(&file).unwrap();
        assert_eq!(canonical, fs::canonicalize(&file).unwrap());
        assert!(table.contains(30));
        assert!(table.contains(31));
        assert!(!table.contains(32));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_union_and_removal_consistency() {
        let dir = TempDir::new().unwrap();
        let a = write_keys(dir.path(), "a.csv", "key_code\n30\n31\n");
        let b = write_keys(dir.path(), "b.csv", "key_code\n31\n32\n");

        let mut table = PassthroughTable::new();
        let a_canon = table.load_file(&a).unwrap();
        table.load_file(&b).unwrap();
        assert!(table.contains(30) && table.contains(31) && table.contains(32));

        // Deleting A's contribution keeps 31, contributed by B as well.
        table.unload(&a_canon);
        assert!(!table.contains(30));
        assert!(table.contains(31));
        assert!(table.contains(32));

        // Re-creating A with different content only adds the new codes.
        write_keys(dir.path(), "a.csv", "key_code\n40\n");
        table.load_file(&a).unwrap();
        assert!(!table.contains(30));
        assert!(table.contains(31) && table.contains(32) && table.contains(40));
    }

    #[test]
    fn test_reload_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let file = write_keys(dir.path(), "a.csv", "key_code\n30\n31\n");

        let mut table = PassthroughTable::new();
        table.load_file(&file).unwrap();
        table.load_file(&file).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.source_count(), 1);
    }

    #[test]
    fn test_world_writable_file_rejected() {
        let dir = TempDir::new().unwrap();
        let good = write_keys(dir.path(), "good.csv", "key_code\n30\n");
        let bad = dir.path().join("bad.csv");
        fs::write(&bad, "key_code\n99\n").unwrap();
        fs::set_permissions(&bad, fs::Permissions::from_mode(0o666)).unwrap();

        let mut table = PassthroughTable::new();
        table.load_file(&good).unwrap();
        let err = table.load_file(&bad).unwrap_err();
        assert!(matches!(err, PassthroughError::Permissions { .. }));

        // The existing set is untouched by the rejected file.
        assert!(table.contains(30));
        assert!(!table.contains(99));
        assert_eq!(table.source_count(), 1);
    }

    #[test]
    fn test_junk_cells_skipped() {
        let dir = TempDir::new().unwrap();
        let file = write_keys(
            dir.path(),
            "a.csv",
            "name,key_code\nspace,57\nbroken,notakey\nneg,-3\nenter,28\n",
        );

        let mut table = PassthroughTable::new();
        table.load_file(&file).unwrap();
        assert!(table.contains(57));
        assert!(table.contains(28));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_missing_column_is_an_error() {
        let dir = TempDir::new().unwrap();
        let file = write_keys(dir.path(), "a.csv", "code\n30\n");

        let mut table = PassthroughTable::new();
        let err = table.load_file(&file).unwrap_err();
        assert!(matches!(err, PassthroughError::MissingColumn(_)));
        assert!(table.is_empty());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let mut table = PassthroughTable::new();
        let err = table.load_file("/nonexistent/keys.csv").unwrap_err();
        assert!(matches!(err, PassthroughError::Canonicalize(_, _)));
    }

    #[test]
    fn test_failed_reload_retracts_only_own_codes() {
        let dir = TempDir::new().unwrap();
        let a = write_keys(dir.path(), "a.csv", "key_code\n30\n31\n");
        let b = write_keys(dir.path(), "b.csv", "key_code\n31\n");

        let mut table = PassthroughTable::new();
        table.load_file(&a).unwrap();
        table.load_file(&b).unwrap();

        // Replacement content is unreadable (bad permissions): A's old
        // codes are gone, B's still stand.
        fs::set_permissions(&a, fs::Permissions::from_mode(0o600)).unwrap();
        assert!(table.load_file(&a).is_err());
        assert!(!table.contains(30));
        assert!(table.contains(31));
    }
}
