//! Persistent record of already-scanned image fingerprints, backed by a
//! newline-delimited file so state survives across runs.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub struct HashIndex {
    path: PathBuf,
    state: Mutex<HashSet<String>>,
}

impl HashIndex {
    /// Loads the index from `path`. A missing file is a valid empty index; it
    /// is created on first write.
    pub fn load(path: &Path) -> Result<Self> {
        let mut set = HashSet::new();
        match File::open(path) {
            Ok(file) => {
                for line in BufReader::new(file).lines() {
                    let line = line
                        .with_context(|| format!("failed to read hash index {}", path.display()))?;
                    let fingerprint = line.trim();
                    if !fingerprint.is_empty() {
                        set.insert(fingerprint.to_string());
                    }
                }
            }
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("failed to open hash index {}", path.display()));
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(set),
        })
    }

    pub fn exists(&self, fingerprint: &str) -> bool {
        self.state.lock().unwrap().contains(fingerprint)
    }

    /// Records the fingerprint if it isn't already stored, returning whether it
    /// was present. The lock covers both the membership check and the file
    /// append, so concurrent callers never produce duplicate lines.
    pub fn add_if_missing(&self, fingerprint: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        if state.contains(fingerprint) {
            return Ok(true);
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open hash index {}", self.path.display()))?;
        writeln!(file, "{fingerprint}")
            .with_context(|| format!("failed to append to hash index {}", self.path.display()))?;

        state.insert(fingerprint.to_string());
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_empty_index() {
        let dir = tempfile::tempdir().unwrap();
        let index = HashIndex::load(&dir.path().join("scanned_shas.log")).unwrap();
        assert!(!index.exists("deadbeef"));
    }

    #[test]
    fn test_add_if_missing_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scanned_shas.log");
        let index = HashIndex::load(&path).unwrap();

        assert!(!index.add_if_missing("deadbeef").unwrap());
        assert!(index.add_if_missing("deadbeef").unwrap());
        assert!(index.exists("deadbeef"));

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "deadbeef\n");
    }

    #[test]
    fn test_reload_preserves_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scanned_shas.log");

        {
            let index = HashIndex::load(&path).unwrap();
            index.add_if_missing("aaaa").unwrap();
            index.add_if_missing("bbbb").unwrap();
        }

        let reloaded = HashIndex::load(&path).unwrap();
        assert!(reloaded.exists("aaaa"));
        assert!(reloaded.exists("bbbb"));
        assert!(reloaded.add_if_missing("aaaa").unwrap());
    }
}
