//! Flat-namespace blob store.
//!
//! The opaque storage boundary both sides of the relay resolve file
//! references against: a single directory of files keyed by name. Names with
//! path separators or `..` components are rejected before touching the
//! filesystem.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("file not found: {0}")]
    NotFound(String),
    #[error("invalid filename: {0}")]
    InvalidName(String),
    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct BlobStore {
    dir: PathBuf,
}

impl BlobStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn resolve(&self, name: &str) -> Result<PathBuf, StorageError> {
        if name.is_empty()
            || name.contains('/')
            || name.contains('\\')
            || name == "."
            || name == ".."
        {
            return Err(StorageError::InvalidName(name.to_string()));
        }
        Ok(self.dir.join(name))
    }

    pub fn read(&self, name: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.resolve(name)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn write(&self, name: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let path = self.resolve(name)?;
        fs::write(path, bytes)?;
        Ok(())
    }

    pub fn delete(&self, name: &str) -> Result<(), StorageError> {
        let path = self.resolve(name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn exists(&self, name: &str) -> bool {
        self.resolve(name).map(|p| p.is_file()).unwrap_or(false)
    }

    /// List regular files in the store, sorted by name.
    pub fn list(&self) -> Result<Vec<String>, StorageError> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Ok(name) = entry.file_name().into_string() {
                    files.push(name);
                }
            }
        }
        files.sort();
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, BlobStore) {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_write_read_delete_round_trip() {
        let (_dir, store) = store();
        store.write("a.txt", b"hello").unwrap();
        assert_eq!(store.read("a.txt").unwrap(), b"hello");
        assert!(store.exists("a.txt"));
        store.delete("a.txt").unwrap();
        assert!(!store.exists("a.txt"));
    }

    #[test]
    fn test_read_missing_is_not_found() {
        let (_dir, store) = store();
        assert!(matches!(
            store.read("absent.bin"),
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            store.delete("absent.bin"),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn test_rejects_path_traversal() {
        let (_dir, store) = store();
        for name in ["../etc/passwd", "a/b.txt", "..", ".", "", "c\\d"] {
            assert!(
                matches!(store.write(name, b"x"), Err(StorageError::InvalidName(_))),
                "{name:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_list_is_sorted_and_files_only() {
        let (_dir, store) = store();
        store.write("b.txt", b"2").unwrap();
        store.write("a.txt", b"1").unwrap();
        fs::create_dir(store.dir().join("subdir")).unwrap();
        assert_eq!(store.list().unwrap(), vec!["a.txt", "b.txt"]);
    }
}
