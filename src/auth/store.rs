//! Key persistence
//!
//! The authority only ever hands hashed records to a store. The JSON file
//! store writes atomically (temp file + rename) and restricts the file to
//! the owner on Unix.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

use super::Scope;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("key store I/O error at '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("key store is corrupt: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Persisted form of one key. The secret itself is never stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredKey {
    pub id: String,
    /// Hex SHA-256 of the secret.
    pub hash: String,
    pub owner: String,
    pub created_at: u64,
    pub scopes: BTreeSet<Scope>,
    #[serde(default)]
    pub admin: bool,
}

pub trait KeyStorage: Send + Sync {
    fn load(&self) -> Result<Vec<StoredKey>, StorageError>;
    fn save(&self, keys: &[StoredKey]) -> Result<(), StorageError>;
}

#[derive(Serialize, Deserialize)]
struct KeyFile {
    version: u32,
    keys: Vec<StoredKey>,
}

const KEY_FILE_VERSION: u32 = 1;

pub struct JsonKeyStore {
    path: PathBuf,
}

impl JsonKeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> StorageError {
        StorageError::Io { path: self.path.clone(), source }
    }
}

impl KeyStorage for JsonKeyStore {
    fn load(&self) -> Result<Vec<StoredKey>, StorageError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("Key store {} does not exist yet", self.path.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(self.io_err(e)),
        };
        let file: KeyFile = serde_json::from_str(&content)?;
        Ok(file.keys)
    }

    fn save(&self, keys: &[StoredKey]) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }

        let file = KeyFile { version: KEY_FILE_VERSION, keys: keys.to_vec() };
        let json = serde_json::to_string_pretty(&file)?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| self.io_err(e))?;

        // 파일 퍼미션 제한 (Unix only)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| self.io_err(e))?;
        }

        std::fs::rename(&tmp, &self.path).map_err(|e| self.io_err(e))?;
        tracing::debug!("Saved {} keys to {}", keys.len(), self.path.display());
        Ok(())
    }
}

/// In-process store for tests and embedders that manage persistence themselves.
#[derive(Default)]
pub struct MemoryKeyStore {
    keys: Mutex<Vec<StoredKey>>,
    fail_saves: std::sync::atomic::AtomicBool,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `save` fail, to exercise rollback paths.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> Vec<StoredKey> {
        self.keys.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl KeyStorage for MemoryKeyStore {
    fn load(&self) -> Result<Vec<StoredKey>, StorageError> {
        Ok(self.snapshot())
    }

    fn save(&self, keys: &[StoredKey]) -> Result<(), StorageError> {
        if self.fail_saves.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(StorageError::Io {
                path: PathBuf::from("<memory>"),
                source: std::io::Error::new(std::io::ErrorKind::Other, "save disabled"),
            });
        }
        *self.keys.lock().unwrap_or_else(|e| e.into_inner()) = keys.to_vec();
        Ok(())
    }
}

impl<T: KeyStorage + ?Sized> KeyStorage for std::sync::Arc<T> {
    fn load(&self) -> Result<Vec<StoredKey>, StorageError> {
        (**self).load()
    }

    fn save(&self, keys: &[StoredKey]) -> Result<(), StorageError> {
        (**self).save(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StoredKey {
        StoredKey {
            id: "abcdef012345".into(),
            hash: "00".repeat(32),
            owner: "bot".into(),
            created_at: 1_700_000_000,
            scopes: [Scope::ManageServer("survival".into())].into_iter().collect(),
            admin: false,
        }
    }

    #[test]
    fn test_json_store_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonKeyStore::new(dir.path().join("keys.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_json_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("keys.json");
        let store = JsonKeyStore::new(&path);
        store.save(&[sample()]).unwrap();

        let reopened = JsonKeyStore::new(&path);
        assert_eq!(reopened.load().unwrap(), vec![sample()]);

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("manage_server:survival"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_json_store_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(JsonKeyStore::new(&path).load(), Err(StorageError::Serde(_))));
    }

    #[test]
    fn test_memory_store_failure_switch() {
        let store = MemoryKeyStore::new();
        store.save(&[sample()]).unwrap();
        store.set_fail_saves(true);
        assert!(store.save(&[]).is_err());
        assert_eq!(store.snapshot().len(), 1);
    }
}
