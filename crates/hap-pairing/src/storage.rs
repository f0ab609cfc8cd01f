//! Key-value persistence for the accessory identity and pairing records.
//!
//! Calls are blocking; async callers run them on the blocking pool.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use hap_core::error::StorageError;
use tracing::trace;

/// Narrow persistence interface used by the identity store.
#[cfg_attr(test, mockall::automock)]
pub trait Storage: Send + Sync {
    /// Value for `key`, or `None` if absent.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Remove `key`. Removing an absent key is not an error.
    fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Every key currently stored.
    fn all_keys(&self) -> Result<Vec<String>, StorageError>;
}

/// One file per key inside a directory.
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Open (and create if needed) the storage directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Directory backing this store.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.dir.join(key))
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        // Write then rename so a crash never leaves a half-written record.
        let tmp = self.dir.join(format!(".{}.tmp", key));
        fs::write(&tmp, value)?;
        fs::rename(&tmp, &path)?;
        trace!(key, len = value.len(), "stored record");
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn all_keys(&self) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if validate_key(name).is_ok() {
                    keys.push(name.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

/// In-memory store for tests and ephemeral accessories.
#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        validate_key(key)?;
        Ok(self.entries().get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        validate_key(key)?;
        self.entries().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        validate_key(key)?;
        self.entries().remove(key);
        Ok(())
    }

    fn all_keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.entries().keys().cloned().collect())
    }
}

/// Keys become file names, so only a conservative alphabet is allowed.
fn validate_key(key: &str) -> Result<(), StorageError> {
    let valid = !key.is_empty()
        && !key.starts_with('.')
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-' || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod key_validation {
        use super::*;

        #[test]
        fn accepts_record_keys() {
            assert!(validate_key("uuid").is_ok());
            assert!(validate_key("pairing.4142").is_ok());
            assert!(validate_key("keypair").is_ok());
        }

        #[test]
        fn rejects_paths_and_hidden_names() {
            for key in ["", "../etc", "a/b", ".hidden", "sp ace"] {
                assert!(matches!(
                    validate_key(key),
                    Err(StorageError::InvalidKey(_))
                ));
            }
        }
    }

    mod file_storage {
        use super::*;

        #[test]
        fn set_get_delete() {
            let dir = tempfile::tempdir().unwrap();
            let storage = FileStorage::open(dir.path()).unwrap();

            assert_eq!(storage.get("uuid").unwrap(), None);
            storage.set("uuid", b"AA:BB:CC:DD:EE:FF").unwrap();
            assert_eq!(
                storage.get("uuid").unwrap().as_deref(),
                Some(b"AA:BB:CC:DD:EE:FF".as_slice())
            );

            storage.delete("uuid").unwrap();
            assert_eq!(storage.get("uuid").unwrap(), None);
            storage.delete("uuid").unwrap();
        }

        #[test]
        fn all_keys_skips_temporary_files() {
            let dir = tempfile::tempdir().unwrap();
            let storage = FileStorage::open(dir.path()).unwrap();
            storage.set("keypair", &[1; 32]).unwrap();
            storage.set("pairing.41", b"{}").unwrap();
            fs::write(dir.path().join(".pairing.42.tmp"), b"partial").unwrap();

            assert_eq!(storage.all_keys().unwrap(), vec!["keypair", "pairing.41"]);
        }

        #[test]
        fn open_creates_directory() {
            let dir = tempfile::tempdir().unwrap();
            let nested = dir.path().join("a").join("b");
            let storage = FileStorage::open(&nested).unwrap();
            assert!(storage.dir().is_dir());
        }

        #[test]
        fn survives_reopen() {
            let dir = tempfile::tempdir().unwrap();
            FileStorage::open(dir.path())
                .unwrap()
                .set("uuid", b"x")
                .unwrap();
            let reopened = FileStorage::open(dir.path()).unwrap();
            assert_eq!(reopened.get("uuid").unwrap(), Some(b"x".to_vec()));
        }
    }

    mod memory_storage {
        use super::*;

        #[test]
        fn overwrite_and_list() {
            let storage = MemoryStorage::new();
            storage.set("b", b"1").unwrap();
            storage.set("a", b"2").unwrap();
            storage.set("b", b"3").unwrap();

            assert_eq!(storage.all_keys().unwrap(), vec!["a", "b"]);
            assert_eq!(storage.get("b").unwrap(), Some(b"3".to_vec()));
        }

        #[test]
        fn rejects_invalid_keys() {
            let storage = MemoryStorage::new();
            assert!(storage.set("../x", b"1").is_err());
        }
    }
}
