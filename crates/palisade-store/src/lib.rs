//! # palisade-store: Secrets store
//!
//! A replica's persistent state is a single mapping from username to
//! threshold-encrypted verifier ciphertext — no log, no view, no membership
//! state. The [`SecretsDb`] trait is the narrow surface the protocol state
//! machines see; [`FileStore`] backs it with one file per key, and
//! [`MemoryStore`] serves tests and simulation.
//!
//! Verifier blobs are immutable once stored: the protocol has no update or
//! delete path, so a put to an existing key simply rewrites the same
//! ciphertext shape and a reader never observes a torn value (writes go
//! through a temp file and an atomic rename).

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bytes::Bytes;
use thiserror::Error;

use palisade_types::Username;

/// Errors from the secrets store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// The key → ciphertext mapping the protocol reads and writes.
///
/// `get` returns `None` for an absent key; on a Get transaction the replica
/// treats that as "do not participate" and stays silent.
pub trait SecretsDb: Send {
    fn put(&self, key: &Username, value: Bytes) -> Result<(), StoreError>;
    fn get(&self, key: &Username) -> Option<Bytes>;
}

// ============================================================================
// Memory Store
// ============================================================================

/// In-memory store for tests and simulation.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<Username, Bytes>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("store mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SecretsDb for MemoryStore {
    fn put(&self, key: &Username, value: Bytes) -> Result<(), StoreError> {
        self.entries
            .lock()
            .expect("store mutex poisoned")
            .insert(key.clone(), value);
        Ok(())
    }

    fn get(&self, key: &Username) -> Option<Bytes> {
        self.entries
            .lock()
            .expect("store mutex poisoned")
            .get(key)
            .cloned()
    }
}

// ============================================================================
// File Store
// ============================================================================

/// One file per username under a data directory.
///
/// Filenames are the hex blake3 hash of the username, so arbitrary usernames
/// never escape the directory or collide with path syntax.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Opens (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    fn entry_path(&self, key: &Username) -> PathBuf {
        let digest = blake3::hash(key.as_bytes());
        self.dir.join(format!("{}.secret", digest.to_hex()))
    }
}

impl SecretsDb for FileStore {
    fn put(&self, key: &Username, value: Bytes) -> Result<(), StoreError> {
        let path = self.entry_path(key);
        let tmp = path.with_extension("secret.tmp");

        write_atomic(&path, &tmp, &value).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;

        tracing::debug!(key = %key, bytes = value.len(), "stored ciphertext");
        Ok(())
    }

    fn get(&self, key: &Username) -> Option<Bytes> {
        match fs::read(self.entry_path(key)) {
            Ok(data) => Some(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "failed to read stored ciphertext");
                None
            }
        }
    }
}

/// Writes through a temp file and renames into place so readers never see a
/// torn value.
fn write_atomic(path: &Path, tmp: &Path, value: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(tmp)?;
    file.write_all(value)?;
    file.sync_all()?;
    fs::rename(tmp, path)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Username {
        Username::from("alice")
    }

    #[test]
    fn memory_roundtrip() {
        let store = MemoryStore::new();
        assert!(store.get(&alice()).is_none());
        store.put(&alice(), Bytes::from_static(b"ct")).unwrap();
        assert_eq!(store.get(&alice()).unwrap().as_ref(), b"ct");
    }

    #[test]
    fn file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert!(store.get(&alice()).is_none());
        store.put(&alice(), Bytes::from_static(b"ct")).unwrap();
        assert_eq!(store.get(&alice()).unwrap().as_ref(), b"ct");
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).unwrap();
            store.put(&alice(), Bytes::from_static(b"ct")).unwrap();
        }
        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.get(&alice()).unwrap().as_ref(), b"ct");
    }

    #[test]
    fn rewrite_replaces_the_value() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.put(&alice(), Bytes::from_static(b"one")).unwrap();
        store.put(&alice(), Bytes::from_static(b"two")).unwrap();
        assert_eq!(store.get(&alice()).unwrap().as_ref(), b"two");
    }

    #[test]
    fn hostile_usernames_stay_inside_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        let key = Username::from("../../etc/passwd");
        store.put(&key, Bytes::from_static(b"ct")).unwrap();
        assert_eq!(store.get(&key).unwrap().as_ref(), b"ct");
        // The only artifacts live directly under the store directory.
        for entry in fs::read_dir(dir.path()).unwrap() {
            let name = entry.unwrap().file_name();
            assert!(name.to_string_lossy().ends_with(".secret"));
        }
    }
}
