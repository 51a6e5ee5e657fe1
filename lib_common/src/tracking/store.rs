//! # Persistent Identifier Store
//!
//! Durable storage for the ordered list of tracked numbers. The on-disk
//! format is a small versioned envelope:
//!
//! ```json
//! {"version": 1, "key": "track17_packages", "data": ["LP1", "LP2"]}
//! ```
//!
//! Writes go to a temporary file in the same directory which is then renamed
//! over the target, so readers see either the old list or the new one.

use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::{STORAGE_KEY, STORAGE_VERSION};

/// Storage-layer failures. The coordinator logs these and carries on.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Reading, writing or renaming the file failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file exists but is not a JSON envelope.
    #[error("Corrupt storage file {path}: {source}")]
    Corrupt {
        /// File involved.
        path: PathBuf,
        /// Parse error.
        #[source]
        source: serde_json::Error,
    },

    /// The file was written by a newer release.
    #[error("Unsupported storage version {found} in {path} (supported: {supported})")]
    Version {
        /// File involved.
        path: PathBuf,
        /// Version found on disk.
        found: u32,
        /// Highest version this build reads.
        supported: u32,
    },

    /// The identifier list could not be encoded.
    #[error("Failed to encode identifiers: {0}")]
    Encode(#[source] serde_json::Error),

    /// The blocking I/O task panicked or was cancelled.
    #[error("Storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Load/save of the tracked-number list.
pub trait IdentifierStore: Send + Sync + 'static {
    /// Returns the stored list, or an empty one when nothing (list-shaped) was stored.
    fn load(&self) -> impl Future<Output = Result<Vec<String>, StoreError>> + Send;

    /// Replaces the stored list.
    fn save(&self, identifiers: &[String]) -> impl Future<Output = Result<(), StoreError>> + Send;
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    version: u32,
    #[serde(default)]
    key: Option<String>,
    data: T,
}

/// JSON file store.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Store backed by exactly `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at `<dir>/track17_packages`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(STORAGE_KEY))
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl IdentifierStore for JsonFileStore {
    async fn load(&self) -> Result<Vec<String>, StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || read_identifiers(&path)).await?
    }

    async fn save(&self, identifiers: &[String]) -> Result<(), StoreError> {
        let envelope = Envelope {
            version: STORAGE_VERSION,
            key: Some(STORAGE_KEY.to_string()),
            data: identifiers,
        };
        let bytes = serde_json::to_vec_pretty(&envelope).map_err(StoreError::Encode)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&path, &bytes)).await?
    }
}

fn read_identifiers(path: &Path) -> Result<Vec<String>, StoreError> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let envelope: Envelope<Value> =
        serde_json::from_slice(&raw).map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;
    if envelope.version > STORAGE_VERSION {
        return Err(StoreError::Version {
            path: path.to_path_buf(),
            found: envelope.version,
            supported: STORAGE_VERSION,
        });
    }

    let Value::Array(items) = envelope.data else {
        log::warn!(
            "Stored tracking numbers in {} are not a list; starting empty",
            path.display()
        );
        return Ok(Vec::new());
    };

    let total = items.len();
    let identifiers: Vec<String> = items
        .into_iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(s),
            _ => None,
        })
        .collect();
    if identifiers.len() != total {
        log::warn!(
            "Skipped {} non-string entries in {}",
            total - identifiers.len(),
            path.display()
        );
    }
    Ok(identifiers)
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir).map_err(io_err)?;

    let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(io_err)?;
    tmp.write_all(bytes).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

/// In-memory store for ephemeral deployments. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    identifiers: Mutex<Vec<String>>,
}

impl MemoryStore {
    /// A store pre-seeded with `identifiers`.
    pub fn with_identifiers(identifiers: Vec<String>) -> Self {
        Self {
            identifiers: Mutex::new(identifiers),
        }
    }

    /// The currently stored list.
    pub fn identifiers(&self) -> Vec<String> {
        self.identifiers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl IdentifierStore for MemoryStore {
    async fn load(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.identifiers())
    }

    async fn save(&self, identifiers: &[String]) -> Result<(), StoreError> {
        *self
            .identifiers
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = identifiers.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ids(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_missing_file_loads_empty() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::in_dir(dir.path());
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_then_load_keeps_order() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::in_dir(dir.path().join(".storage"));

        store.save(&ids(&["LP3", "LP1", "LP2"])).await.unwrap();

        let reopened = JsonFileStore::in_dir(dir.path().join(".storage"));
        assert_eq!(reopened.load().await.unwrap(), ids(&["LP3", "LP1", "LP2"]));

        let on_disk: Value = serde_json::from_slice(&std::fs::read(store.path()).unwrap()).unwrap();
        assert_eq!(on_disk["version"], STORAGE_VERSION);
        assert_eq!(on_disk["key"], STORAGE_KEY);
    }

    #[tokio::test]
    async fn test_save_replaces_without_leftovers() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::in_dir(dir.path());

        store.save(&ids(&["LP1", "LP2"])).await.unwrap();
        store.save(&ids(&["LP2"])).await.unwrap();

        assert_eq!(store.load().await.unwrap(), ids(&["LP2"]));
        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1, "temporary files must not be left behind");
    }

    #[tokio::test]
    async fn test_non_list_data_loads_empty() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::in_dir(dir.path());
        std::fs::write(
            store.path(),
            r#"{"version":1,"key":"track17_packages","data":{"LP1":true}}"#,
        )
        .unwrap();

        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_non_string_entries_are_skipped() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::in_dir(dir.path());
        std::fs::write(store.path(), r#"{"version":1,"data":["LP1",7,null,"LP2"]}"#).unwrap();

        assert_eq!(store.load().await.unwrap(), ids(&["LP1", "LP2"]));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::in_dir(dir.path());
        std::fs::write(store.path(), "{not json").unwrap();

        assert!(matches!(store.load().await, Err(StoreError::Corrupt { .. })));
    }

    #[tokio::test]
    async fn test_newer_version_is_an_error() {
        let dir = tempdir().unwrap();
        let store = JsonFileStore::in_dir(dir.path());
        std::fs::write(store.path(), r#"{"version":9,"data":["LP1"]}"#).unwrap();

        assert!(matches!(
            store.load().await,
            Err(StoreError::Version { found: 9, .. })
        ));
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryStore::with_identifiers(ids(&["LP1"]));
        assert_eq!(store.load().await.unwrap(), ids(&["LP1"]));
        store.save(&ids(&["LP1", "LP2"])).await.unwrap();
        assert_eq!(store.identifiers(), ids(&["LP1", "LP2"]));
    }
}
