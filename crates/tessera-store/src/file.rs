//! Single-file durable [`KvStore`] backend.
//!
//! The whole keyspace is held in memory and mirrored to one JSON snapshot on
//! disk. Each commit builds the next map, writes it to a sibling temp file,
//! fsyncs it, and renames it over the snapshot, so a crash leaves either the
//! previous or the new state on disk and never a mix.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use crate::{KvStore, Pipeline, Result, StoreError};

/// Snapshot format version written to disk.
const SNAPSHOT_VERSION: u32 = 1;

#[derive(serde::Serialize, serde::Deserialize)]
struct Snapshot {
    version: u32,
    entries: BTreeMap<String, Vec<u8>>,
}

/// A store persisted to a single file.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    data: RwLock<BTreeMap<String, Vec<u8>>>,
    closed: AtomicBool,
}

impl FileStore {
    /// Open the snapshot at `path`, creating an empty store if it does not
    /// exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            let bytes = std::fs::read(&path).map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;
            let snapshot: Snapshot = crate::decode_json(&path.display().to_string(), &bytes)?;
            if snapshot.version != SNAPSHOT_VERSION {
                return Err(StoreError::Backend(format!(
                    "unsupported snapshot version {} in {}",
                    snapshot.version,
                    path.display()
                )));
            }
            snapshot.entries
        } else {
            BTreeMap::new()
        };

        tracing::info!(path = %path.display(), keys = entries.len(), "opened file store");

        Ok(Self {
            path,
            data: RwLock::new(entries),
            closed: AtomicBool::new(false),
        })
    }

    /// Location of the snapshot file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn io_err(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }

    /// Atomic write: temp + fsync + rename.
    fn persist(&self, entries: &BTreeMap<String, Vec<u8>>) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir).map_err(|e| self.io_err(e))?;
            }
        }

        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            entries: entries.clone(),
        };
        let bytes = crate::encode_json(&self.path.display().to_string(), &snapshot)?;

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut file = std::fs::File::create(&tmp_path).map_err(|e| self.io_err(e))?;
            file.write_all(&bytes).map_err(|e| self.io_err(e))?;
            file.sync_all().map_err(|e| self.io_err(e))?;
        }
        std::fs::rename(&tmp_path, &self.path).map_err(|e| self.io_err(e))?;
        Ok(())
    }
}

impl KvStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        Ok(self.data.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut pipe = Pipeline::new();
        pipe.set(key, value);
        self.commit(pipe)
    }

    fn delete(&self, key: &str) -> Result<()> {
        let mut pipe = Pipeline::new();
        pipe.delete(key);
        self.commit(pipe)
    }

    fn commit(&self, pipeline: Pipeline) -> Result<()> {
        self.ensure_open()?;
        let mut data = self.data.write();
        let mut next = data.clone();
        pipeline.apply_to(&mut next);
        // The in-memory view only moves forward once the file is durable.
        self.persist(&next)?;
        *data = next;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reopen_restores_committed_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        {
            let store = FileStore::open(&path).unwrap();
            let mut pipe = Pipeline::new();
            pipe.set("a", vec![1, 2]);
            pipe.set("b", vec![3]);
            store.commit(pipe).unwrap();
            store.delete("b").unwrap();
        }

        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.get("a").unwrap(), Some(vec![1, 2]));
        assert_eq!(store.get("b").unwrap(), None);
    }

    #[test]
    fn no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = FileStore::open(&path).unwrap();
        store.set("k", vec![1]).unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn closed_store_rejects_operations() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("s.json")).unwrap();
        store.close().unwrap();
        assert!(matches!(store.get("k"), Err(StoreError::Closed)));
        assert!(matches!(store.set("k", vec![]), Err(StoreError::Closed)));
    }

    #[test]
    fn corrupt_snapshot_is_a_codec_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        std::fs::write(&path, b"{ not valid").unwrap();
        assert!(matches!(FileStore::open(&path), Err(StoreError::Codec { .. })));
    }
}
