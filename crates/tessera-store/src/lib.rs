//! Tessera Store -- the durable key-value layer underneath the Tessera ECS.
//!
//! Everything the command buffer persists goes through the [`KvStore`] trait:
//! point reads, point writes, and an atomic multi-operation [`Pipeline`]
//! commit. Two backends ship with the crate:
//!
//! - [`MemoryStore`]: shared in-process map. Clones see the same data, which
//!   makes "restart over the same store" cheap to express in tests. Supports
//!   commit fault injection.
//! - [`FileStore`]: single-file snapshot, rewritten atomically on every
//!   commit (temp file, fsync, rename).
//!
//! # Quick Start
//!
//! ```
//! use tessera_store::prelude::*;
//!
//! let store = MemoryStore::new();
//! let mut pipe = Pipeline::new();
//! pipe.set("greeting", b"hello".to_vec());
//! pipe.delete("stale");
//! store.commit(pipe).unwrap();
//!
//! assert_eq!(store.get("greeting").unwrap(), Some(b"hello".to_vec()));
//! assert_eq!(store.get("stale").unwrap(), None);
//! ```

#![deny(unsafe_code)]

pub mod file;
pub mod memory;
pub mod pipeline;
pub mod schema;

use std::path::PathBuf;

pub use file::FileStore;
pub use memory::MemoryStore;
pub use pipeline::{Op, Pipeline};
pub use schema::SchemaStorage;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by durable store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Reading or writing the backing file failed.
    #[error("store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A stored value could not be encoded or decoded.
    #[error("failed to decode value at key '{key}': {details}")]
    Codec { key: String, details: String },

    /// The handle was closed with [`KvStore::close`].
    #[error("store connection is closed")]
    Closed,

    /// A commit was rejected by [`MemoryStore`] fault injection.
    #[error("injected commit failure ({ops} ops discarded)")]
    Injected { ops: usize },

    /// Any other backend-specific failure.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Convenience alias used throughout the store crate.
pub type Result<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// KvStore
// ---------------------------------------------------------------------------

/// A durable key-value backend.
///
/// Implementations must make [`commit`](KvStore::commit) all-or-nothing:
/// either every operation in the pipeline becomes visible or none does.
/// Single-key [`set`](KvStore::set) and [`delete`](KvStore::delete) are
/// conveniences for one-operation pipelines.
pub trait KvStore: Send + Sync {
    /// Read a value. `Ok(None)` means the key is not present.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write a single key.
    fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Remove a single key. Removing a missing key is not an error.
    fn delete(&self, key: &str) -> Result<()>;

    /// Atomically apply every operation in `pipeline`, in order.
    fn commit(&self, pipeline: Pipeline) -> Result<()>;

    /// Release the connection. Closing an already closed handle is a no-op.
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JSON helpers
// ---------------------------------------------------------------------------

/// Serialize `value` to JSON bytes, tagging failures with `key`.
pub fn encode_json<T: serde::Serialize + ?Sized>(key: &str, value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StoreError::Codec {
        key: key.to_owned(),
        details: e.to_string(),
    })
}

/// Deserialize JSON bytes read from `key`.
pub fn decode_json<T: serde::de::DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Codec {
        key: key.to_owned(),
        details: e.to_string(),
    })
}

/// Read and decode a JSON value, returning `Ok(None)` when the key is absent.
pub fn get_json<T: serde::de::DeserializeOwned>(
    store: &dyn KvStore,
    key: &str,
) -> Result<Option<T>> {
    match store.get(key)? {
        Some(bytes) => decode_json(key, &bytes).map(Some),
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::file::FileStore;
    pub use crate::memory::MemoryStore;
    pub use crate::pipeline::{Op, Pipeline};
    pub use crate::schema::SchemaStorage;
    pub use crate::{KvStore, StoreError};
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
