//! In-process [`KvStore`] backend.
//!
//! Data lives in a map shared by every clone of a [`MemoryStore`]; the
//! open/closed state belongs to each handle. Dropping the engine that owns
//! one handle and building a new engine over a clone therefore behaves like
//! a process restart against the same database.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::{KvStore, Pipeline, Result, StoreError};

// ---------------------------------------------------------------------------
// Fault injection
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct FaultPlan {
    /// Reject this many upcoming commits unconditionally.
    fail_next: usize,
    /// Reject every commit whose pipeline touches one of these keys.
    poisoned_keys: Vec<String>,
}

impl FaultPlan {
    fn should_fail(&mut self, pipeline: &Pipeline) -> bool {
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return true;
        }
        self.poisoned_keys.iter().any(|key| pipeline.touches(key))
    }
}

#[derive(Debug, Default)]
struct Shared {
    data: RwLock<BTreeMap<String, Vec<u8>>>,
    faults: Mutex<FaultPlan>,
    commits: AtomicU64,
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// A cloneable in-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
    closed: AtomicBool,
}

impl Clone for MemoryStore {
    /// The clone shares data with `self` but starts out open.
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            closed: AtomicBool::new(false),
        }
    }
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail with [`StoreError::Injected`].
    pub fn fail_next_commits(&self, n: usize) {
        self.shared.faults.lock().fail_next = n;
    }

    /// Make every commit that touches `key` fail until [`clear_faults`](Self::clear_faults).
    pub fn fail_commits_touching(&self, key: impl Into<String>) {
        self.shared.faults.lock().poisoned_keys.push(key.into());
    }

    /// Remove all injected faults.
    pub fn clear_faults(&self) {
        *self.shared.faults.lock() = FaultPlan::default();
    }

    /// Number of commits that were applied successfully.
    pub fn commit_count(&self) -> u64 {
        self.shared.commits.load(Ordering::Acquire)
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.shared.data.read().len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All keys starting with `prefix`, in order.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.shared
            .data
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.ensure_open()?;
        Ok(self.shared.data.read().get(key).cloned())
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
        if self.shared.faults.lock().should_fail(&pipeline) {
            tracing::debug!(ops = pipeline.len(), "memory store rejecting commit");
            return Err(StoreError::Injected {
                ops: pipeline.len(),
            });
        }
        // One write lock for the whole batch keeps readers from observing a
        // half-applied pipeline.
        let mut data = self.shared.data.write();
        pipeline.apply_to(&mut data);
        self.shared.commits.fetch_add(1, Ordering::AcqRel);
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
