//! Tick markers and the per-tick transaction snapshot.
//!
//! A tick writes twice:
//!
//! 1. [`start_next_tick`](CommandBuffer::start_next_tick) persists the
//!    transactions the tick is about to run together with `start = tick + 1`.
//! 2. [`finalize_tick`](CommandBuffer::finalize_tick) commits the flush
//!    pipeline together with `end = tick + 1`.
//!
//! `start == end` on load means the last tick completed. Anything else means
//! the process died between the two commits; the snapshot from step 1 is
//! still in the store and can be replayed.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tessera_store::{get_json, Pipeline};

use crate::command::CommandBuffer;
use crate::{keys, Result};

impl CommandBuffer {
    /// The persisted `(start, end)` markers. Missing markers read as 0.
    pub fn tick_numbers(&self) -> Result<(u64, u64)> {
        let store = self.store().as_ref();
        let start: u64 = get_json(store, keys::START_TICK)?.unwrap_or(0);
        let end: u64 = get_json(store, keys::END_TICK)?.unwrap_or(0);
        Ok((start, end))
    }

    /// Persist the transaction snapshot for `tick` and mark it started.
    pub fn start_next_tick<T: Serialize + ?Sized>(&self, tick: u64, pending: &T) -> Result<()> {
        let mut pipe = Pipeline::new();
        pipe.set_json(keys::PENDING_TRANSACTIONS, pending)?;
        pipe.set_json(keys::START_TICK, &(tick + 1))?;
        self.store().commit(pipe)?;
        Ok(())
    }

    /// Commit all pending state for `tick` and mark it finished, atomically.
    ///
    /// On success the overlay is reset for the next tick. On failure nothing
    /// is written and the overlay is left untouched.
    pub fn finalize_tick(&mut self, tick: u64) -> Result<()> {
        let mut pipe = self.build_flush_pipeline()?;
        pipe.set_json(keys::END_TICK, &(tick + 1))?;
        let ops = pipe.len();
        self.store().commit(pipe)?;
        self.mark_committed();
        tracing::debug!(tick, ops, "tick state committed");
        Ok(())
    }

    /// The transaction snapshot written by the last
    /// [`start_next_tick`](Self::start_next_tick), if any.
    pub fn recover_pending_transactions<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        Ok(get_json(self.store().as_ref(), keys::PENDING_TRANSACTIONS)?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
