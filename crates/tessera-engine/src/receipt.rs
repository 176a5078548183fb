//! Rolling window of transaction receipts.
//!
//! The history keeps `size + 1` slots: one for the tick currently running and
//! `size` for completed ticks. Results and errors can only be written to the
//! current tick; older ticks are read-only until their slot is reused.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

use crate::txpool::TxHash;
use crate::{EngineError, Result};

/// Outcome of one transaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Receipt {
    pub tx_hash: TxHash,
    pub result: Option<Value>,
    pub errors: Vec<String>,
}

impl Receipt {
    fn empty(tx_hash: &TxHash) -> Self {
        Self {
            tx_hash: tx_hash.clone(),
            result: None,
            errors: Vec::new(),
        }
    }
}

/// Ring buffer of per-tick receipts.
#[derive(Debug)]
pub struct ReceiptHistory {
    current_tick: u64,
    slots: Vec<HashMap<TxHash, Receipt>>,
}

impl ReceiptHistory {
    /// Keep receipts for `size` completed ticks, starting at `current_tick`.
    pub fn new(current_tick: u64, size: usize) -> Self {
        Self {
            current_tick,
            slots: vec![HashMap::new(); size + 1],
        }
    }

    /// Number of slots, including the current tick.
    pub fn size(&self) -> u64 {
        self.slots.len() as u64
    }

    pub fn current_tick(&self) -> u64 {
        self.current_tick
    }

    fn slot(&self, tick: u64) -> usize {
        (tick % self.size()) as usize
    }

    /// Advance to the next tick and clear its slot.
    pub fn next_tick(&mut self) {
        self.current_tick += 1;
        let slot = self.slot(self.current_tick);
        self.slots[slot].clear();
    }

    /// Jump to `tick` without clearing anything. Used once after load.
    pub fn set_tick(&mut self, tick: u64) {
        self.current_tick = tick;
    }

    /// Record the result of `hash` in the current tick, replacing any
    /// earlier result.
    pub fn set_result(&mut self, hash: &TxHash, result: Value) {
        let slot = self.slot(self.current_tick);
        self.slots[slot]
            .entry(hash.clone())
            .or_insert_with(|| Receipt::empty(hash))
            .result = Some(result);
    }

    /// Append an error to `hash` in the current tick.
    pub fn add_error(&mut self, hash: &TxHash, error: impl Into<String>) {
        let slot = self.slot(self.current_tick);
        self.slots[slot]
            .entry(hash.clone())
            .or_insert_with(|| Receipt::empty(hash))
            .errors
            .push(error.into());
    }

    /// Receipt for `hash` in the current tick.
    pub fn receipt(&self, hash: &TxHash) -> Option<&Receipt> {
        self.slots[self.slot(self.current_tick)].get(hash)
    }

    /// Most recent receipt for `hash` anywhere in the window, together with
    /// the tick that produced it.
    pub fn find(&self, hash: &TxHash) -> Option<(u64, &Receipt)> {
        (0..self.size())
            .map_while(|back| self.current_tick.checked_sub(back))
            .find_map(|tick| self.slots[self.slot(tick)].get(hash).map(|r| (tick, r)))
    }

    /// All receipts of a completed tick, ordered by hash.
    pub fn receipts_for_tick(&self, tick: u64) -> Result<Vec<Receipt>> {
        if tick >= self.current_tick {
            return Err(EngineError::TickNotProcessed { tick });
        }
        if self.current_tick - tick >= self.size() {
            return Err(EngineError::TickDiscarded { tick });
        }
        let mut receipts: Vec<Receipt> = self.slots[self.slot(tick)].values().cloned().collect();
        receipts.sort_by(|a, b| a.tx_hash.cmp(&b.tx_hash));
        Ok(receipts)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
