//! What a system sees while it runs.

use parking_lot::RwLock;
use serde_json::Value;
use tessera_ecs::command::CommandBuffer;
use tessera_ecs::component::ComponentRegistry;

use crate::receipt::ReceiptHistory;
use crate::txpool::{TxHash, TxSnapshot};

/// Per-system view of the running tick.
///
/// Borrowed from the engine for the duration of one system call: mutable
/// access to the command buffer, read access to the tick's transaction
/// snapshot, and write access to the current tick's receipts.
pub struct EngineContext<'a> {
    tick: u64,
    recovering: bool,
    buffer: &'a mut CommandBuffer,
    registry: &'a ComponentRegistry,
    txs: &'a TxSnapshot,
    receipts: &'a RwLock<ReceiptHistory>,
}

impl<'a> EngineContext<'a> {
    pub(crate) fn new(
        tick: u64,
        recovering: bool,
        buffer: &'a mut CommandBuffer,
        registry: &'a ComponentRegistry,
        txs: &'a TxSnapshot,
        receipts: &'a RwLock<ReceiptHistory>,
    ) -> Self {
        Self {
            tick,
            recovering,
            buffer,
            registry,
            txs,
            receipts,
        }
    }

    /// The tick being executed.
    pub fn current_tick(&self) -> u64 {
        self.tick
    }

    /// Whether this tick is being replayed from the ordering adapter.
    pub fn is_recovering(&self) -> bool {
        self.recovering
    }

    pub fn buffer(&mut self) -> &mut CommandBuffer {
        self.buffer
    }

    /// Read-only access to the command buffer, for [`Search`](tessera_ecs::search::Search)
    /// and other [`StateReader`](tessera_ecs::reader::StateReader) consumers.
    pub fn reader(&self) -> &CommandBuffer {
        self.buffer
    }

    pub fn registry(&self) -> &ComponentRegistry {
        self.registry
    }

    /// All transactions taken for this tick.
    pub fn txs(&self) -> &TxSnapshot {
        self.txs
    }

    pub fn set_result(&mut self, hash: &TxHash, result: Value) {
        self.receipts.write().set_result(hash, result);
    }

    pub fn add_error(&mut self, hash: &TxHash, error: impl Into<String>) {
        self.receipts.write().add_error(hash, error);
    }
}
