//! Bringing an engine back to a consistent tick.
//!
//! Two paths exist:
//!
//! - **Local** (automatic, on [`Engine::load_game_state`]): if the persisted
//!   start and end markers differ, the process died mid-tick. The
//!   transactions snapshotted for that tick are put back in the queue and
//!   the tick is run again.
//! - **From the ordering adapter** ([`Engine::recover_from_chain`]): replay
//!   every historical batch into an empty namespace, ticking forward with
//!   empty queues between batches. The whole history is fetched and decoded
//!   first; an out-of-order batch or an undecodable payload fails the call
//!   before any tick runs.

use tracing::{info, warn};

use crate::adapter::{Adapter, SignedPayload};
use crate::engine::Engine;
use crate::message::MessageTypeId;
use crate::txpool::{QueuedTx, TxSnapshot};
use crate::{EngineError, Result};

impl Engine {
    /// Complete a tick that started but never finished.
    pub(crate) fn recover_local(&mut self) -> Result<()> {
        let (start, end) = self.command_buffer().tick_numbers()?;
        self.set_current_tick(end);
        self.receipt_history().write().set_tick(end);
        if start == end {
            return Ok(());
        }

        let snapshot: TxSnapshot = self
            .command_buffer()
            .recover_pending_transactions()?
            .ok_or(EngineError::MissingTickSnapshot { tick: end })?;
        warn!(
            tick = end,
            txs = snapshot.len(),
            "last tick did not finish, replaying its transactions"
        );
        self.requeue(snapshot);
        self.tick()
    }

    /// Rebuild state by replaying the adapter's history for this namespace.
    ///
    /// Requires an adapter and a namespace whose tick counter is still 0.
    /// Transactions are not re-submitted while recovering.
    pub fn recover_from_chain(&mut self) -> Result<()> {
        let adapter = self.adapter().cloned().ok_or(EngineError::NoAdapter)?;
        if self.current_tick() > 0 {
            return Err(EngineError::NonEmptyState {
                tick: self.current_tick(),
            });
        }

        self.set_recovering(true);
        let namespace = self.namespace().to_owned();
        info!(namespace = %namespace, "recovering from ordering adapter");
        let result = self.replay_batches(adapter.as_ref(), &namespace);
        self.set_recovering(false);

        let batches = result?;
        info!(
            namespace = %namespace,
            batches,
            tick = self.current_tick(),
            "recovery from ordering adapter finished"
        );
        Ok(())
    }

    fn replay_batches(&mut self, adapter: &dyn Adapter, namespace: &str) -> Result<usize> {
        let history = self.fetch_history(adapter, namespace)?;
        let batches = history.len();
        for (tick, txs) in history {
            while self.current_tick() < tick {
                self.tick()?;
            }
            for (type_id, signed) in txs {
                self.queue_replayed(QueuedTx {
                    type_id,
                    hash: signed.hash,
                    payload: signed.body,
                    signature: signed.signature,
                });
            }
            self.tick()?;
        }
        Ok(batches)
    }

    /// Page through the adapter and decode everything before any tick runs,
    /// so an out-of-order batch or a bad payload applies nothing.
    fn fetch_history(
        &self,
        adapter: &dyn Adapter,
        namespace: &str,
    ) -> Result<Vec<(u64, Vec<(MessageTypeId, SignedPayload)>)>> {
        let mut history = Vec::new();
        let mut next_tick = self.current_tick();
        let mut page_key: Option<Vec<u8>> = None;
        loop {
            let page = adapter
                .query_batches(namespace, page_key.as_deref())
                .map_err(|source| EngineError::Adapter {
                    tick: self.current_tick(),
                    source,
                })?;

            for batch in page.batches {
                if batch.tick < next_tick {
                    return Err(EngineError::BatchBehindTick {
                        batch_tick: batch.tick,
                        current_tick: next_tick,
                    });
                }
                let txs = batch
                    .txs
                    .iter()
                    .map(|tx| self.decode(tx.tx_id, &tx.payload).map(|s| (tx.tx_id, s)))
                    .collect::<Result<Vec<_>>>()?;
                history.push((batch.tick, txs));
                next_tick = batch.tick + 1;
            }

            match page.page {
                Some(next) if !next.key.is_empty() => page_key = Some(next.key),
                _ => return Ok(history),
            }
        }
    }

    fn decode(&self, tx_id: MessageTypeId, payload: &[u8]) -> Result<SignedPayload> {
        let signed = SignedPayload::decode(payload).map_err(|e| EngineError::MessageDecode {
            name: format!("#{tx_id}"),
            details: e.to_string(),
        })?;
        self.validate_message(tx_id, &signed.body)?;
        Ok(signed)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
