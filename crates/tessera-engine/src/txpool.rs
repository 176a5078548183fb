//! The transaction queue: a concurrency-safe inbox for the next tick.
//!
//! Producers call [`TxQueue::add_transaction`] from any thread at any time.
//! Once per tick the engine calls [`TxQueue::snapshot_and_clear`]; anything
//! added before that call is part of the tick, anything added after it
//! waits for the next one.

use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::MessageTypeId;

// ---------------------------------------------------------------------------
// Signature
// ---------------------------------------------------------------------------

/// Signed-envelope metadata carried with every transaction.
///
/// Validation happens upstream; the engine only stores and forwards it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature {
    pub persona_tag: String,
    pub namespace: String,
    pub nonce: u64,
    pub signature: String,
}

// ---------------------------------------------------------------------------
// TxHash
// ---------------------------------------------------------------------------

/// Content hash identifying one queued transaction.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxHash(String);

impl TxHash {
    /// BLAKE3 over the message type id, the payload and the signature.
    pub fn compute(type_id: MessageTypeId, payload: &Value, signature: &Signature) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&type_id.get().to_le_bytes());
        hasher.update(payload.to_string().as_bytes());
        hasher.update(signature.persona_tag.as_bytes());
        hasher.update(&[0]);
        hasher.update(signature.namespace.as_bytes());
        hasher.update(&[0]);
        hasher.update(&signature.nonce.to_le_bytes());
        hasher.update(signature.signature.as_bytes());
        Self(hasher.finalize().to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxHash({})", &self.0[..self.0.len().min(12)])
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// QueuedTx / TxSnapshot
// ---------------------------------------------------------------------------

/// One transaction as it sits in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedTx {
    pub type_id: MessageTypeId,
    pub hash: TxHash,
    pub payload: Value,
    pub signature: Signature,
}

/// The transactions taken for one tick, in arrival order.
///
/// This is also the shape persisted with the tick start marker, so a
/// crashed tick can be replayed from it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TxSnapshot {
    txs: Vec<QueuedTx>,
}

impl TxSnapshot {
    /// Transactions of one message type, in arrival order.
    pub fn for_type(&self, id: MessageTypeId) -> impl Iterator<Item = &QueuedTx> {
        self.txs.iter().filter(move |tx| tx.type_id == id)
    }

    pub fn transactions(&self) -> &[QueuedTx] {
        &self.txs
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }
}

// ---------------------------------------------------------------------------
// TxQueue
// ---------------------------------------------------------------------------

/// Mutex-guarded queue of transactions awaiting the next tick.
#[derive(Debug, Default)]
pub struct TxQueue {
    pending: Mutex<Vec<QueuedTx>>,
}

impl TxQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a transaction and return its hash.
    pub fn add_transaction(
        &self,
        type_id: MessageTypeId,
        payload: Value,
        signature: Signature,
    ) -> TxHash {
        let hash = TxHash::compute(type_id, &payload, &signature);
        self.push(QueuedTx {
            type_id,
            hash: hash.clone(),
            payload,
            signature,
        });
        hash
    }

    /// Enqueue a transaction whose hash was assigned when it was first
    /// accepted.
    pub(crate) fn push(&self, tx: QueuedTx) {
        self.pending.lock().push(tx);
    }

    /// Take everything queued so far, leaving the queue empty.
    pub fn snapshot_and_clear(&self) -> TxSnapshot {
        TxSnapshot {
            txs: std::mem::take(&mut *self.pending.lock()),
        }
    }

    /// Put a persisted snapshot back in front of anything queued since.
    pub fn restore(&self, snapshot: TxSnapshot) {
        let mut pending = self.pending.lock();
        let later = std::mem::replace(&mut *pending, snapshot.txs);
        pending.extend(later);
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use serde_json::json;

    use super::*;

    fn sig(nonce: u64) -> Signature {
        Signature {
            persona_tag: "alice".into(),
            nonce,
            ..Default::default()
        }
    }

    // -- 1. Hashing ---------------------------------------------------------

    #[test]
    fn hash_depends_on_every_input() {
        let base = TxHash::compute(MessageTypeId::new(1), &json!({"a": 1}), &sig(0));
        assert_eq!(base, TxHash::compute(MessageTypeId::new(1), &json!({"a": 1}), &sig(0)));
        assert_ne!(base, TxHash::compute(MessageTypeId::new(2), &json!({"a": 1}), &sig(0)));
        assert_ne!(base, TxHash::compute(MessageTypeId::new(1), &json!({"a": 2}), &sig(0)));
        assert_ne!(base, TxHash::compute(MessageTypeId::new(1), &json!({"a": 1}), &sig(1)));
        assert_eq!(base.as_str().len(), 64);
    }

    // -- 2. Snapshot semantics ----------------------------------------------

    #[test]
    fn snapshot_takes_everything_and_clears() {
        let queue = TxQueue::new();
        queue.add_transaction(MessageTypeId::new(1), json!(1), sig(0));
        queue.add_transaction(MessageTypeId::new(2), json!(2), sig(1));
        queue.add_transaction(MessageTypeId::new(1), json!(3), sig(2));

        let snapshot = queue.snapshot_and_clear();
        assert!(queue.is_empty());
        assert_eq!(snapshot.len(), 3);

        let ones: Vec<&Value> = snapshot
            .for_type(MessageTypeId::new(1))
            .map(|tx| &tx.payload)
            .collect();
        assert_eq!(ones, [&json!(1), &json!(3)]);

        // Later additions do not leak into an existing snapshot.
        queue.add_transaction(MessageTypeId::new(1), json!(4), sig(3));
        assert_eq!(snapshot.for_type(MessageTypeId::new(1)).count(), 2);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn restore_puts_snapshot_first() {
        let queue = TxQueue::new();
        queue.add_transaction(MessageTypeId::new(1), json!("old"), sig(0));
        let snapshot = queue.snapshot_and_clear();

        queue.add_transaction(MessageTypeId::new(1), json!("new"), sig(1));
        queue.restore(snapshot);

        let all = queue.snapshot_and_clear();
        let payloads: Vec<&Value> = all.transactions().iter().map(|tx| &tx.payload).collect();
        assert_eq!(payloads, [&json!("old"), &json!("new")]);
    }

    #[test]
    fn snapshot_round_trips_through_json() {
        let queue = TxQueue::new();
        queue.add_transaction(MessageTypeId::new(3), json!({"x": [1, 2]}), sig(9));
        let snapshot = queue.snapshot_and_clear();

        let bytes = serde_json::to_vec(&snapshot).unwrap();
        let back: TxSnapshot = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, snapshot);
    }

    // -- 3. Concurrency -----------------------------------------------------

    #[test]
    fn concurrent_producers_lose_nothing() {
        let queue = Arc::new(TxQueue::new());
        let mut snapshots = Vec::new();

        let producers: Vec<_> = (0..4u64)
            .map(|p| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for i in 0..250 {
                        queue.add_transaction(MessageTypeId::new(1), json!(i), sig(p * 1000 + i));
                    }
                })
            })
            .collect();

        while producers.iter().any(|h| !h.is_finished()) {
            snapshots.push(queue.snapshot_and_clear());
        }
        for handle in producers {
            handle.join().unwrap();
        }
        snapshots.push(queue.snapshot_and_clear());

        let total: usize = snapshots.iter().map(TxSnapshot::len).sum();
        assert_eq!(total, 1000);
    }
}
