//! External ordering adapter.
//!
//! After every tick with transactions the engine forwards the batch to an
//! [`Adapter`], which keeps an ordered, namespaced history of batches.
//! [`Engine::recover_from_chain`](crate::engine::Engine::recover_from_chain)
//! pages through that history to rebuild state from scratch.
//!
//! The transport behind an adapter is not the engine's concern.
//! [`InMemoryAdapter`] keeps everything in process and serves as the local
//! development backend.

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::MessageTypeId;
use crate::txpool::{Signature, TxHash, TxSnapshot};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Envelope stored in [`BatchTx::payload`]: the hash the transaction was
/// accepted under, its signature and the message body.
///
/// Replay queues the transaction under `hash` as stored, so receipts of a
/// recovered engine are keyed exactly as the originals were.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedPayload {
    pub hash: TxHash,
    pub signature: Signature,
    pub body: Value,
}

impl SignedPayload {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// One transaction in a historical batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchTx {
    pub tx_id: MessageTypeId,
    /// Encoded [`SignedPayload`].
    pub payload: Vec<u8>,
}

/// All transactions submitted for one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickBatch {
    pub tick: u64,
    pub txs: Vec<BatchTx>,
}

/// Continuation for the next page. An empty key means there is none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageResponse {
    pub key: Vec<u8>,
}

/// One page of history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchPage {
    pub batches: Vec<TickBatch>,
    pub page: Option<PageResponse>,
}

// ---------------------------------------------------------------------------
// Adapter trait
// ---------------------------------------------------------------------------

/// Submit-and-query access to the external ordering log.
pub trait Adapter: Send + Sync {
    /// Record the batch processed at `tick`.
    fn submit(
        &self,
        batch: &TxSnapshot,
        namespace: &str,
        tick: u64,
        timestamp: u64,
    ) -> anyhow::Result<()>;

    /// Fetch the page of batches starting at `page_key` (`None` for the
    /// first page).
    fn query_batches(&self, namespace: &str, page_key: Option<&[u8]>) -> anyhow::Result<BatchPage>;

    /// Release any connection held by the adapter.
    fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Turn a tick's snapshot into adapter batch entries.
pub fn encode_batch(batch: &TxSnapshot) -> anyhow::Result<Vec<BatchTx>> {
    batch
        .transactions()
        .iter()
        .map(|tx| {
            let payload = SignedPayload {
                hash: tx.hash.clone(),
                signature: tx.signature.clone(),
                body: tx.payload.clone(),
            }
            .encode()?;
            Ok(BatchTx {
                tx_id: tx.type_id,
                payload,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// InMemoryAdapter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StoredBatch {
    batch: TickBatch,
    timestamp: u64,
}

/// In-process adapter that serves submitted batches back in pages.
///
/// Page keys are the decimal index of the next batch.
pub struct InMemoryAdapter {
    page_size: usize,
    namespaces: Mutex<HashMap<String, Vec<StoredBatch>>>,
}

impl fmt::Debug for InMemoryAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryAdapter")
            .field("page_size", &self.page_size)
            .field("namespaces", &self.namespaces.lock().len())
            .finish()
    }
}

impl Default for InMemoryAdapter {
    fn default() -> Self {
        Self::new(100)
    }
}

impl InMemoryAdapter {
    /// An empty adapter serving at most `page_size` batches per page.
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size.max(1),
            namespaces: Mutex::new(HashMap::new()),
        }
    }

    /// Append a batch directly, as if another engine had submitted it.
    pub fn push_batch(&self, namespace: &str, batch: TickBatch) {
        self.namespaces
            .lock()
            .entry(namespace.to_owned())
            .or_default()
            .push(StoredBatch {
                batch,
                timestamp: 0,
            });
    }

    /// Every batch recorded for `namespace`, oldest first.
    pub fn batches(&self, namespace: &str) -> Vec<TickBatch> {
        self.namespaces
            .lock()
            .get(namespace)
            .map(|stored| stored.iter().map(|s| s.batch.clone()).collect())
            .unwrap_or_default()
    }

    /// Submission timestamps for `namespace`, oldest first.
    pub fn timestamps(&self, namespace: &str) -> Vec<u64> {
        self.namespaces
            .lock()
            .get(namespace)
            .map(|stored| stored.iter().map(|s| s.timestamp).collect())
            .unwrap_or_default()
    }
}

impl Adapter for InMemoryAdapter {
    fn submit(
        &self,
        batch: &TxSnapshot,
        namespace: &str,
        tick: u64,
        timestamp: u64,
    ) -> anyhow::Result<()> {
        let txs = encode_batch(batch)?;
        self.namespaces
            .lock()
            .entry(namespace.to_owned())
            .or_default()
            .push(StoredBatch {
                batch: TickBatch { tick, txs },
                timestamp,
            });
        Ok(())
    }

    fn query_batches(&self, namespace: &str, page_key: Option<&[u8]>) -> anyhow::Result<BatchPage> {
        let start = match page_key {
            Some(key) if !key.is_empty() => std::str::from_utf8(key)?.parse::<usize>()?,
            _ => 0,
        };
        let namespaces = self.namespaces.lock();
        let Some(stored) = namespaces.get(namespace) else {
            return Ok(BatchPage::default());
        };

        let end = (start + self.page_size).min(stored.len());
        let batches = stored
            .get(start..end)
            .unwrap_or_default()
            .iter()
            .map(|s| s.batch.clone())
            .collect();
        let page = (end < stored.len()).then(|| PageResponse {
            key: end.to_string().into_bytes(),
        });
        Ok(BatchPage { batches, page })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
