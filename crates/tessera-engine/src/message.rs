//! Message types: the typed vocabulary of transactions.
//!
//! Each message type is registered once, before the game state is loaded,
//! and gets a [`MessageTypeId`] in registration order starting at 1. The
//! registry keeps one validation function per type, so payloads arriving as
//! raw JSON (from producers or from the ordering adapter) can be checked
//! without knowing the concrete Rust type at the call site.
//!
//! Systems use the typed [`MessageType`] handle returned by
//! [`Engine::register_message`](crate::engine::Engine::register_message)
//! to read the current tick's transactions and record their outcome.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::EngineContext;
use crate::engine::TxSubmitter;
use crate::txpool::{Signature, TxHash};
use crate::{EngineError, Result};

// ---------------------------------------------------------------------------
// MessageTypeId
// ---------------------------------------------------------------------------

/// Identifier of a registered message type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageTypeId(u32);

impl MessageTypeId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for MessageTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageTypeId({})", self.0)
    }
}

impl fmt::Display for MessageTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// MessageRegistry
// ---------------------------------------------------------------------------

/// Registered metadata for one message type.
#[derive(Debug, Clone)]
pub struct MessageInfo {
    pub id: MessageTypeId,
    pub name: String,
    validate_fn: fn(&Value) -> std::result::Result<(), String>,
}

impl MessageInfo {
    /// Check that `payload` decodes as this message's input type.
    pub fn validate(&self, payload: &Value) -> Result<()> {
        (self.validate_fn)(payload).map_err(|details| EngineError::MessageDecode {
            name: self.name.clone(),
            details,
        })
    }
}

fn validate_as<In: DeserializeOwned>(payload: &Value) -> std::result::Result<(), String> {
    In::deserialize(payload).map(|_| ()).map_err(|e| e.to_string())
}

/// All message types known to one engine.
#[derive(Debug, Default)]
pub struct MessageRegistry {
    infos: Vec<MessageInfo>,
    by_name: HashMap<String, MessageTypeId>,
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `In` under `name`. Ids start at 1.
    pub fn register<In: DeserializeOwned>(&mut self, name: &str) -> Result<MessageTypeId> {
        if self.by_name.contains_key(name) {
            return Err(EngineError::DuplicateMessageName {
                name: name.to_owned(),
            });
        }
        let id = MessageTypeId(self.infos.len() as u32 + 1);
        self.infos.push(MessageInfo {
            id,
            name: name.to_owned(),
            validate_fn: validate_as::<In>,
        });
        self.by_name.insert(name.to_owned(), id);
        Ok(id)
    }

    pub fn info(&self, id: MessageTypeId) -> Option<&MessageInfo> {
        let index = (id.0 as usize).checked_sub(1)?;
        self.infos.get(index)
    }

    pub fn require(&self, id: MessageTypeId) -> Result<&MessageInfo> {
        self.info(id)
            .ok_or(EngineError::UnknownMessage { id: id.get() })
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<MessageTypeId> {
        self.by_name.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MessageInfo> {
        self.infos.iter()
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }
}

// ---------------------------------------------------------------------------
// TxData
// ---------------------------------------------------------------------------

/// One decoded transaction handed to a system.
#[derive(Debug, Clone)]
pub struct TxData<In> {
    pub hash: TxHash,
    pub msg: In,
    pub signature: Signature,
}

// ---------------------------------------------------------------------------
// MessageType
// ---------------------------------------------------------------------------

/// Typed handle to a registered message type.
///
/// `In` is the transaction payload, `Out` the result recorded in its
/// receipt.
pub struct MessageType<In, Out> {
    id: MessageTypeId,
    name: &'static str,
    _marker: PhantomData<fn(In) -> Out>,
}

impl<In, Out> Clone for MessageType<In, Out> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<In, Out> Copy for MessageType<In, Out> {}

impl<In, Out> fmt::Debug for MessageType<In, Out> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageType")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

impl<In, Out> MessageType<In, Out>
where
    In: Serialize + DeserializeOwned,
    Out: Serialize,
{
    pub(crate) fn new(id: MessageTypeId, name: &'static str) -> Self {
        Self {
            id,
            name,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> MessageTypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Decode this type's transactions from the current tick's snapshot.
    pub fn in_queue(&self, ctx: &EngineContext<'_>) -> Result<Vec<TxData<In>>> {
        ctx.txs()
            .for_type(self.id)
            .map(|tx| {
                let msg = In::deserialize(&tx.payload).map_err(|e| EngineError::MessageDecode {
                    name: self.name.to_owned(),
                    details: e.to_string(),
                })?;
                Ok(TxData {
                    hash: tx.hash.clone(),
                    msg,
                    signature: tx.signature.clone(),
                })
            })
            .collect()
    }

    /// Run `f` once per transaction of this type and record each outcome
    /// as a receipt: the serialized result on success, the error text
    /// otherwise. Payloads that fail to decode get an error receipt and are
    /// skipped.
    pub fn each<F>(&self, ctx: &mut EngineContext<'_>, mut f: F) -> anyhow::Result<()>
    where
        F: FnMut(&mut EngineContext<'_>, TxData<In>) -> anyhow::Result<Out>,
    {
        let queued: Vec<_> = ctx.txs().for_type(self.id).cloned().collect();
        for tx in queued {
            let msg = match In::deserialize(&tx.payload) {
                Ok(msg) => msg,
                Err(e) => {
                    ctx.add_error(&tx.hash, format!("cannot decode {}: {e}", self.name));
                    continue;
                }
            };
            let data = TxData {
                hash: tx.hash.clone(),
                msg,
                signature: tx.signature,
            };
            match f(ctx, data).and_then(|out| Ok(serde_json::to_value(out)?)) {
                Ok(result) => ctx.set_result(&tx.hash, result),
                Err(e) => ctx.add_error(&tx.hash, format!("{e:#}")),
            }
        }
        Ok(())
    }

    /// Serialize `msg` and enqueue it for the next tick.
    pub fn add_to_queue(
        &self,
        submitter: &TxSubmitter,
        msg: &In,
        signature: Signature,
    ) -> Result<(u64, TxHash)> {
        let payload = serde_json::to_value(msg).map_err(|e| EngineError::MessageDecode {
            name: self.name.to_owned(),
            details: e.to_string(),
        })?;
        submitter.add_transaction(self.id, payload, signature)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
