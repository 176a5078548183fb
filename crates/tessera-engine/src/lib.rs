//! Tessera Engine -- tick orchestration over the Tessera command buffer.
//!
//! This crate drives [`tessera_ecs`] forward one tick at a time. Each tick:
//!
//! 1. The transaction queue is snapshotted and cleared.
//! 2. The snapshot is persisted together with a tick start marker.
//! 3. Registered systems run in registration order against the
//!    [`CommandBuffer`](tessera_ecs::command::CommandBuffer) and the snapshot.
//! 4. Pending state is committed together with the tick end marker.
//! 5. The batch is forwarded to the external ordering adapter, if any.
//! 6. The tick counter advances and the receipt window rotates.
//!
//! A crash between steps 2 and 4 is repaired on the next
//! [`Engine::load_game_state`], which replays the persisted snapshot.
//! A fresh namespace can be rebuilt from the adapter's history with
//! [`Engine::recover_from_chain`].
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use tessera_engine::prelude::*;
//! use tessera_store::MemoryStore;
//!
//! #[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
//! struct Score(u32);
//!
//! #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
//! struct AddPoints { amount: u32 }
//!
//! let mut engine = Engine::new(Arc::new(MemoryStore::new()), EngineConfig::default());
//! engine.register_component::<Score>("score").unwrap();
//! let add = engine.register_message::<AddPoints, u32>("add-points").unwrap();
//!
//! engine.add_system("scoring", move |ctx| {
//!     add.each(ctx, |ctx, tx| {
//!         let score = ctx.registry().require::<Score>()?;
//!         let id = ctx.buffer().create_entity(&[score])?;
//!         ctx.buffer().set(id, &Score(tx.msg.amount))?;
//!         Ok(tx.msg.amount)
//!     })
//! }).unwrap();
//!
//! engine.load_game_state().unwrap();
//! let (_, hash) = add.add_to_queue(&engine.submitter(), &AddPoints { amount: 5 }, Signature::default()).unwrap();
//! engine.tick().unwrap();
//!
//! assert_eq!(engine.current_tick(), 1);
//! let receipts = engine.receipts_for_tick(0).unwrap();
//! assert_eq!(receipts[0].tx_hash, hash);
//! ```

#![deny(unsafe_code)]

pub mod adapter;
pub mod config;
pub mod context;
pub mod engine;
pub mod game_loop;
pub mod message;
pub mod receipt;
pub mod recovery;
pub mod txpool;

use tessera_ecs::EcsError;
use tessera_store::StoreError;

/// Re-export the ECS crate for convenience.
pub use tessera_ecs;

/// Re-export the store crate for convenience.
pub use tessera_store;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors produced by the engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Components, messages and systems can only be registered before
    /// [`Engine::load_game_state`](engine::Engine::load_game_state).
    #[error("registration is closed once game state has been loaded")]
    RegistrationClosed,

    /// A message type with this name is already registered.
    #[error("message type {name:?} is already registered")]
    DuplicateMessageName { name: String },

    /// A system with this name is already registered.
    #[error("system {name:?} is already registered")]
    DuplicateSystemName { name: String },

    /// No message type is registered under this id.
    #[error("unknown message type id {id}")]
    UnknownMessage { id: u32 },

    /// A message payload does not decode as its registered type.
    #[error("cannot decode message {name:?}: {details}")]
    MessageDecode { name: String, details: String },

    /// `load_game_state` was called more than once.
    #[error("game state has already been loaded")]
    AlreadyLoaded,

    /// A tick was requested before the game state was loaded.
    #[error("game state must be loaded before the first tick")]
    NotLoaded,

    /// An earlier tick failed; the engine must be reloaded so local recovery
    /// can complete it.
    #[error("engine halted after tick {tick} failed; reload to recover")]
    Halted { tick: u64 },

    /// The start and end markers disagree but no snapshot was persisted.
    #[error("tick {tick} did not finish and its transaction snapshot is missing")]
    MissingTickSnapshot { tick: u64 },

    /// A registered system returned an error.
    #[error("system {name:?} failed at tick {tick}: {source}")]
    System {
        name: String,
        tick: u64,
        #[source]
        source: anyhow::Error,
    },

    /// Recovery from the ordering adapter was requested without one.
    #[error("no ordering adapter is configured")]
    NoAdapter,

    /// Recovery from the ordering adapter requires an empty namespace.
    #[error("cannot recover into non-empty state (current tick {tick})")]
    NonEmptyState { tick: u64 },

    /// The adapter returned a batch for a tick the engine has already passed.
    #[error("adapter returned a batch for tick {batch_tick}, but the engine is at tick {current_tick}")]
    BatchBehindTick { batch_tick: u64, current_tick: u64 },

    /// The ordering adapter failed.
    #[error("ordering adapter failed at tick {tick}: {source}")]
    Adapter {
        tick: u64,
        #[source]
        source: anyhow::Error,
    },

    /// Receipts for this tick are not available yet.
    #[error("tick {tick} has not been processed yet")]
    TickNotProcessed { tick: u64 },

    /// Receipts for this tick have rotated out of the history window.
    #[error("receipts for tick {tick} have been discarded")]
    TickDiscarded { tick: u64 },

    /// The game loop has stopped and no longer accepts requests.
    #[error("game loop has shut down")]
    LoopStopped,

    /// The game loop thread could not be started.
    #[error("cannot spawn game loop thread: {source}")]
    LoopSpawn {
        #[source]
        source: std::io::Error,
    },

    /// The game loop thread panicked.
    #[error("game loop thread panicked")]
    LoopPanicked,

    /// An error from the command buffer.
    #[error(transparent)]
    Ecs(#[from] EcsError),

    /// An error from the durable store.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Convenience result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common engine usage.
pub mod prelude {
    // Re-export everything from the ECS prelude.
    pub use tessera_ecs::prelude::*;

    pub use crate::adapter::{
        Adapter, BatchPage, BatchTx, InMemoryAdapter, PageResponse, SignedPayload, TickBatch,
    };
    pub use crate::config::EngineConfig;
    pub use crate::context::EngineContext;
    pub use crate::engine::{Engine, EngineState, TxSubmitter};
    pub use crate::game_loop::{GameLoop, GameLoopHandle};
    pub use crate::message::{MessageType, MessageTypeId, TxData};
    pub use crate::receipt::{Receipt, ReceiptHistory};
    pub use crate::txpool::{Signature, TxHash, TxQueue, TxSnapshot};
    pub use crate::EngineError;
}
