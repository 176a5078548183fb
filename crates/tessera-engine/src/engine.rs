//! The tick orchestrator.
//!
//! An [`Engine`] owns the command buffer, the transaction queue, the receipt
//! window and the registered systems, and moves through three states:
//!
//! - [`EngineState::Init`]: components, messages and systems are registered.
//! - [`EngineState::Ready`]: [`Engine::load_game_state`] validated the
//!   schemas and ran local recovery. Ticks may run.
//! - [`EngineState::Running`]: at least one tick has started. Behaves like
//!   `Ready` for callers.
//!
//! # Tick
//!
//! 1. Snapshot and clear the transaction queue.
//! 2. Persist the snapshot together with the tick start marker.
//! 3. Run the init system (tick 0 only), then every system in registration
//!    order.
//! 4. Commit pending state together with the tick end marker.
//! 5. Forward a non-empty batch to the ordering adapter, unless recovering.
//! 6. Advance the tick counter and rotate the receipt window.
//!
//! A failure in steps 1-4 leaves durable state exactly as it was before the
//! tick apart from the start marker and snapshot. The engine then refuses
//! further ticks with [`EngineError::Halted`]; loading a new engine over the
//! same store replays the tick. An adapter failure in step 5 happens after
//! the commit, so the tick still counts as done; the counter advances and
//! then the error is returned.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tessera_ecs::command::CommandBuffer;
use tessera_ecs::component::{Component, ComponentRegistry, ComponentTypeId};
use tessera_ecs::reader::DurableReader;
use tessera_store::KvStore;
use tracing::{error, info, warn};

use crate::adapter::Adapter;
use crate::config::EngineConfig;
use crate::context::EngineContext;
use crate::message::{MessageRegistry, MessageType, MessageTypeId};
use crate::receipt::{Receipt, ReceiptHistory};
use crate::txpool::{QueuedTx, Signature, TxHash, TxQueue, TxSnapshot};
use crate::{EngineError, Result};

/// Ticks slower than this are logged as a warning.
const SLOW_TICK: Duration = Duration::from_millis(100);

const INIT_SYSTEM_NAME: &str = "init";

// ---------------------------------------------------------------------------
// EngineState
// ---------------------------------------------------------------------------

/// Lifecycle state of an [`Engine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Init,
    Ready,
    Running,
}

// ---------------------------------------------------------------------------
// Systems
// ---------------------------------------------------------------------------

/// A system invoked once per tick.
pub type SystemFn = Box<dyn FnMut(&mut EngineContext<'_>) -> anyhow::Result<()> + Send>;

struct RegisteredSystem {
    name: String,
    func: SystemFn,
}

impl fmt::Debug for RegisteredSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredSystem")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Logs which tick and system were running if a system panics.
struct TickGuard {
    tick: u64,
    system: Option<String>,
}

impl Drop for TickGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            error!(
                tick = self.tick,
                system = self.system.as_deref().unwrap_or("none"),
                "panic while running tick"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// TxSubmitter
// ---------------------------------------------------------------------------

/// Cloneable handle for enqueueing transactions from other threads.
#[derive(Clone)]
pub struct TxSubmitter {
    queue: Arc<TxQueue>,
    messages: Arc<RwLock<MessageRegistry>>,
    tick: Arc<AtomicU64>,
}

impl fmt::Debug for TxSubmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxSubmitter")
            .field("queued", &self.queue.len())
            .field("tick", &self.tick.load(Ordering::Acquire))
            .finish()
    }
}

impl TxSubmitter {
    /// Validate `payload` against its message type and enqueue it.
    ///
    /// Returns the tick that was current when the transaction was queued
    /// and the transaction's hash. The transaction runs in that tick unless
    /// the tick had already taken its snapshot, in which case it runs in the
    /// next one.
    pub fn add_transaction(
        &self,
        type_id: MessageTypeId,
        payload: Value,
        signature: Signature,
    ) -> Result<(u64, TxHash)> {
        self.messages.read().require(type_id)?.validate(&payload)?;
        let tick = self.tick.load(Ordering::Acquire);
        let hash = self.queue.add_transaction(type_id, payload, signature);
        Ok((tick, hash))
    }

    /// Number of transactions waiting for the next tick.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Single-writer tick orchestrator over one namespace.
pub struct Engine {
    config: EngineConfig,
    state: EngineState,
    recovering: bool,
    halted: Option<u64>,
    buffer: CommandBuffer,
    components: Arc<ComponentRegistry>,
    messages: Arc<RwLock<MessageRegistry>>,
    systems: Vec<RegisteredSystem>,
    init_system: Option<RegisteredSystem>,
    queue: Arc<TxQueue>,
    tick: Arc<AtomicU64>,
    receipts: Arc<RwLock<ReceiptHistory>>,
    adapter: Option<Arc<dyn Adapter>>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("namespace", &self.config.namespace)
            .field("state", &self.state)
            .field("tick", &self.current_tick())
            .field("recovering", &self.recovering)
            .field("halted", &self.halted)
            .field("systems", &self.system_names())
            .field("buffer", &self.buffer)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Create an engine over `store`. Nothing is read until
    /// [`load_game_state`](Self::load_game_state).
    pub fn new(store: Arc<dyn KvStore>, config: EngineConfig) -> Self {
        let receipts = ReceiptHistory::new(0, config.receipt_history_size);
        Self {
            config,
            state: EngineState::Init,
            recovering: false,
            halted: None,
            buffer: CommandBuffer::new(store),
            components: Arc::new(ComponentRegistry::new()),
            messages: Arc::new(RwLock::new(MessageRegistry::new())),
            systems: Vec::new(),
            init_system: None,
            queue: Arc::new(TxQueue::new()),
            tick: Arc::new(AtomicU64::new(0)),
            receipts: Arc::new(RwLock::new(receipts)),
            adapter: None,
        }
    }

    /// Attach an external ordering adapter.
    pub fn with_adapter(mut self, adapter: Arc<dyn Adapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    // -- registration -------------------------------------------------------

    fn ensure_init(&self) -> Result<()> {
        if self.state == EngineState::Init {
            Ok(())
        } else {
            Err(EngineError::RegistrationClosed)
        }
    }

    /// Register a component type.
    pub fn register_component<T: Component>(&mut self, name: &str) -> Result<ComponentTypeId> {
        self.ensure_init()?;
        let registry =
            Arc::get_mut(&mut self.components).ok_or(EngineError::RegistrationClosed)?;
        Ok(registry.register::<T>(name)?)
    }

    /// Register a message type taking `In` and producing `Out`.
    pub fn register_message<In, Out>(&mut self, name: &'static str) -> Result<MessageType<In, Out>>
    where
        In: Serialize + DeserializeOwned,
        Out: Serialize,
    {
        self.ensure_init()?;
        let id = self.messages.write().register::<In>(name)?;
        Ok(MessageType::new(id, name))
    }

    /// Register a system. Systems run in registration order.
    pub fn add_system<F>(&mut self, name: &str, func: F) -> Result<()>
    where
        F: FnMut(&mut EngineContext<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        self.ensure_init()?;
        if name == INIT_SYSTEM_NAME || self.systems.iter().any(|s| s.name == name) {
            return Err(EngineError::DuplicateSystemName {
                name: name.to_owned(),
            });
        }
        self.systems.push(RegisteredSystem {
            name: name.to_owned(),
            func: Box::new(func),
        });
        Ok(())
    }

    /// Register a system that runs once, before the others, on tick 0.
    pub fn add_init_system<F>(&mut self, func: F) -> Result<()>
    where
        F: FnMut(&mut EngineContext<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        self.ensure_init()?;
        self.init_system = Some(RegisteredSystem {
            name: INIT_SYSTEM_NAME.to_owned(),
            func: Box::new(func),
        });
        Ok(())
    }

    // -- loading ------------------------------------------------------------

    /// Attach the component registry to the command buffer, validate schemas
    /// and run local recovery.
    pub fn load_game_state(&mut self) -> Result<()> {
        if self.state != EngineState::Init {
            return Err(EngineError::AlreadyLoaded);
        }
        if self.components.is_empty() {
            warn!("no components registered");
        }
        if self.systems.is_empty() {
            warn!("no systems registered");
        }

        self.buffer
            .register_components(Arc::clone(&self.components))?;
        self.state = EngineState::Ready;

        self.recover_local()?;
        self.receipts.write().set_tick(self.current_tick());

        info!(
            namespace = %self.config.namespace,
            tick = self.current_tick(),
            components = self.components.len(),
            messages = self.messages.read().len(),
            systems = self.systems.len(),
            "game state loaded"
        );
        Ok(())
    }

    // -- ticking ------------------------------------------------------------

    /// Run one tick.
    pub fn tick(&mut self) -> Result<()> {
        if self.state == EngineState::Init {
            return Err(EngineError::NotLoaded);
        }
        if let Some(tick) = self.halted {
            return Err(EngineError::Halted { tick });
        }

        let tick = self.current_tick();
        let started = Instant::now();
        info!(tick, "tick started");

        let mut guard = TickGuard { tick, system: None };
        match self.run_tick(tick, &mut guard) {
            Ok(txs) => {
                let elapsed = started.elapsed();
                info!(tick, txs, elapsed_us = elapsed.as_micros() as u64, "tick finished");
                if elapsed > SLOW_TICK {
                    warn!(tick, elapsed_ms = elapsed.as_millis() as u64, "slow tick");
                }
                Ok(())
            }
            Err(e) => {
                error!(tick, system = guard.system.as_deref().unwrap_or("none"), error = %e, "tick failed");
                if !matches!(e, EngineError::Adapter { .. }) {
                    self.halted = Some(tick);
                }
                Err(e)
            }
        }
    }

    fn run_tick(&mut self, tick: u64, guard: &mut TickGuard) -> Result<usize> {
        let snapshot = self.queue.snapshot_and_clear();
        self.buffer.start_next_tick(tick, &snapshot)?;
        self.state = EngineState::Running;
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());

        if tick == 0 {
            if let Some(init) = self.init_system.as_mut() {
                guard.system = Some(init.name.clone());
                let mut ctx = EngineContext::new(
                    tick,
                    self.recovering,
                    &mut self.buffer,
                    &self.components,
                    &snapshot,
                    &self.receipts,
                );
                (init.func)(&mut ctx).map_err(|source| EngineError::System {
                    name: init.name.clone(),
                    tick,
                    source,
                })?;
            }
        }

        for system in &mut self.systems {
            guard.system = Some(system.name.clone());
            let mut ctx = EngineContext::new(
                tick,
                self.recovering,
                &mut self.buffer,
                &self.components,
                &snapshot,
                &self.receipts,
            );
            (system.func)(&mut ctx).map_err(|source| EngineError::System {
                name: system.name.clone(),
                tick,
                source,
            })?;
        }
        guard.system = None;

        self.buffer.finalize_tick(tick)?;

        let submitted = match &self.adapter {
            Some(adapter)
                if self.config.submit_to_adapter && !self.recovering && !snapshot.is_empty() =>
            {
                adapter
                    .submit(&snapshot, &self.config.namespace, tick, timestamp)
                    .map_err(|source| EngineError::Adapter { tick, source })
            }
            _ => Ok(()),
        };

        self.tick.store(tick + 1, Ordering::Release);
        self.receipts.write().next_tick();
        submitted?;
        Ok(snapshot.len())
    }

    // -- transactions -------------------------------------------------------

    /// Handle for enqueueing transactions from any thread.
    pub fn submitter(&self) -> TxSubmitter {
        TxSubmitter {
            queue: Arc::clone(&self.queue),
            messages: Arc::clone(&self.messages),
            tick: Arc::clone(&self.tick),
        }
    }

    /// Shorthand for `self.submitter().add_transaction(..)`.
    pub fn add_transaction(
        &self,
        type_id: MessageTypeId,
        payload: Value,
        signature: Signature,
    ) -> Result<(u64, TxHash)> {
        self.submitter().add_transaction(type_id, payload, signature)
    }

    /// Number of transactions waiting for the next tick.
    pub fn queued_transactions(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn validate_message(&self, type_id: MessageTypeId, payload: &Value) -> Result<()> {
        self.messages.read().require(type_id)?.validate(payload)
    }

    /// Queue a transaction replayed from the ordering adapter, keeping its
    /// original hash.
    pub(crate) fn queue_replayed(&self, tx: QueuedTx) {
        self.queue.push(tx);
    }

    /// Put a snapshot back at the front of the queue.
    pub(crate) fn requeue(&self, snapshot: TxSnapshot) {
        self.queue.restore(snapshot);
    }

    // -- receipts -----------------------------------------------------------

    /// Latest receipt for `hash` still inside the history window.
    pub fn receipt(&self, hash: &TxHash) -> Option<Receipt> {
        self.receipts.read().find(hash).map(|(_, r)| r.clone())
    }

    /// Receipts of a completed tick still inside the history window.
    pub fn receipts_for_tick(&self, tick: u64) -> Result<Vec<Receipt>> {
        self.receipts.read().receipts_for_tick(tick)
    }

    pub(crate) fn receipt_history(&self) -> Arc<RwLock<ReceiptHistory>> {
        Arc::clone(&self.receipts)
    }

    pub(crate) fn tick_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.tick)
    }

    // -- accessors ----------------------------------------------------------

    pub fn current_tick(&self) -> u64 {
        self.tick.load(Ordering::Acquire)
    }

    pub(crate) fn set_current_tick(&self, tick: u64) {
        self.tick.store(tick, Ordering::Release);
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering
    }

    pub(crate) fn set_recovering(&mut self, recovering: bool) {
        self.recovering = recovering;
    }

    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub(crate) fn adapter(&self) -> Option<&Arc<dyn Adapter>> {
        self.adapter.as_ref()
    }

    /// Read-only access to pending state.
    pub fn command_buffer(&self) -> &CommandBuffer {
        &self.buffer
    }

    /// Mutable access to the command buffer.
    ///
    /// Use sparingly -- changes made here outside a tick are committed by
    /// the next tick.
    pub fn command_buffer_mut(&mut self) -> &mut CommandBuffer {
        &mut self.buffer
    }

    /// A reader over committed state only.
    pub fn durable_reader(&self) -> Result<DurableReader> {
        Ok(DurableReader::for_buffer(&self.buffer)?)
    }

    pub fn component_registry(&self) -> &Arc<ComponentRegistry> {
        &self.components
    }

    /// Id of the message type registered under `name`.
    pub fn message_id(&self, name: &str) -> Option<MessageTypeId> {
        self.messages.read().lookup_by_name(name)
    }

    /// Names of all registered systems, in execution order.
    pub fn system_names(&self) -> Vec<&str> {
        self.systems.iter().map(|s| s.name.as_str()).collect()
    }

    /// Release the store connection and the adapter.
    pub fn close(&self) -> Result<()> {
        self.buffer.close()?;
        if let Some(adapter) = &self.adapter {
            adapter.close().map_err(|source| EngineError::Adapter {
                tick: self.current_tick(),
                source,
            })?;
        }
        info!(namespace = %self.config.namespace, tick = self.current_tick(), "engine closed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
