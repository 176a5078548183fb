//! The game loop: a dedicated thread that owns the engine.
//!
//! The loop consumes an inbox of control messages and runs ticks one at a
//! time, so two ticks never overlap. Everything else talks to it through a
//! [`GameLoopHandle`]:
//!
//! - `tick_now` requests a tick.
//! - `wait_for_next_tick` blocks until the next tick finishes.
//! - `shutdown` stops the loop and hands the engine back.
//!
//! Producers keep enqueueing through the handle's [`TxSubmitter`] while a
//! tick runs; those transactions land in the following tick.
//!
//! ```
//! use std::sync::Arc;
//! use tessera_engine::prelude::*;
//! use tessera_store::MemoryStore;
//!
//! let mut engine = Engine::new(Arc::new(MemoryStore::new()), EngineConfig::default());
//! engine.load_game_state().unwrap();
//!
//! let handle = GameLoop::spawn(engine).unwrap();
//! handle.tick_now().unwrap();
//! handle.tick_now().unwrap();
//!
//! // Requests are handled in order, so both ticks run before shutdown.
//! let engine = handle.shutdown().unwrap();
//! assert_eq!(engine.current_tick(), 2);
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::engine::{Engine, EngineState, TxSubmitter};
use crate::message::MessageTypeId;
use crate::receipt::{Receipt, ReceiptHistory};
use crate::txpool::{Signature, TxHash};
use crate::{EngineError, Result};

// ---------------------------------------------------------------------------
// Control messages
// ---------------------------------------------------------------------------

enum Control {
    /// Run one tick now.
    Tick,
    /// Reply `true` after the next tick, `false` if none is coming.
    WaitForNextTick(Sender<bool>),
    /// Stop the loop.
    Shutdown,
}

// ---------------------------------------------------------------------------
// GameLoop
// ---------------------------------------------------------------------------

/// Spawns the game loop thread.
pub struct GameLoop;

impl GameLoop {
    /// Move a loaded `engine` onto its own thread.
    pub fn spawn(engine: Engine) -> Result<GameLoopHandle> {
        if engine.state() == EngineState::Init {
            return Err(EngineError::NotLoaded);
        }

        let (inbox, requests) = mpsc::channel();
        let submitter = engine.submitter();
        let receipts = engine.receipt_history();
        let tick = engine.tick_counter();
        let interval = engine.config().tick_interval;

        let thread = thread::Builder::new()
            .name(format!("tessera-loop-{}", engine.namespace()))
            .spawn(move || run_loop(engine, requests, interval))
            .map_err(|source| EngineError::LoopSpawn { source })?;

        Ok(GameLoopHandle {
            inbox,
            submitter,
            receipts,
            tick,
            thread: Some(thread),
        })
    }
}

fn release(waiting: &mut Vec<Sender<bool>>, ticked: bool) {
    for reply in waiting.drain(..) {
        let _ = reply.send(ticked);
    }
}

/// The loop thread's main function.
fn run_loop(
    mut engine: Engine,
    requests: Receiver<Control>,
    interval: Option<Duration>,
) -> Result<Engine> {
    info!(namespace = %engine.namespace(), tick = engine.current_tick(), "game loop started");
    let mut waiting: Vec<Sender<bool>> = Vec::new();
    let mut deadline = interval.map(|every| Instant::now() + every);

    loop {
        let request = match deadline {
            Some(at) => match requests.recv_timeout(at.saturating_duration_since(Instant::now())) {
                Ok(request) => request,
                Err(RecvTimeoutError::Timeout) => Control::Tick,
                Err(RecvTimeoutError::Disconnected) => Control::Shutdown,
            },
            None => requests.recv().unwrap_or(Control::Shutdown),
        };

        match request {
            Control::Tick => {
                deadline = interval.map(|every| Instant::now() + every);
                if let Err(e) = engine.tick() {
                    error!(tick = engine.current_tick(), error = %e, "game loop stopped by failed tick");
                    release(&mut waiting, false);
                    if let Err(close) = engine.close() {
                        warn!(error = %close, "closing engine after failed tick");
                    }
                    return Err(e);
                }
                release(&mut waiting, true);
            }
            Control::WaitForNextTick(reply) => waiting.push(reply),
            Control::Shutdown => break,
        }
    }

    info!(tick = engine.current_tick(), "shutting down game loop");
    release(&mut waiting, false);
    while let Ok(request) = requests.try_recv() {
        if let Control::WaitForNextTick(reply) = request {
            let _ = reply.send(false);
        }
    }

    if engine.queued_transactions() > 0 {
        engine.tick()?;
    }
    engine.close()?;
    info!(tick = engine.current_tick(), "game loop shut down");
    Ok(engine)
}

// ---------------------------------------------------------------------------
// GameLoopHandle
// ---------------------------------------------------------------------------

/// Handle to a running game loop.
///
/// Dropping the handle shuts the loop down and discards the engine.
pub struct GameLoopHandle {
    inbox: Sender<Control>,
    submitter: TxSubmitter,
    receipts: Arc<RwLock<ReceiptHistory>>,
    tick: Arc<AtomicU64>,
    thread: Option<JoinHandle<Result<Engine>>>,
}

impl fmt::Debug for GameLoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GameLoopHandle")
            .field("tick", &self.current_tick())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl GameLoopHandle {
    /// Ask the loop to run a tick.
    pub fn tick_now(&self) -> Result<()> {
        self.inbox
            .send(Control::Tick)
            .map_err(|_| EngineError::LoopStopped)
    }

    /// Block until the next tick completes.
    ///
    /// Returns `false` if the loop shut down first.
    pub fn wait_for_next_tick(&self) -> bool {
        let (reply, done) = mpsc::channel();
        if self.inbox.send(Control::WaitForNextTick(reply)).is_err() {
            return false;
        }
        done.recv().unwrap_or(false)
    }

    /// Enqueue a transaction for the next tick.
    pub fn add_transaction(
        &self,
        type_id: MessageTypeId,
        payload: Value,
        signature: Signature,
    ) -> Result<(u64, TxHash)> {
        self.submitter.add_transaction(type_id, payload, signature)
    }

    pub fn submitter(&self) -> &TxSubmitter {
        &self.submitter
    }

    pub fn current_tick(&self) -> u64 {
        self.tick.load(Ordering::Acquire)
    }

    /// Latest receipt for `hash` still inside the history window.
    pub fn receipt(&self, hash: &TxHash) -> Option<Receipt> {
        self.receipts.read().find(hash).map(|(_, r)| r.clone())
    }

    pub fn receipts_for_tick(&self, tick: u64) -> Result<Vec<Receipt>> {
        self.receipts.read().receipts_for_tick(tick)
    }

    /// Whether the loop thread is still alive.
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the loop, run a final tick if transactions are queued, close the
    /// store and return the engine.
    pub fn shutdown(self) -> Result<Engine> {
        let _ = self.inbox.send(Control::Shutdown);
        self.join()
    }

    /// Wait for the loop to end on its own (after a failed tick) and return
    /// its outcome.
    pub fn join(mut self) -> Result<Engine> {
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| EngineError::LoopPanicked)?,
            None => Err(EngineError::LoopStopped),
        }
    }
}

impl Drop for GameLoopHandle {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.inbox.send(Control::Shutdown);
            if let Err(e) = thread.join().map_err(|_| EngineError::LoopPanicked).and_then(|r| r) {
                warn!(error = %e, "game loop ended with an error");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tessera_store::MemoryStore;

    use super::*;
    use crate::config::EngineConfig;

    fn loaded(config: EngineConfig) -> Engine {
        let mut engine = Engine::new(Arc::new(MemoryStore::new()), config);
        engine.load_game_state().unwrap();
        engine
    }

    #[test]
    fn spawn_requires_loaded_state() {
        let engine = Engine::new(Arc::new(MemoryStore::new()), EngineConfig::default());
        assert!(matches!(
            GameLoop::spawn(engine),
            Err(EngineError::NotLoaded)
        ));
    }

    #[test]
    fn waiters_are_released_after_a_tick() {
        let handle = Arc::new(GameLoop::spawn(loaded(EngineConfig::default())).unwrap());
        let released = Arc::new(AtomicUsize::new(0));

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let handle = Arc::clone(&handle);
                let released = Arc::clone(&released);
                thread::spawn(move || {
                    if handle.wait_for_next_tick() {
                        released.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        // Keep ticking until every waiter has registered and been released.
        while waiters.iter().any(|w| !w.is_finished()) {
            handle.tick_now().unwrap();
            thread::sleep(Duration::from_millis(5));
        }
        for w in waiters {
            w.join().unwrap();
        }
        assert_eq!(released.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn interval_ticks_without_requests() {
        let config = EngineConfig {
            tick_interval: Some(Duration::from_millis(5)),
            ..Default::default()
        };
        let handle = GameLoop::spawn(loaded(config)).unwrap();
        assert!(handle.wait_for_next_tick());
        assert!(handle.wait_for_next_tick());
        let engine = handle.shutdown().unwrap();
        assert!(engine.current_tick() >= 2);
    }

    #[test]
    fn shutdown_releases_waiters_with_false() {
        let handle = GameLoop::spawn(loaded(EngineConfig::default())).unwrap();
        let inbox = handle.inbox.clone();
        let waiter = thread::spawn(move || {
            let (reply, done) = mpsc::channel();
            inbox.send(Control::WaitForNextTick(reply)).unwrap();
            done.recv().unwrap_or(false)
        });
        thread::sleep(Duration::from_millis(20));

        let engine = handle.shutdown().unwrap();
        assert!(!waiter.join().unwrap());
        assert_eq!(engine.current_tick(), 0);
        // The store was closed on the way out.
        assert!(engine.command_buffer().flush_to_store().is_err());
    }

    #[test]
    fn shutdown_runs_a_final_tick_for_queued_transactions() {
        #[derive(serde::Serialize, serde::Deserialize)]
        struct Note(String);

        let mut engine = Engine::new(Arc::new(MemoryStore::new()), EngineConfig::default());
        let note = engine.register_message::<Note, ()>("note").unwrap();
        engine.load_game_state().unwrap();

        let handle = GameLoop::spawn(engine).unwrap();
        note.add_to_queue(handle.submitter(), &Note("bye".into()), Signature::default())
            .unwrap();
        let engine = handle.shutdown().unwrap();
        assert_eq!(engine.current_tick(), 1);
        assert_eq!(engine.queued_transactions(), 0);
    }

    #[test]
    fn failed_tick_ends_the_loop() {
        let mut engine = Engine::new(Arc::new(MemoryStore::new()), EngineConfig::default());
        engine
            .add_system("explodes", |ctx| {
                anyhow::ensure!(ctx.current_tick() < 1, "tick {} is one too many", ctx.current_tick());
                Ok(())
            })
            .unwrap();
        engine.load_game_state().unwrap();

        let handle = GameLoop::spawn(engine).unwrap();
        handle.tick_now().unwrap();
        handle.tick_now().unwrap();
        let err = handle.join().unwrap_err();
        assert!(matches!(err, EngineError::System { tick: 1, .. }), "{err}");
    }
}
