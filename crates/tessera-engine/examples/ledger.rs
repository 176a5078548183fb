//! Headless ledger demo -- a file-backed world with a few producer threads.
//!
//! Run with:
//!   cargo run --example ledger -p tessera-engine -- [path/to/world.json]
//!
//! Running it again over the same file picks up at the tick where the last
//! run stopped. Set `RUST_LOG=info` to watch each tick.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tessera_engine::prelude::*;
use tessera_engine::tessera_store::FileStore;

// ---------------------------------------------------------------------------
// Components and messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Account {
    name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Coins(u64);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Mint {
    account: String,
    coins: u64,
}

const ACCOUNTS: [&str; 3] = ["ada", "grace", "linus"];
const MINTS_PER_PRODUCER: u64 = 20;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join("tessera-ledger.json"));
    let store = FileStore::open(&path).with_context(|| format!("opening {}", path.display()))?;

    let config = EngineConfig {
        namespace: "ledger".to_owned(),
        tick_interval: Some(Duration::from_millis(20)),
        ..EngineConfig::default()
    };
    let mut engine = Engine::new(Arc::new(store), config);
    let account = engine.register_component::<Account>("account")?;
    let coins = engine.register_component::<Coins>("coins")?;
    let mint = engine.register_message::<Mint, u64>("mint")?;

    engine.add_init_system(move |ctx| {
        for name in ACCOUNTS {
            let id = ctx.buffer().create_entity(&[account, coins])?;
            ctx.buffer().set(id, &Account { name: name.to_owned() })?;
        }
        Ok(())
    })?;

    let mut accounts = Search::new(ComponentFilter::exact(&[account, coins]));
    engine.add_system("mint", move |ctx| {
        mint.each(ctx, |ctx, tx| {
            let ids = accounts.collect(ctx.reader())?;
            for id in ids {
                if ctx.buffer().get::<Account>(id)?.name == tx.msg.account {
                    ctx.buffer().update::<Coins>(id, |c| c.0 += tx.msg.coins)?;
                    return Ok(ctx.buffer().get::<Coins>(id)?.0);
                }
            }
            anyhow::bail!("unknown account {}", tx.msg.account)
        })
    })?;

    engine.load_game_state()?;
    let started_at = engine.current_tick();
    let handle = GameLoop::spawn(engine)?;

    let producers: Vec<_> = ACCOUNTS
        .iter()
        .enumerate()
        .map(|(p, &name)| {
            let submitter = handle.submitter().clone();
            thread::spawn(move || -> Result<(), EngineError> {
                for i in 0..MINTS_PER_PRODUCER {
                    let msg = Mint {
                        account: name.to_owned(),
                        coins: i + 1,
                    };
                    let signature = Signature {
                        persona_tag: name.to_owned(),
                        namespace: "ledger".to_owned(),
                        nonce: started_at * 1_000 + p as u64 * MINTS_PER_PRODUCER + i,
                        signature: String::new(),
                    };
                    mint.add_to_queue(&submitter, &msg, signature)?;
                    thread::sleep(Duration::from_millis(3));
                }
                Ok(())
            })
        })
        .collect();

    for producer in producers {
        producer
            .join()
            .map_err(|_| anyhow::anyhow!("producer thread panicked"))??;
    }
    handle.wait_for_next_tick();
    let engine = handle.shutdown()?;

    // The loop closed its store; reopen to print what was committed.
    let reader = DurableReader::new(
        Arc::new(FileStore::open(&path)?),
        Arc::clone(engine.component_registry()),
    );
    println!(
        "{}: ticks {}..{}",
        path.display(),
        started_at,
        engine.current_tick()
    );
    for id in Search::new(ComponentFilter::exact(&[account, coins])).collect(&reader)? {
        let name = reader.read::<Account>(id)?.name;
        let total = reader.read::<Coins>(id)?.0;
        println!("  {name:<6} {total:>6} coins");
    }
    Ok(())
}
