//! Shared fixture for the engine integration tests: a tiny bank with
//! accounts that can be opened and topped up.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tessera_engine::prelude::*;
use tessera_engine::tessera_store::KvStore;

// ---------------------------------------------------------------------------
// Components and messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Owner(pub String);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Balance(pub i64);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAccount {
    pub owner: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deposit {
    pub owner: String,
    pub amount: i64,
}

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

pub struct Bank {
    pub engine: Engine,
    pub open: MessageType<OpenAccount, u64>,
    pub deposit: MessageType<Deposit, i64>,
}

/// Route test logs through the test harness. Set `RUST_LOG` to see them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn signed(owner: &str, nonce: u64) -> Signature {
    Signature {
        persona_tag: owner.to_owned(),
        namespace: "world".to_owned(),
        nonce,
        signature: format!("sig-{owner}-{nonce}"),
    }
}

fn find_account(
    ctx: &mut EngineContext<'_>,
    accounts: &mut Search,
    owner: &str,
) -> anyhow::Result<EntityId> {
    for id in accounts.collect(ctx.reader())? {
        if ctx.buffer().get::<Owner>(id)?.0 == owner {
            return Ok(id);
        }
    }
    anyhow::bail!("no account for {owner}")
}

/// Build an unloaded bank engine over `store`.
pub fn bank(store: Arc<dyn KvStore>, adapter: Option<Arc<dyn Adapter>>) -> Bank {
    bank_with_config(store, adapter, EngineConfig::default())
}

pub fn bank_with_config(
    store: Arc<dyn KvStore>,
    adapter: Option<Arc<dyn Adapter>>,
    config: EngineConfig,
) -> Bank {
    init_tracing();
    let mut engine = Engine::new(store, config);
    if let Some(adapter) = adapter {
        engine = engine.with_adapter(adapter);
    }

    let owner = engine.register_component::<Owner>("owner").unwrap();
    let balance = engine.register_component::<Balance>("balance").unwrap();
    let open = engine.register_message::<OpenAccount, u64>("open-account").unwrap();
    let deposit = engine.register_message::<Deposit, i64>("deposit").unwrap();

    engine
        .add_system("open-accounts", move |ctx| {
            open.each(ctx, |ctx, tx| {
                let id = ctx.buffer().create_entity(&[owner, balance])?;
                ctx.buffer().set(id, &Owner(tx.msg.owner))?;
                Ok(id.get())
            })
        })
        .unwrap();

    let mut accounts = Search::new(ComponentFilter::contains(&[owner]));
    engine
        .add_system("deposits", move |ctx| {
            deposit.each(ctx, |ctx, tx| {
                let id = find_account(ctx, &mut accounts, &tx.msg.owner)?;
                ctx.buffer().update::<Balance>(id, |b| b.0 += tx.msg.amount)?;
                Ok(ctx.buffer().get::<Balance>(id)?.0)
            })
        })
        .unwrap();

    Bank {
        engine,
        open,
        deposit,
    }
}

impl Bank {
    pub fn open_account(&self, owner: &str, nonce: u64) -> TxHash {
        let msg = OpenAccount {
            owner: owner.to_owned(),
        };
        let (_, hash) = self
            .open
            .add_to_queue(&self.engine.submitter(), &msg, signed(owner, nonce))
            .unwrap();
        hash
    }

    pub fn deposit(&self, owner: &str, amount: i64, nonce: u64) -> TxHash {
        let msg = Deposit {
            owner: owner.to_owned(),
            amount,
        };
        let (_, hash) = self
            .deposit
            .add_to_queue(&self.engine.submitter(), &msg, signed(owner, nonce))
            .unwrap();
        hash
    }

    /// Committed balances by owner, read straight from the store.
    pub fn balances(&self) -> BTreeMap<String, i64> {
        balances(&self.engine)
    }
}

pub fn balances(engine: &Engine) -> BTreeMap<String, i64> {
    let reader = engine.durable_reader().unwrap();
    let owner = engine.component_registry().require::<Owner>().unwrap();
    Search::new(ComponentFilter::contains(&[owner]))
        .collect(&reader)
        .unwrap()
        .into_iter()
        .map(|id| {
            let name = reader.read::<Owner>(id).unwrap().0;
            let balance = reader.read::<Balance>(id).unwrap().0;
            (name, balance)
        })
        .collect()
}
