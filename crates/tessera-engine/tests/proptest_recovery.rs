//! Property tests for crash recovery.
//!
//! A random schedule of deposits is run twice: once straight through, once
//! with a crash injected into one tick's state commit followed by a restart
//! over the same store. Both runs must end on the same tick with the same
//! balances.

mod common;

use std::sync::Arc;

use common::{bank, Bank};
use proptest::prelude::*;
use tessera_engine::tessera_ecs::keys;
use tessera_engine::tessera_store::MemoryStore;

const OWNERS: [&str; 3] = ["alice", "bob", "carol"];

type Schedule = Vec<Vec<(usize, i64)>>;

fn schedule_strategy() -> impl Strategy<Value = Schedule> {
    prop::collection::vec(
        prop::collection::vec((0..OWNERS.len(), 1..100i64), 0..5),
        1..6,
    )
}

fn opened(store: &MemoryStore) -> Bank {
    let mut fixture = bank(Arc::new(store.clone()), None);
    fixture.engine.load_game_state().unwrap();
    for owner in OWNERS {
        fixture.open_account(owner, 0);
    }
    fixture.engine.tick().unwrap();
    fixture
}

fn queue(fixture: &Bank, tick: usize, deposits: &[(usize, i64)]) {
    for (i, &(owner, amount)) in deposits.iter().enumerate() {
        fixture.deposit(OWNERS[owner], amount, (tick * 100 + i) as u64 + 1);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn crash_then_reload_matches_uninterrupted_run(
        schedule in schedule_strategy(),
        crash_pick in any::<prop::sample::Index>(),
    ) {
        let crash_at = crash_pick.index(schedule.len());

        let reference_store = MemoryStore::new();
        let mut reference = opened(&reference_store);
        for (tick, deposits) in schedule.iter().enumerate() {
            queue(&reference, tick, deposits);
            reference.engine.tick().unwrap();
        }

        let store = MemoryStore::new();
        let mut fixture = opened(&store);
        for (tick, deposits) in schedule.iter().enumerate() {
            queue(&fixture, tick, deposits);
            if tick == crash_at {
                store.fail_commits_touching(keys::END_TICK);
                prop_assert!(fixture.engine.tick().is_err());
                store.clear_faults();
                fixture = bank(Arc::new(store.clone()), None);
                fixture.engine.load_game_state().unwrap();
            } else {
                fixture.engine.tick().unwrap();
            }
        }

        prop_assert_eq!(fixture.engine.current_tick(), reference.engine.current_tick());
        prop_assert_eq!(fixture.balances(), reference.balances());
    }
}
