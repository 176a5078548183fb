//! Property tests for the store backends.
//!
//! Random pipelines are committed to both backends and compared against a
//! plain `BTreeMap` model. Rejected commits must leave no trace.

use std::collections::BTreeMap;

use proptest::prelude::*;
use tessera_store::prelude::*;

#[derive(Debug, Clone)]
enum ModelOp {
    Set(u8, Vec<u8>),
    Delete(u8),
}

fn key(k: u8) -> String {
    format!("key-{k}")
}

fn op_strategy() -> impl Strategy<Value = ModelOp> {
    prop_oneof![
        (0..8u8, prop::collection::vec(any::<u8>(), 0..4)).prop_map(|(k, v)| ModelOp::Set(k, v)),
        (0..8u8).prop_map(ModelOp::Delete),
    ]
}

fn build(ops: &[ModelOp]) -> Pipeline {
    let mut pipe = Pipeline::new();
    for op in ops {
        match op {
            ModelOp::Set(k, v) => pipe.set(key(*k), v.clone()),
            ModelOp::Delete(k) => pipe.delete(key(*k)),
        }
    }
    pipe
}

fn apply_model(model: &mut BTreeMap<String, Vec<u8>>, ops: &[ModelOp]) {
    for op in ops {
        match op {
            ModelOp::Set(k, v) => {
                model.insert(key(*k), v.clone());
            }
            ModelOp::Delete(k) => {
                model.remove(&key(*k));
            }
        }
    }
}

fn assert_matches_model(store: &dyn KvStore, model: &BTreeMap<String, Vec<u8>>) {
    for k in 0..8u8 {
        assert_eq!(store.get(&key(k)).unwrap(), model.get(&key(k)).cloned());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn memory_store_matches_model(
        batches in prop::collection::vec((prop::collection::vec(op_strategy(), 0..6), any::<bool>()), 1..12)
    ) {
        let store = MemoryStore::new();
        let mut model = BTreeMap::new();

        for (ops, reject) in batches {
            if reject {
                store.fail_next_commits(1);
                prop_assert!(store.commit(build(&ops)).is_err());
            } else {
                store.commit(build(&ops)).unwrap();
                apply_model(&mut model, &ops);
            }
            assert_matches_model(&store, &model);
        }
    }

    #[test]
    fn staged_view_matches_committed_view(
        seed in prop::collection::vec(op_strategy(), 0..6),
        ops in prop::collection::vec(op_strategy(), 0..10),
    ) {
        let store = MemoryStore::new();
        store.commit(build(&seed)).unwrap();

        let pipe = build(&ops);
        let staged: Vec<_> = (0..8u8)
            .map(|k| pipe.get_through(&store, &key(k)).unwrap())
            .collect();

        store.commit(pipe).unwrap();
        let committed: Vec<_> = (0..8u8).map(|k| store.get(&key(k)).unwrap()).collect();
        prop_assert_eq!(staged, committed);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn file_store_survives_reopen(
        batches in prop::collection::vec(prop::collection::vec(op_strategy(), 0..6), 1..6)
    ) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let mut model = BTreeMap::new();

        for ops in &batches {
            let store = FileStore::open(&path).unwrap();
            store.commit(build(ops)).unwrap();
            apply_model(&mut model, ops);
        }

        let reopened = FileStore::open(&path).unwrap();
        assert_matches_model(&reopened, &model);
    }
}
