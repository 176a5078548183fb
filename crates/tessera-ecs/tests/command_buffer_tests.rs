//! Integration tests for the command buffer over a shared store.
//!
//! "Fresh manager" below always means a new `CommandBuffer` built over a
//! clone of the same `MemoryStore`, which is how a restarted process sees
//! the database.

use std::sync::Arc;

use tessera_ecs::keys;
use tessera_ecs::prelude::*;
use tessera_store::{FileStore, KvStore, MemoryStore};

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
struct Foo {
    value: i64,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
struct Bar {
    flag: bool,
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
struct Baz {
    tags: Vec<String>,
}

struct Ids {
    foo: ComponentTypeId,
    bar: ComponentTypeId,
    baz: ComponentTypeId,
}

fn registry() -> (Arc<ComponentRegistry>, Ids) {
    let mut registry = ComponentRegistry::new();
    let foo = registry.register::<Foo>("foo").unwrap();
    let bar = registry.register::<Bar>("bar").unwrap();
    let baz = registry.register::<Baz>("baz").unwrap();
    (Arc::new(registry), Ids { foo, bar, baz })
}

fn manager(store: Arc<dyn KvStore>) -> (CommandBuffer, Ids) {
    let (registry, ids) = registry();
    let mut cb = CommandBuffer::new(store);
    cb.register_components(registry).unwrap();
    (cb, ids)
}

fn memory_manager(store: &MemoryStore) -> (CommandBuffer, Ids) {
    manager(Arc::new(store.clone()))
}

// ---------------------------------------------------------------------------
// Archetype identity
// ---------------------------------------------------------------------------

#[test]
fn archetype_lookup_is_order_independent() {
    let store = MemoryStore::new();
    let (mut cb, ids) = memory_manager(&store);
    cb.create_entity(&[ids.bar, ids.foo]).unwrap();

    let a = cb.arch_id_for_components(&[ids.foo, ids.bar]).unwrap();
    let b = cb.arch_id_for_components(&[ids.bar, ids.foo]).unwrap();
    let c = cb.arch_id_for_components(&[ids.bar, ids.foo, ids.bar]).unwrap();
    assert_eq!(a, b);
    assert_eq!(a, c);
    assert!(cb.arch_id_for_components(&[ids.foo]).is_err());
}

#[test]
fn archetypes_survive_restart() {
    let store = MemoryStore::new();
    let (mut cb, ids) = memory_manager(&store);
    cb.create_entity(&[ids.foo]).unwrap();
    cb.create_entity(&[ids.foo, ids.baz]).unwrap();
    cb.commit_pending().unwrap();
    let expected = cb.arch_id_for_components(&[ids.baz, ids.foo]).unwrap();

    let (fresh, ids) = memory_manager(&store);
    assert_eq!(fresh.archetype_count().unwrap(), 2);
    assert_eq!(
        fresh.arch_id_for_components(&[ids.foo, ids.baz]).unwrap(),
        expected
    );
}

// ---------------------------------------------------------------------------
// ID monotonicity without reuse
// ---------------------------------------------------------------------------

#[test]
fn ids_continue_after_restart() {
    let store = MemoryStore::new();
    let (mut cb, ids) = memory_manager(&store);
    let first_batch = cb.create_entities(50, &[ids.foo]).unwrap();
    cb.commit_pending().unwrap();
    let last = *first_batch.last().unwrap();

    let (mut fresh, ids) = memory_manager(&store);
    let next = fresh.create_entity(&[ids.foo]).unwrap();
    assert_eq!(next.get(), last.get() + 1);
}

#[test]
fn discarded_ids_are_not_durable() {
    let store = MemoryStore::new();
    let (mut cb, ids) = memory_manager(&store);
    let committed = cb.create_entities(3, &[ids.foo]).unwrap();
    cb.commit_pending().unwrap();

    let abandoned = cb.create_entities(4, &[ids.foo]).unwrap();
    cb.discard_pending();
    assert!(abandoned.iter().all(|id| id.get() > committed[2].get()));

    // Abandoned ids leave a gap; they are not handed out again.
    let after = cb.create_entity(&[ids.foo]).unwrap();
    assert_eq!(after.get(), abandoned[3].get() + 1);
    cb.commit_pending().unwrap();
    let mut search = Search::new(ComponentFilter::contains(&[ids.foo]));
    assert_eq!(search.count(&cb).unwrap(), 4);
}

// ---------------------------------------------------------------------------
// Rollback restores the exact prior view
// ---------------------------------------------------------------------------

#[test]
fn discard_undoes_add_component() {
    let store = MemoryStore::new();
    let (mut cb, ids) = memory_manager(&store);
    let e = cb.create_entity(&[ids.foo]).unwrap();
    cb.commit_pending().unwrap();

    cb.add_component_to_entity(ids.bar, e).unwrap();
    assert_eq!(cb.component_types_for_entity(e).unwrap().len(), 2);

    cb.discard_pending();
    assert_eq!(cb.component_types_for_entity(e).unwrap(), vec![ids.foo]);
}

#[test]
fn discard_after_multiple_moves_restores_first_origin() {
    let store = MemoryStore::new();
    let (mut cb, ids) = memory_manager(&store);
    let e = cb.create_entity(&[ids.foo]).unwrap();
    cb.set(e, &Foo { value: 8 }).unwrap();
    cb.commit_pending().unwrap();

    cb.add_component_to_entity(ids.bar, e).unwrap();
    cb.add_component_to_entity(ids.baz, e).unwrap();
    cb.remove_component_from_entity(ids.foo, e).unwrap();
    assert_eq!(cb.component_types_for_entity(e).unwrap(), vec![ids.bar, ids.baz]);

    cb.discard_pending();
    assert_eq!(cb.component_types_for_entity(e).unwrap(), vec![ids.foo]);
    assert_eq!(cb.get::<Foo>(e).unwrap(), Foo { value: 8 });
    let home = cb.arch_id_for_components(&[ids.foo]).unwrap();
    assert_eq!(cb.entities_for_archetype(home).unwrap(), vec![e]);
}

#[test]
fn discard_drops_staged_archetypes() {
    let store = MemoryStore::new();
    let (mut cb, ids) = memory_manager(&store);
    cb.create_entity(&[ids.foo]).unwrap();
    cb.commit_pending().unwrap();

    cb.create_entity(&[ids.bar]).unwrap();
    assert_eq!(cb.archetype_count().unwrap(), 2);
    cb.discard_pending();
    assert_eq!(cb.archetype_count().unwrap(), 1);
    assert!(cb.arch_id_for_components(&[ids.bar]).is_err());
}

#[test]
fn discard_undoes_entity_removal() {
    let store = MemoryStore::new();
    let (mut cb, ids) = memory_manager(&store);
    let e = cb.create_entity(&[ids.foo, ids.bar]).unwrap();
    cb.set(e, &Bar { flag: true }).unwrap();
    cb.commit_pending().unwrap();

    cb.remove_entity(e).unwrap();
    assert!(cb.component_types_for_entity(e).is_err());
    cb.discard_pending();
    assert_eq!(cb.get::<Bar>(e).unwrap(), Bar { flag: true });
}

// ---------------------------------------------------------------------------
// Swap-remove correctness
// ---------------------------------------------------------------------------

#[test]
fn swap_remove_then_discard_restores_all_ids() {
    let store = MemoryStore::new();
    let (mut cb, ids) = memory_manager(&store);
    let created = cb.create_entities(10, &[ids.foo]).unwrap();
    cb.commit_pending().unwrap();
    let archetype = cb.arch_id_for_components(&[ids.foo]).unwrap();

    for position in [0usize, 4, 7] {
        cb.remove_entity(created[position]).unwrap();
    }
    let remaining = cb.entities_for_archetype(archetype).unwrap();
    assert_eq!(remaining.len(), 7);
    for position in [0usize, 4, 7] {
        assert!(!remaining.contains(&created[position]));
    }

    cb.discard_pending();
    let restored = cb.entities_for_archetype(archetype).unwrap();
    assert_eq!(restored, created);
}

// ---------------------------------------------------------------------------
// Commit round-trip
// ---------------------------------------------------------------------------

#[test]
fn committed_value_visible_to_fresh_manager() {
    let store = MemoryStore::new();
    let (mut cb, ids) = memory_manager(&store);
    let e = cb.create_entity(&[ids.foo]).unwrap();
    cb.set(e, &Foo { value: 99 }).unwrap();
    cb.commit_pending().unwrap();

    let (mut fresh, _) = memory_manager(&store);
    assert_eq!(fresh.get::<Foo>(e).unwrap(), Foo { value: 99 });
}

#[test]
fn removed_entity_leaves_no_keys() {
    let store = MemoryStore::new();
    let (mut cb, ids) = memory_manager(&store);
    let e = cb.create_entity(&[ids.foo, ids.baz]).unwrap();
    cb.set(e, &Foo { value: 1 }).unwrap();
    cb.set(e, &Baz { tags: vec!["x".into()] }).unwrap();
    cb.commit_pending().unwrap();
    assert!(store.get(&keys::entity_archetype(e)).unwrap().is_some());

    cb.remove_entity(e).unwrap();
    cb.commit_pending().unwrap();
    assert!(store.get(&keys::entity_archetype(e)).unwrap().is_none());
    assert!(store.keys_with_prefix("ECB:COMPONENT-VALUE").is_empty());

    let (fresh, _) = memory_manager(&store);
    assert!(matches!(
        fresh.component_types_for_entity(e),
        Err(EcsError::EntityNotFound { .. })
    ));
}

#[test]
fn file_store_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ecb.json");

    let e = {
        let (mut cb, ids) = manager(Arc::new(FileStore::open(&path).unwrap()));
        let e = cb.create_entity(&[ids.foo, ids.bar]).unwrap();
        cb.set(e, &Foo { value: -4 }).unwrap();
        cb.commit_pending().unwrap();
        e
    };

    let (mut cb, ids) = manager(Arc::new(FileStore::open(&path).unwrap()));
    assert_eq!(cb.get::<Foo>(e).unwrap(), Foo { value: -4 });
    assert_eq!(cb.component_types_for_entity(e).unwrap(), vec![ids.foo, ids.bar]);
}

#[test]
fn schema_change_is_rejected_on_restart() {
    #[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
    struct FooV2 {
        value: i64,
        extra: u8,
    }

    let store = MemoryStore::new();
    memory_manager(&store);

    let mut changed = ComponentRegistry::new();
    changed.register::<FooV2>("foo").unwrap();
    let mut cb = CommandBuffer::new(Arc::new(store.clone()));
    let err = cb.register_components(Arc::new(changed)).unwrap_err();
    assert!(matches!(err, EcsError::SchemaMismatch { .. }));
}

#[test]
fn saved_archetype_with_unknown_component_is_rejected() {
    let store = MemoryStore::new();
    let (mut cb, ids) = memory_manager(&store);
    cb.create_entity(&[ids.baz]).unwrap();
    cb.commit_pending().unwrap();

    // A build that only knows "foo" cannot interpret the saved archetype.
    let mut fewer = ComponentRegistry::new();
    fewer.register::<Foo>("foo").unwrap();
    let mut cb = CommandBuffer::new(Arc::new(store.clone()));
    let err = cb.register_components(Arc::new(fewer)).unwrap_err();
    assert!(matches!(err, EcsError::ComponentMismatchWithSavedState { .. }));
}

#[test]
fn reordered_registration_cannot_reinterpret_saved_values() {
    #[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Gold(u64);
    #[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Gems(u64);

    fn open(store: &MemoryStore, gold_first: bool) -> Result<CommandBuffer, EcsError> {
        let mut registry = ComponentRegistry::new();
        if gold_first {
            registry.register::<Gold>("gold")?;
            registry.register::<Gems>("gems")?;
        } else {
            registry.register::<Gems>("gems")?;
            registry.register::<Gold>("gold")?;
        }
        let mut cb = CommandBuffer::new(Arc::new(store.clone()));
        cb.register_components(Arc::new(registry))?;
        Ok(cb)
    }

    let store = MemoryStore::new();
    let mut cb = open(&store, true).unwrap();
    let gold = cb.registry().unwrap().require::<Gold>().unwrap();
    let e = cb.create_entity(&[gold]).unwrap();
    cb.set(e, &Gold(500)).unwrap();
    cb.commit_pending().unwrap();

    let err = open(&store, false).unwrap_err();
    assert!(
        matches!(err, EcsError::ComponentIdMismatch { ref name, .. } if name == "gems"),
        "{err}"
    );

    let mut cb = open(&store, true).unwrap();
    assert_eq!(cb.get::<Gold>(e).unwrap(), Gold(500));
}

#[test]
fn changed_field_type_is_rejected_before_any_read() {
    mod before {
        #[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
        pub struct Tag {
            pub owner: Option<u64>,
        }
    }
    mod after {
        #[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
        pub struct Tag {
            pub owner: Option<String>,
        }
    }

    let store = MemoryStore::new();
    let mut registry = ComponentRegistry::new();
    let tag = registry.register::<before::Tag>("tag").unwrap();
    let mut cb = CommandBuffer::new(Arc::new(store.clone()));
    cb.register_components(Arc::new(registry)).unwrap();
    let e = cb.create_entity(&[tag]).unwrap();
    cb.set(e, &before::Tag { owner: Some(7) }).unwrap();
    cb.commit_pending().unwrap();

    let mut changed = ComponentRegistry::new();
    changed.register::<after::Tag>("tag").unwrap();
    let mut cb = CommandBuffer::new(Arc::new(store.clone()));
    assert!(matches!(
        cb.register_components(Arc::new(changed)),
        Err(EcsError::SchemaMismatch { ref name }) if name == "tag"
    ));
}

// ---------------------------------------------------------------------------
// Search cache monotonicity
// ---------------------------------------------------------------------------

#[test]
fn search_does_not_rescan_classified_archetypes() {
    #[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
    struct C1;
    #[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
    struct C2;
    #[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
    struct C3;

    let mut registry = ComponentRegistry::new();
    let a = registry.register::<Foo>("a").unwrap();
    let b = registry.register::<Bar>("b").unwrap();
    let others = [
        registry.register::<Baz>("c0").unwrap(),
        registry.register::<C1>("c1").unwrap(),
        registry.register::<C2>("c2").unwrap(),
        registry.register::<C3>("c3").unwrap(),
    ];
    let mut cb = CommandBuffer::new(Arc::new(MemoryStore::new()));
    cb.register_components(Arc::new(registry)).unwrap();

    cb.create_entity(&[a, b]).unwrap();
    let mut search = Search::new(ComponentFilter::contains(&[a, b]));
    assert_eq!(search.count(&cb).unwrap(), 1);
    let examined_after_first = cb.archetypes_examined();
    assert_eq!(examined_after_first, 1);

    // Five new archetypes, none of which contain both A and B.
    cb.create_entity(&[a]).unwrap();
    for other in others {
        cb.create_entity(&[other]).unwrap();
    }
    assert_eq!(cb.archetype_count().unwrap(), 6);

    assert_eq!(search.count(&cb).unwrap(), 1);
    assert_eq!(cb.archetypes_examined(), examined_after_first + 5);

    // Nothing new: nothing is examined.
    assert_eq!(search.count(&cb).unwrap(), 1);
    assert_eq!(cb.archetypes_examined(), examined_after_first + 5);
    assert_eq!(search.scanned(), 6);
}

#[test]
fn durable_reader_search_ignores_pending_archetypes() {
    let store = MemoryStore::new();
    let (mut cb, ids) = memory_manager(&store);
    cb.create_entities(2, &[ids.foo]).unwrap();
    cb.commit_pending().unwrap();
    cb.create_entities(3, &[ids.foo, ids.bar]).unwrap();

    let reader = DurableReader::for_buffer(&cb).unwrap();
    let mut durable = Search::new(ComponentFilter::contains(&[ids.foo]));
    assert_eq!(durable.count(&reader).unwrap(), 2);

    let mut pending = Search::new(ComponentFilter::contains(&[ids.foo]));
    assert_eq!(pending.count(&cb).unwrap(), 5);
}
