//! The command buffer: staged entity/component mutations over a durable store.
//!
//! Reads fall through the pending overlay to the [`KvStore`] and are cached
//! in the overlay. Writes only touch the overlay. At the end of a tick the
//! overlay is either flushed as one atomic [`Pipeline`] or thrown away with
//! [`CommandBuffer::discard_pending`], which restores exactly the view that
//! was durable when the tick began.
//!
//! # Pending state
//!
//! | overlay                | rolled back by discard                        |
//! |------------------------|-----------------------------------------------|
//! | component values       | cleared (re-read from the store on demand)    |
//! | component deletes      | cleared                                       |
//! | active-entity lists    | cleared (re-read from the store on demand)    |
//! | entity origins         | every recorded entity's pointer is re-read    |
//! | entity-id counter      | pending allocations dropped, ids never reused |
//! | staged archetypes      | truncated back to the durable table           |
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use tessera_ecs::prelude::*;
//! use tessera_store::MemoryStore;
//!
//! #[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
//! struct Health { hp: u32 }
//!
//! let mut registry = ComponentRegistry::new();
//! let health = registry.register::<Health>("health").unwrap();
//!
//! let mut buffer = CommandBuffer::new(Arc::new(MemoryStore::new()));
//! buffer.register_components(Arc::new(registry)).unwrap();
//!
//! let e = buffer.create_entity(&[health]).unwrap();
//! buffer.set(e, &Health { hp: 10 }).unwrap();
//! buffer.discard_pending();
//!
//! // The entity was never committed.
//! assert!(buffer.get::<Health>(e).is_err());
//! ```

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tessera_store::{get_json, KvStore, Pipeline};
use tracing::debug;

use crate::archetype::{ArchetypeId, ArchetypeTable};
use crate::component::{
    Component, ComponentBundle, ComponentRegistry, ComponentTypeId, ComponentVtable,
};
use crate::entity::{ActiveEntities, EntityId};
use crate::filter::ComponentFilter;
use crate::{keys, EcsError, Result};

// ---------------------------------------------------------------------------
// Overlay entries
// ---------------------------------------------------------------------------

/// Identifies one component value on one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct ComponentKey {
    pub(crate) ctype: ComponentTypeId,
    pub(crate) entity: EntityId,
}

impl ComponentKey {
    fn storage_key(self) -> String {
        keys::component_value(self.ctype, self.entity)
    }
}

#[derive(Debug, Clone)]
struct PendingValue {
    value: Value,
    /// Written this tick, as opposed to cached from a read.
    dirty: bool,
}

// ---------------------------------------------------------------------------
// CommandBuffer
// ---------------------------------------------------------------------------

/// In-memory staging area over a [`KvStore`].
///
/// Single writer: only the tick in flight mutates it, so it carries no
/// internal locking.
pub struct CommandBuffer {
    store: Arc<dyn KvStore>,
    /// `None` until [`register_components`](Self::register_components).
    registry: Option<Arc<ComponentRegistry>>,

    archetypes: ArchetypeTable,
    values: BTreeMap<ComponentKey, PendingValue>,
    deletes: BTreeSet<ComponentKey>,
    active: BTreeMap<ArchetypeId, ActiveEntities>,

    /// Cached entity pointers. `None` marks an entity removed this tick.
    entity_archetype: HashMap<EntityId, Option<ArchetypeId>>,
    /// Archetype each touched entity had when the tick began. `None` for
    /// entities created this tick. First write wins.
    origins: BTreeMap<EntityId, Option<ArchetypeId>>,

    /// Durable next-entity-id, loaded lazily.
    next_entity_saved: Option<u64>,
    pending_entity_ids: u64,

    /// Number of archetype component sets tested against a filter.
    archetypes_examined: AtomicU64,
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("archetypes", &self.archetypes.len())
            .field("pending_values", &self.values.len())
            .field("pending_deletes", &self.deletes.len())
            .field("touched_entities", &self.origins.len())
            .field("pending_entity_ids", &self.pending_entity_ids)
            .finish_non_exhaustive()
    }
}

impl CommandBuffer {
    /// Create a command buffer over `store` with empty pending state.
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            registry: None,
            archetypes: ArchetypeTable::default(),
            values: BTreeMap::new(),
            deletes: BTreeSet::new(),
            active: BTreeMap::new(),
            entity_archetype: HashMap::new(),
            origins: BTreeMap::new(),
            next_entity_saved: None,
            pending_entity_ids: 0,
            archetypes_examined: AtomicU64::new(0),
        }
    }

    /// Attach the component registry, validate its schemas against the store
    /// and load the durable archetype table.
    pub fn register_components(&mut self, registry: Arc<ComponentRegistry>) -> Result<()> {
        if self.registry.is_some() {
            return Err(EcsError::ComponentsAlreadyRegistered);
        }
        registry.sync_schemas(self.store.as_ref())?;

        let persisted: BTreeMap<u32, Vec<ComponentTypeId>> =
            get_json(self.store.as_ref(), keys::ARCHETYPE_TABLE)?.unwrap_or_default();
        self.archetypes =
            ArchetypeTable::from_persisted(persisted, |id| registry.info(id).is_some())?;

        tracing::info!(
            components = registry.len(),
            archetypes = self.archetypes.len(),
            "command buffer loaded"
        );
        self.registry = Some(registry);
        Ok(())
    }

    /// The attached registry, if any.
    pub fn registry(&self) -> Option<&Arc<ComponentRegistry>> {
        self.registry.as_ref()
    }

    /// The underlying store handle.
    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub(crate) fn require_registry(&self) -> Result<&Arc<ComponentRegistry>> {
        self.registry.as_ref().ok_or(EcsError::ComponentsNotRegistered)
    }

    fn vtable(&self, ctype: ComponentTypeId) -> Result<ComponentVtable> {
        Ok(self.require_registry()?.require_info(ctype)?.vtable)
    }

    fn component_name(&self, ctype: ComponentTypeId) -> String {
        self.registry
            .as_ref()
            .map_or_else(|| format!("#{ctype}"), |r| r.name_of(ctype))
    }

    // -- entity lifecycle ---------------------------------------------------

    /// Create `count` entities with the given component set.
    ///
    /// Component values start out unset and read as their defaults.
    pub fn create_entities(
        &mut self,
        count: usize,
        components: &[ComponentTypeId],
    ) -> Result<Vec<EntityId>> {
        let registry = Arc::clone(self.require_registry()?);
        for &ctype in components {
            registry.require_info(ctype)?;
        }
        let archetype = self.resolve_archetype(components)?;

        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            ids.push(self.next_entity_id()?);
        }

        let active = self.active_mut(archetype)?;
        for &id in &ids {
            active.push(id);
        }
        for &id in &ids {
            self.entity_archetype.insert(id, Some(archetype));
            self.origins.insert(id, None);
        }

        debug!(count, archetype_id = archetype.get(), "created entities");
        Ok(ids)
    }

    /// Create one entity with the given component set.
    pub fn create_entity(&mut self, components: &[ComponentTypeId]) -> Result<EntityId> {
        let mut ids = self.create_entities(1, components)?;
        ids.pop().ok_or(EcsError::EmptyComponentSet)
    }

    /// Create `count` entities and set each value from `bundle` on all of
    /// them.
    pub fn create_with(&mut self, count: usize, bundle: &ComponentBundle) -> Result<Vec<EntityId>> {
        let ids = self.create_entities(count, &bundle.component_ids())?;
        for &id in &ids {
            for (ctype, value) in bundle.values() {
                self.set_component(*ctype, id, value.clone())?;
            }
        }
        Ok(ids)
    }

    /// Remove an entity and stage deletion of all its component values.
    pub fn remove_entity(&mut self, id: EntityId) -> Result<()> {
        self.require_registry()?;
        let archetype = self.archetype_of(id)?;
        self.active_mut(archetype)?.swap_remove(id, archetype)?;

        self.origins.entry(id).or_insert(Some(archetype));
        self.entity_archetype.insert(id, None);

        let components = self.archetypes.components(archetype)?.to_vec();
        for ctype in components {
            let key = ComponentKey { ctype, entity: id };
            self.values.remove(&key);
            self.deletes.insert(key);
        }
        Ok(())
    }

    // -- component values ---------------------------------------------------

    /// Stage a new value for a component the entity already has.
    pub fn set_component(&mut self, ctype: ComponentTypeId, id: EntityId, value: Value) -> Result<()> {
        let vtable = self.vtable(ctype)?;
        self.ensure_on_entity(ctype, id)?;
        vtable
            .validate(&value)
            .map_err(|details| EcsError::ComponentCodec {
                component: self.component_name(ctype),
                details,
            })?;
        self.values.insert(
            ComponentKey { ctype, entity: id },
            PendingValue { value, dirty: true },
        );
        Ok(())
    }

    /// Read a component value: pending overlay first, then the store, then
    /// the type's default. Store reads and defaults are cached in the
    /// overlay.
    pub fn get_component(&mut self, ctype: ComponentTypeId, id: EntityId) -> Result<Value> {
        let vtable = self.vtable(ctype)?;
        let key = ComponentKey { ctype, entity: id };
        if let Some(pending) = self.values.get(&key) {
            return Ok(pending.value.clone());
        }

        self.ensure_on_entity(ctype, id)?;
        let value = self.read_through(vtable, key)?;
        self.values.insert(
            key,
            PendingValue {
                value: value.clone(),
                dirty: false,
            },
        );
        Ok(value)
    }

    /// Typed [`get_component`](Self::get_component).
    pub fn get<T: Component>(&mut self, id: EntityId) -> Result<T> {
        let ctype = self.require_registry()?.require::<T>()?;
        let value = self.get_component(ctype, id)?;
        serde_json::from_value(value).map_err(|e| EcsError::ComponentCodec {
            component: self.component_name(ctype),
            details: e.to_string(),
        })
    }

    /// Typed [`set_component`](Self::set_component).
    pub fn set<T: Component>(&mut self, id: EntityId, value: &T) -> Result<()> {
        let ctype = self.require_registry()?.require::<T>()?;
        let json = serde_json::to_value(value).map_err(|e| EcsError::ComponentCodec {
            component: self.component_name(ctype),
            details: e.to_string(),
        })?;
        self.set_component(ctype, id, json)
    }

    /// Read, modify and stage a typed component value.
    pub fn update<T: Component>(&mut self, id: EntityId, f: impl FnOnce(&mut T)) -> Result<()> {
        let mut value = self.get::<T>(id)?;
        f(&mut value);
        self.set(id, &value)
    }

    // -- archetype moves ----------------------------------------------------

    /// Add a component type to an entity, moving it to the matching
    /// archetype. The new component reads as its default until set.
    pub fn add_component_to_entity(&mut self, ctype: ComponentTypeId, id: EntityId) -> Result<()> {
        self.vtable(ctype)?;
        let from = self.archetype_of(id)?;
        let current = self.archetypes.components(from)?;
        if current.contains(&ctype) {
            return Err(EcsError::ComponentAlreadyOnEntity {
                component: self.component_name(ctype),
                entity: id,
            });
        }
        let mut next = current.to_vec();
        next.push(ctype);

        let to = self.resolve_archetype(&next)?;
        self.move_entity(from, to, id)
    }

    /// Remove a component type from an entity, moving it to the matching
    /// archetype and staging deletion of the value.
    pub fn remove_component_from_entity(
        &mut self,
        ctype: ComponentTypeId,
        id: EntityId,
    ) -> Result<()> {
        self.vtable(ctype)?;
        let from = self.archetype_of(id)?;
        let current = self.archetypes.components(from)?;
        if !current.contains(&ctype) {
            return Err(EcsError::ComponentNotOnEntity {
                component: self.component_name(ctype),
                entity: id,
            });
        }
        if current.len() == 1 {
            return Err(EcsError::EntityMustHaveAtLeastOneComponent { entity: id });
        }
        let next: Vec<ComponentTypeId> = current.iter().copied().filter(|&c| c != ctype).collect();

        let to = self.resolve_archetype(&next)?;
        let key = ComponentKey { ctype, entity: id };
        self.values.remove(&key);
        self.deletes.insert(key);
        self.move_entity(from, to, id)
    }

    /// Move an entity between archetypes, remembering where it started the
    /// tick.
    fn move_entity(&mut self, from: ArchetypeId, to: ArchetypeId, id: EntityId) -> Result<()> {
        if from == to {
            return Ok(());
        }
        self.active_mut(from)?.swap_remove(id, from)?;
        self.active_mut(to)?.push(id);

        self.origins.entry(id).or_insert(Some(from));
        self.entity_archetype.insert(id, Some(to));
        Ok(())
    }

    // -- archetype lookups --------------------------------------------------

    /// The archetype holding exactly `components` (order and repeats are
    /// ignored).
    pub fn arch_id_for_components(&self, components: &[ComponentTypeId]) -> Result<ArchetypeId> {
        self.archetypes.find(components)
    }

    /// The sorted component set of an archetype.
    pub fn component_types_for_archetype(&self, archetype: ArchetypeId) -> Result<Vec<ComponentTypeId>> {
        Ok(self.archetypes.components(archetype)?.to_vec())
    }

    /// How many archetype component sets have been tested against a filter
    /// since this buffer was created.
    pub fn archetypes_examined(&self) -> u64 {
        self.archetypes_examined.load(Ordering::Relaxed)
    }

    fn resolve_archetype(&mut self, components: &[ComponentTypeId]) -> Result<ArchetypeId> {
        let (id, created) = self.archetypes.find_or_stage(components)?;
        if created {
            debug!(archetype_id = id.get(), components = ?components, "new archetype staged");
        }
        Ok(id)
    }

    // -- pending state lifecycle --------------------------------------------

    /// Throw away everything staged since the last commit.
    ///
    /// Idempotent. Entity ids allocated since the last commit are skipped,
    /// not handed out again.
    pub fn discard_pending(&mut self) {
        self.values.clear();
        self.deletes.clear();
        self.active.clear();
        for id in std::mem::take(&mut self.origins).into_keys() {
            self.entity_archetype.remove(&id);
        }
        self.next_entity_saved = self
            .next_entity_saved
            .map(|saved| saved + self.pending_entity_ids);
        self.pending_entity_ids = 0;
        self.archetypes.discard_staged();
    }

    /// Commit all pending state in one atomic pipeline.
    ///
    /// Pending state is left as is; use [`commit_pending`](Self::commit_pending)
    /// to also start a fresh overlay.
    pub fn flush_to_store(&self) -> Result<()> {
        let pipe = self.build_flush_pipeline()?;
        self.store.commit(pipe)?;
        Ok(())
    }

    /// Flush, then fold the committed state into the durable baseline and
    /// reset the overlay.
    pub fn commit_pending(&mut self) -> Result<()> {
        self.flush_to_store()?;
        self.mark_committed();
        Ok(())
    }

    /// Called after a successful commit of [`build_flush_pipeline`](Self::build_flush_pipeline).
    pub(crate) fn mark_committed(&mut self) {
        self.archetypes.mark_durable();
        self.discard_pending();
    }

    /// Build the pipeline that makes all pending state durable.
    pub(crate) fn build_flush_pipeline(&self) -> Result<Pipeline> {
        let registry = self.require_registry()?;
        let mut pipe = Pipeline::new();

        // component_changes: deletes first so a re-added value wins.
        for key in &self.deletes {
            pipe.delete(key.storage_key());
        }
        for (key, pending) in self.values.iter().filter(|(_, p)| p.dirty) {
            let info = registry.require_info(key.ctype)?;
            let bytes = info
                .vtable
                .encode(&pending.value)
                .map_err(|details| EcsError::ComponentCodec {
                    component: info.name.clone(),
                    details,
                })?;
            pipe.set(key.storage_key(), bytes);
        }

        // next_entity_id
        match self.next_entity_saved {
            Some(saved) if self.pending_entity_ids > 0 => {
                pipe.set_json(keys::NEXT_ENTITY_ID, &(saved + self.pending_entity_ids))?;
            }
            _ => {}
        }

        // archetype table
        if self.archetypes.has_staged() {
            pipe.set_json(keys::ARCHETYPE_TABLE, &self.archetypes.to_persisted())?;
        }

        // entity pointers
        for (&id, &origin) in &self.origins {
            let key = keys::entity_archetype(id);
            match self.entity_archetype.get(&id).copied().flatten() {
                None => pipe.delete(key),
                Some(current) if Some(current) == origin => {}
                Some(current) => pipe.set_json(key, &current)?,
            }
        }

        // active entity lists
        for (&archetype, active) in self.active.iter().filter(|(_, a)| a.is_modified()) {
            pipe.set_json(keys::active_entities(archetype), active.ids())?;
        }

        Ok(pipe)
    }

    /// Release the store connection.
    pub fn close(&self) -> Result<()> {
        self.store.close()?;
        Ok(())
    }

    // -- caching reads ------------------------------------------------------

    fn next_entity_id(&mut self) -> Result<EntityId> {
        let saved = match self.next_entity_saved {
            Some(saved) => saved,
            None => {
                let saved: u64 = get_json(self.store.as_ref(), keys::NEXT_ENTITY_ID)?.unwrap_or(0);
                self.next_entity_saved = Some(saved);
                self.pending_entity_ids = 0;
                saved
            }
        };
        let id = saved + self.pending_entity_ids;
        self.pending_entity_ids += 1;
        Ok(EntityId::new(id))
    }

    fn archetype_of(&mut self, id: EntityId) -> Result<ArchetypeId> {
        if let Some(cached) = self.entity_archetype.get(&id) {
            return cached.ok_or(EcsError::EntityNotFound { entity: id });
        }
        let archetype = load_entity_archetype(self.store.as_ref(), id)?;
        self.entity_archetype.insert(id, Some(archetype));
        Ok(archetype)
    }

    fn active_mut(&mut self, archetype: ArchetypeId) -> Result<&mut ActiveEntities> {
        match self.active.entry(archetype) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let loaded = load_active_entities(self.store.as_ref(), archetype)?;
                Ok(entry.insert(loaded))
            }
        }
    }

    fn ensure_on_entity(&mut self, ctype: ComponentTypeId, id: EntityId) -> Result<()> {
        let archetype = self.archetype_of(id)?;
        if self.archetypes.components(archetype)?.contains(&ctype) {
            Ok(())
        } else {
            Err(EcsError::ComponentNotOnEntity {
                component: self.component_name(ctype),
                entity: id,
            })
        }
    }

    /// Value of a component known to be on the entity, ignoring the cached
    /// overlay values.
    fn read_through(&self, vtable: ComponentVtable, key: ComponentKey) -> Result<Value> {
        let stored = if self.deletes.contains(&key) {
            None
        } else {
            self.store.get(&key.storage_key())?
        };
        let decoded = match stored {
            Some(bytes) => vtable.decode(&bytes),
            None => vtable.default_value(),
        };
        decoded.map_err(|details| EcsError::ComponentCodec {
            component: self.component_name(key.ctype),
            details,
        })
    }

    // -- non-caching reads (used by StateReader) ----------------------------

    pub(crate) fn peek_archetype(&self, id: EntityId) -> Result<ArchetypeId> {
        match self.entity_archetype.get(&id) {
            Some(cached) => cached.ok_or(EcsError::EntityNotFound { entity: id }),
            None => load_entity_archetype(self.store.as_ref(), id),
        }
    }

    pub(crate) fn peek_entities(&self, archetype: ArchetypeId) -> Result<Vec<EntityId>> {
        self.archetypes.components(archetype)?;
        match self.active.get(&archetype) {
            Some(active) => Ok(active.ids().to_vec()),
            None => Ok(load_active_entities(self.store.as_ref(), archetype)?.ids),
        }
    }

    pub(crate) fn peek_component_types(&self, id: EntityId) -> Result<Vec<ComponentTypeId>> {
        let archetype = self.peek_archetype(id)?;
        self.component_types_for_archetype(archetype)
    }

    pub(crate) fn peek_value(&self, ctype: ComponentTypeId, id: EntityId) -> Result<Value> {
        let vtable = self.vtable(ctype)?;
        let key = ComponentKey { ctype, entity: id };
        if let Some(pending) = self.values.get(&key) {
            return Ok(pending.value.clone());
        }
        if !self.peek_component_types(id)?.contains(&ctype) {
            return Err(EcsError::ComponentNotOnEntity {
                component: self.component_name(ctype),
                entity: id,
            });
        }
        self.read_through(vtable, key)
    }

    pub(crate) fn archetype_len(&self) -> usize {
        self.archetypes.len()
    }

    pub(crate) fn archetype_generation(&self) -> u64 {
        self.archetypes.generation()
    }

    pub(crate) fn matching_archetypes(
        &self,
        filter: &ComponentFilter,
        start: usize,
    ) -> Result<Vec<ArchetypeId>> {
        let mut matched = Vec::new();
        for idx in start..self.archetypes.len() {
            let id = ArchetypeId::new(idx as u32);
            self.archetypes_examined.fetch_add(1, Ordering::Relaxed);
            if filter.matches(self.archetypes.components(id)?) {
                matched.push(id);
            }
        }
        Ok(matched)
    }
}

// ---------------------------------------------------------------------------
// Store loaders
// ---------------------------------------------------------------------------

pub(crate) fn load_entity_archetype(store: &dyn KvStore, id: EntityId) -> Result<ArchetypeId> {
    get_json(store, &keys::entity_archetype(id))?.ok_or(EcsError::EntityNotFound { entity: id })
}

pub(crate) fn load_active_entities(
    store: &dyn KvStore,
    archetype: ArchetypeId,
) -> Result<ActiveEntities> {
    let ids: Vec<EntityId> =
        get_json(store, &keys::active_entities(archetype))?.unwrap_or_default();
    Ok(ActiveEntities::loaded(ids))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
