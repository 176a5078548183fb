//! Read-only access to entity state.
//!
//! [`StateReader`] is the seam between storage and anything that only
//! looks: [`Search`](crate::search::Search), query handlers, tests. Two
//! implementations exist:
//!
//! - [`CommandBuffer`] answers from the pending overlay first, so systems
//!   see their own uncommitted writes. Reads through this trait never cache
//!   and never stage anything.
//! - [`DurableReader`] answers from committed state only, straight from the
//!   store. Safe to hand to a query layer while a tick is running.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tessera_store::{get_json, KvStore};

use crate::archetype::ArchetypeId;
use crate::command::{load_active_entities, load_entity_archetype, CommandBuffer};
use crate::component::{Component, ComponentRegistry, ComponentTypeId};
use crate::entity::EntityId;
use crate::filter::ComponentFilter;
use crate::{keys, EcsError, Result};

/// Read-only view of archetypes, entities and component values.
pub trait StateReader {
    /// Number of archetypes that exist in this view.
    fn archetype_count(&self) -> Result<usize>;

    /// Changes whenever archetype ids this view handed out were withdrawn
    /// and may be reused for different component sets. Views whose ids are
    /// never withdrawn keep the default.
    fn archetype_generation(&self) -> u64 {
        0
    }

    /// Archetypes with id `>= start` whose component set passes `filter`, in
    /// ascending id order.
    fn search_from(&self, filter: &ComponentFilter, start: usize) -> Result<Vec<ArchetypeId>>;

    /// Entities currently in `archetype`, in list order.
    fn entities_for_archetype(&self, archetype: ArchetypeId) -> Result<Vec<EntityId>>;

    /// Sorted component types of an entity.
    fn component_types_for_entity(&self, id: EntityId) -> Result<Vec<ComponentTypeId>>;

    /// A component value, or the type's default if it was never set.
    fn component_value(&self, ctype: ComponentTypeId, id: EntityId) -> Result<Value>;

    /// The registry used to interpret component ids.
    fn component_registry(&self) -> Result<&ComponentRegistry>;

    /// Typed [`component_value`](Self::component_value).
    fn read<T: Component>(&self, id: EntityId) -> Result<T>
    where
        Self: Sized,
    {
        read_typed(self, id)
    }
}

impl dyn StateReader + '_ {
    /// Typed read through a trait object, as handed to search predicates.
    pub fn read<T: Component>(&self, id: EntityId) -> Result<T> {
        read_typed(self, id)
    }
}

pub(crate) fn read_typed<T: Component>(reader: &dyn StateReader, id: EntityId) -> Result<T> {
    let registry = reader.component_registry()?;
    let ctype = registry.require::<T>()?;
    let value = reader.component_value(ctype, id)?;
    serde_json::from_value(value).map_err(|e| EcsError::ComponentCodec {
        component: registry.name_of(ctype),
        details: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// CommandBuffer: pending view
// ---------------------------------------------------------------------------

impl StateReader for CommandBuffer {
    fn archetype_count(&self) -> Result<usize> {
        self.require_registry()?;
        Ok(self.archetype_len())
    }

    fn archetype_generation(&self) -> u64 {
        CommandBuffer::archetype_generation(self)
    }

    fn search_from(&self, filter: &ComponentFilter, start: usize) -> Result<Vec<ArchetypeId>> {
        self.require_registry()?;
        self.matching_archetypes(filter, start)
    }

    fn entities_for_archetype(&self, archetype: ArchetypeId) -> Result<Vec<EntityId>> {
        self.peek_entities(archetype)
    }

    fn component_types_for_entity(&self, id: EntityId) -> Result<Vec<ComponentTypeId>> {
        self.peek_component_types(id)
    }

    fn component_value(&self, ctype: ComponentTypeId, id: EntityId) -> Result<Value> {
        self.peek_value(ctype, id)
    }

    fn component_registry(&self) -> Result<&ComponentRegistry> {
        Ok(self.require_registry()?.as_ref())
    }
}

// ---------------------------------------------------------------------------
// DurableReader: committed view
// ---------------------------------------------------------------------------

/// Reader over committed state only.
///
/// The archetype table is re-read on every call, so a long-lived reader
/// observes ticks committed after it was created.
pub struct DurableReader {
    store: Arc<dyn KvStore>,
    registry: Arc<ComponentRegistry>,
}

impl DurableReader {
    pub fn new(store: Arc<dyn KvStore>, registry: Arc<ComponentRegistry>) -> Self {
        Self { store, registry }
    }

    /// Build a reader sharing `buffer`'s store and registry.
    pub fn for_buffer(buffer: &CommandBuffer) -> Result<Self> {
        let registry = buffer
            .registry()
            .ok_or(EcsError::ComponentsNotRegistered)?;
        Ok(Self::new(Arc::clone(buffer.store()), Arc::clone(registry)))
    }

    fn archetype_table(&self) -> Result<BTreeMap<u32, Vec<ComponentTypeId>>> {
        Ok(get_json(self.store.as_ref(), keys::ARCHETYPE_TABLE)?.unwrap_or_default())
    }
}

impl StateReader for DurableReader {
    fn archetype_count(&self) -> Result<usize> {
        Ok(self.archetype_table()?.len())
    }

    fn search_from(&self, filter: &ComponentFilter, start: usize) -> Result<Vec<ArchetypeId>> {
        Ok(self
            .archetype_table()?
            .into_iter()
            .filter(|(id, set)| *id as usize >= start && filter.matches(set))
            .map(|(id, _)| ArchetypeId::new(id))
            .collect())
    }

    fn entities_for_archetype(&self, archetype: ArchetypeId) -> Result<Vec<EntityId>> {
        if !self.archetype_table()?.contains_key(&archetype.get()) {
            return Err(EcsError::UnknownArchetype { archetype });
        }
        Ok(load_active_entities(self.store.as_ref(), archetype)?.ids)
    }

    fn component_types_for_entity(&self, id: EntityId) -> Result<Vec<ComponentTypeId>> {
        let archetype = load_entity_archetype(self.store.as_ref(), id)?;
        self.archetype_table()?
            .remove(&archetype.get())
            .ok_or(EcsError::UnknownArchetype { archetype })
    }

    fn component_value(&self, ctype: ComponentTypeId, id: EntityId) -> Result<Value> {
        let info = self.registry.require_info(ctype)?;
        if !self.component_types_for_entity(id)?.contains(&ctype) {
            return Err(EcsError::ComponentNotOnEntity {
                component: info.name.clone(),
                entity: id,
            });
        }
        let decoded = match self.store.get(&keys::component_value(ctype, id))? {
            Some(bytes) => info.vtable.decode(&bytes),
            None => info.vtable.default_value(),
        };
        decoded.map_err(|details| EcsError::ComponentCodec {
            component: info.name.clone(),
            details,
        })
    }

    fn component_registry(&self) -> Result<&ComponentRegistry> {
        Ok(&self.registry)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
