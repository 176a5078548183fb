//! Tessera ECS -- archetype-indexed entity/component state over a durable
//! key-value store.
//!
//! Entities are grouped into archetypes (one per unique set of component
//! types). All state lives in a [`KvStore`](tessera_store::KvStore); the
//! [`CommandBuffer`](command::CommandBuffer) is the in-memory staging layer
//! in front of it. Every mutation made during a tick is buffered, and the
//! tick either commits all of it in one atomic pipeline or discards all of
//! it.
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use tessera_ecs::prelude::*;
//! use tessera_store::MemoryStore;
//!
//! #[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
//! struct Position { x: f32, y: f32 }
//!
//! #[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
//! struct Velocity { dx: f32, dy: f32 }
//!
//! let mut registry = ComponentRegistry::new();
//! let pos = registry.register::<Position>("position").unwrap();
//! let vel = registry.register::<Velocity>("velocity").unwrap();
//!
//! let store = MemoryStore::new();
//! let mut buffer = CommandBuffer::new(Arc::new(store.clone()));
//! buffer.register_components(Arc::new(registry)).unwrap();
//!
//! let entity = buffer.create_entity(&[pos, vel]).unwrap();
//! buffer.set(entity, &Position { x: 1.0, y: 2.0 }).unwrap();
//! buffer.commit_pending().unwrap();
//!
//! let mut search = Search::new(ComponentFilter::contains(&[pos]));
//! assert_eq!(search.count(&buffer).unwrap(), 1);
//! assert_eq!(buffer.get::<Position>(entity).unwrap(), Position { x: 1.0, y: 2.0 });
//! ```

#![deny(unsafe_code)]

pub mod archetype;
pub mod command;
pub mod component;
pub mod entity;
pub mod filter;
pub mod keys;
pub mod reader;
pub mod search;
pub mod shape;
pub mod tick_store;

use archetype::ArchetypeId;
use component::ComponentTypeId;
use entity::EntityId;
use tessera_store::StoreError;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by ECS operations.
#[derive(Debug, thiserror::Error)]
pub enum EcsError {
    // -- startup ------------------------------------------------------------
    /// An operation needed the component registry before it was attached.
    #[error("components must be registered before the command buffer is used")]
    ComponentsNotRegistered,

    /// [`register_components`](command::CommandBuffer::register_components) was called twice.
    #[error("components are already registered on this command buffer")]
    ComponentsAlreadyRegistered,

    #[error("component name '{name}' is already registered")]
    DuplicateComponentName { name: String },

    #[error("cannot register '{name}': the same type is already registered as '{existing}'")]
    DuplicateComponentType { name: String, existing: String },

    /// The compiled component type no longer matches the persisted schema.
    #[error("schema for component '{name}' does not match the persisted schema")]
    SchemaMismatch { name: String },

    /// A component's id differs from the one its data was saved under.
    #[error("component '{name}' is registered as id {registered} but saved state uses id {stored}; register components in their original order")]
    ComponentIdMismatch {
        name: String,
        registered: ComponentTypeId,
        stored: ComponentTypeId,
    },

    #[error("component '{name}' would take id {id}, which saved state assigns to '{owner}'")]
    ComponentIdTaken {
        name: String,
        id: ComponentTypeId,
        owner: String,
    },

    /// The saved archetype table references a component this build lacks.
    #[error("saved archetype {archetype} references unregistered component {component}")]
    ComponentMismatchWithSavedState {
        archetype: ArchetypeId,
        component: ComponentTypeId,
    },

    #[error("persisted state at '{key}' is corrupt: {details}")]
    CorruptState { key: String, details: String },

    // -- lookups ------------------------------------------------------------
    #[error("component type '{name}' not registered. Registered components: [{registered}]")]
    ComponentNotRegistered { name: String, registered: String },

    #[error("component type id {id} is not registered")]
    UnknownComponentId { id: ComponentTypeId },

    #[error("archetype {archetype} does not exist")]
    UnknownArchetype { archetype: ArchetypeId },

    #[error("no archetype exists for components {components:?}")]
    ArchetypeNotFound { components: Vec<ComponentTypeId> },

    // -- structural ---------------------------------------------------------
    #[error("entity {entity} does not exist")]
    EntityNotFound { entity: EntityId },

    #[error("component '{component}' is not on entity {entity}")]
    ComponentNotOnEntity { component: String, entity: EntityId },

    #[error("component '{component}' is already on entity {entity}")]
    ComponentAlreadyOnEntity { component: String, entity: EntityId },

    #[error("entity {entity} must keep at least one component")]
    EntityMustHaveAtLeastOneComponent { entity: EntityId },

    #[error("a component set must contain at least one component")]
    EmptyComponentSet,

    #[error("component {component} appears more than once in the set")]
    DuplicateComponentInSet { component: ComponentTypeId },

    #[error("entity {entity} is not listed in archetype {archetype}")]
    EntityNotInArchetype {
        entity: EntityId,
        archetype: ArchetypeId,
    },

    // -- values -------------------------------------------------------------
    /// A component value did not match its registered type.
    #[error("failed to encode or decode component '{component}': {details}")]
    ComponentCodec { component: String, details: String },

    // -- I/O ----------------------------------------------------------------
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Convenience alias used throughout the ECS crate.
pub type Result<T> = std::result::Result<T, EcsError>;

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::archetype::ArchetypeId;
    pub use crate::command::CommandBuffer;
    pub use crate::component::{
        Component, ComponentBundle, ComponentInfo, ComponentRegistry, ComponentTypeId,
    };
    pub use crate::entity::EntityId;
    pub use crate::filter::ComponentFilter;
    pub use crate::reader::{DurableReader, StateReader};
    pub use crate::search::Search;
    pub use crate::EcsError;
}
