//! Entity identifiers and per-archetype membership lists.
//!
//! Entity ids are plain monotonically increasing integers. Unlike an
//! in-memory ECS there is no generation counter: ids are allocated from a
//! durable counter and are never handed out twice, even when the tick that
//! allocated them is rolled back.

use std::fmt;

use crate::archetype::ArchetypeId;
use crate::EcsError;

// ---------------------------------------------------------------------------
// EntityId
// ---------------------------------------------------------------------------

/// Globally unique identifier of an entity within one namespace.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct EntityId(u64);

impl EntityId {
    /// Wrap a raw id.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw integer.
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// ActiveEntities
// ---------------------------------------------------------------------------

/// The ordered list of entities that currently belong to one archetype.
///
/// `modified` is set by every mutation so the flush only rewrites lists that
/// actually changed this tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveEntities {
    pub(crate) ids: Vec<EntityId>,
    pub(crate) modified: bool,
}

impl ActiveEntities {
    /// A clean list loaded from durable state.
    pub(crate) fn loaded(ids: Vec<EntityId>) -> Self {
        Self {
            ids,
            modified: false,
        }
    }

    /// Append an entity to the end of the list.
    pub fn push(&mut self, id: EntityId) {
        self.ids.push(id);
        self.modified = true;
    }

    /// Remove `id` by swapping it with the last element.
    ///
    /// Ordering of the remaining ids is not preserved.
    pub fn swap_remove(&mut self, id: EntityId, archetype: ArchetypeId) -> Result<(), EcsError> {
        let pos = self
            .ids
            .iter()
            .position(|&e| e == id)
            .ok_or(EcsError::EntityNotInArchetype {
                entity: id,
                archetype,
            })?;
        self.ids.swap_remove(pos);
        self.modified = true;
        Ok(())
    }

    pub fn ids(&self) -> &[EntityId] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Whether the list changed since it was loaded.
    pub fn is_modified(&self) -> bool {
        self.modified
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
