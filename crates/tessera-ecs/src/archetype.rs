//! Archetype identifiers and the archetype table.
//!
//! An archetype is one sorted, duplicate-free set of component types. The
//! table is append-only: an archetype's id is the number of archetypes that
//! existed when it was created, and ids are never reused or reassigned.
//! Archetypes created during the current tick are *staged*; they become
//! durable when the tick commits and vanish when it is discarded.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::component::ComponentTypeId;
use crate::EcsError;

// ---------------------------------------------------------------------------
// ArchetypeId
// ---------------------------------------------------------------------------

/// Identifies an archetype. Dense: valid ids are `0..archetype_count`.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct ArchetypeId(u32);

impl ArchetypeId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ArchetypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArchetypeId({})", self.0)
    }
}

impl fmt::Display for ArchetypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Component set normalization
// ---------------------------------------------------------------------------

/// Sort a component set, rejecting empty sets and repeated types.
pub fn normalize_component_set(
    components: &[ComponentTypeId],
) -> Result<Vec<ComponentTypeId>, EcsError> {
    if components.is_empty() {
        return Err(EcsError::EmptyComponentSet);
    }
    let mut sorted = components.to_vec();
    sorted.sort_unstable();
    if let Some(pair) = sorted.windows(2).find(|w| w[0] == w[1]) {
        return Err(EcsError::DuplicateComponentInSet { component: pair[0] });
    }
    Ok(sorted)
}

/// Sort and de-duplicate a component set for lookups.
fn canonical_lookup_key(components: &[ComponentTypeId]) -> Result<Vec<ComponentTypeId>, EcsError> {
    if components.is_empty() {
        return Err(EcsError::EmptyComponentSet);
    }
    let mut sorted = components.to_vec();
    sorted.sort_unstable();
    sorted.dedup();
    Ok(sorted)
}

// ---------------------------------------------------------------------------
// ArchetypeTable
// ---------------------------------------------------------------------------

/// Archetype id to component set, split into durable and staged parts.
#[derive(Debug, Default)]
pub(crate) struct ArchetypeTable {
    /// Indexed by archetype id.
    sets: Vec<Vec<ComponentTypeId>>,
    by_set: HashMap<Vec<ComponentTypeId>, ArchetypeId>,
    /// `sets[..durable]` are committed; the rest are staged.
    durable: usize,
    /// Bumped whenever staged ids are dropped and may be handed out again.
    generation: u64,
}

impl ArchetypeTable {
    /// Rebuild the table from its persisted form.
    ///
    /// `known` decides whether a component id is registered; a stored
    /// archetype that mentions any other id means the saved state was written
    /// by an incompatible build.
    pub(crate) fn from_persisted(
        persisted: BTreeMap<u32, Vec<ComponentTypeId>>,
        known: impl Fn(ComponentTypeId) -> bool,
    ) -> Result<Self, EcsError> {
        let mut table = Self::default();
        for (expected, (raw_id, set)) in persisted.into_iter().enumerate() {
            let archetype = ArchetypeId(raw_id);
            if archetype.index() != expected {
                return Err(EcsError::CorruptState {
                    key: crate::keys::ARCHETYPE_TABLE.to_owned(),
                    details: format!("archetype ids are not contiguous at {archetype}"),
                });
            }
            if let Some(&unknown) = set.iter().find(|&&c| !known(c)) {
                return Err(EcsError::ComponentMismatchWithSavedState {
                    archetype,
                    component: unknown,
                });
            }
            let set = normalize_component_set(&set)?;
            table.by_set.insert(set.clone(), archetype);
            table.sets.push(set);
        }
        table.durable = table.sets.len();
        Ok(table)
    }

    /// The persisted form of every archetype, staged ones included.
    pub(crate) fn to_persisted(&self) -> BTreeMap<u32, Vec<ComponentTypeId>> {
        self.sets
            .iter()
            .enumerate()
            .map(|(idx, set)| (idx as u32, set.clone()))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.sets.len()
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn has_staged(&self) -> bool {
        self.sets.len() > self.durable
    }

    pub(crate) fn components(&self, id: ArchetypeId) -> Result<&[ComponentTypeId], EcsError> {
        self.sets
            .get(id.index())
            .map(Vec::as_slice)
            .ok_or(EcsError::UnknownArchetype { archetype: id })
    }

    /// Exact, order-independent lookup.
    pub(crate) fn find(&self, components: &[ComponentTypeId]) -> Result<ArchetypeId, EcsError> {
        let key = canonical_lookup_key(components)?;
        self.by_set
            .get(&key)
            .copied()
            .ok_or(EcsError::ArchetypeNotFound { components: key })
    }

    /// Return the archetype for `components`, staging a new one if needed.
    ///
    /// The second element is `true` when the archetype was just created.
    pub(crate) fn find_or_stage(
        &mut self,
        components: &[ComponentTypeId],
    ) -> Result<(ArchetypeId, bool), EcsError> {
        let set = normalize_component_set(components)?;
        if let Some(&existing) = self.by_set.get(&set) {
            return Ok((existing, false));
        }
        let id = ArchetypeId(self.sets.len() as u32);
        self.by_set.insert(set.clone(), id);
        self.sets.push(set);
        Ok((id, true))
    }

    /// Every staged archetype is now durable.
    pub(crate) fn mark_durable(&mut self) {
        self.durable = self.sets.len();
    }

    /// Drop staged archetypes.
    pub(crate) fn discard_staged(&mut self) {
        if !self.has_staged() {
            return;
        }
        for set in self.sets.drain(self.durable..) {
            self.by_set.remove(&set);
        }
        self.generation += 1;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
