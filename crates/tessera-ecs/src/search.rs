//! Cached, filter-driven iteration over entities.
//!
//! A [`Search`] remembers which archetypes matched its filter and how many
//! archetypes it has already classified. Archetypes are append-only and
//! their component sets never change, so each evaluation only has to look
//! at archetypes created since the previous one. The exception is a
//! discarded tick: its staged archetype ids are handed out again, which the
//! reader signals through
//! [`archetype_generation`](StateReader::archetype_generation); the cache is
//! rebuilt when that changes.
//!
//! [`where_`](Search::where_) adds per-entity predicates on top of the
//! archetype filter.
//!
//! ```
//! use std::sync::Arc;
//! use tessera_ecs::prelude::*;
//! use tessera_store::MemoryStore;
//!
//! #[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
//! struct A;
//! #[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
//! struct B;
//!
//! let mut registry = ComponentRegistry::new();
//! let a = registry.register::<A>("a").unwrap();
//! let b = registry.register::<B>("b").unwrap();
//! let mut buffer = CommandBuffer::new(Arc::new(MemoryStore::new()));
//! buffer.register_components(Arc::new(registry)).unwrap();
//!
//! buffer.create_entities(2, &[a, b]).unwrap();
//! buffer.create_entities(3, &[a]).unwrap();
//!
//! let mut both = Search::new(ComponentFilter::contains(&[a, b]));
//! assert_eq!(both.count(&buffer).unwrap(), 2);
//!
//! let mut any_a = Search::new(ComponentFilter::contains(&[a]));
//! assert_eq!(any_a.collect(&buffer).unwrap().len(), 5);
//! ```

use std::fmt;
use std::sync::Arc;

use crate::archetype::ArchetypeId;
use crate::entity::EntityId;
use crate::filter::ComponentFilter;
use crate::reader::StateReader;
use crate::Result;

/// Per-entity test applied after the archetype filter.
pub type Predicate = Arc<dyn Fn(&dyn StateReader, EntityId) -> Result<bool> + Send + Sync>;

/// Archetypes classified so far.
#[derive(Debug, Clone, Default)]
struct SearchCache {
    matched: Vec<ArchetypeId>,
    scanned: usize,
    /// Reader generation the cache was built against.
    generation: u64,
}

/// A filter, optional entity predicates and the incremental match cache.
#[derive(Clone)]
pub struct Search {
    filter: ComponentFilter,
    predicates: Vec<Predicate>,
    cache: SearchCache,
}

impl fmt::Debug for Search {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Search")
            .field("filter", &self.filter)
            .field("predicates", &self.predicates.len())
            .field("cache", &self.cache)
            .finish()
    }
}

impl Search {
    pub fn new(filter: ComponentFilter) -> Self {
        Self {
            filter,
            predicates: Vec::new(),
            cache: SearchCache::default(),
        }
    }

    /// Keep only entities for which `predicate` returns `true`.
    ///
    /// Predicates run in the order they were added, after the archetype
    /// filter, for every call to [`each`](Self::each), [`count`](Self::count),
    /// [`first`](Self::first) and [`collect`](Self::collect). An error from a
    /// predicate ends the search and is returned to the caller.
    ///
    /// ```
    /// # use std::sync::Arc;
    /// # use tessera_ecs::prelude::*;
    /// # use tessera_store::MemoryStore;
    /// #[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
    /// struct Health(u32);
    ///
    /// let mut registry = ComponentRegistry::new();
    /// let health = registry.register::<Health>("health").unwrap();
    /// let mut buffer = CommandBuffer::new(Arc::new(MemoryStore::new()));
    /// buffer.register_components(Arc::new(registry)).unwrap();
    ///
    /// let ids = buffer.create_entities(3, &[health]).unwrap();
    /// buffer.set(ids[1], &Health(0)).unwrap();
    /// buffer.set(ids[0], &Health(10)).unwrap();
    /// buffer.set(ids[2], &Health(7)).unwrap();
    ///
    /// let mut alive = Search::new(ComponentFilter::contains(&[health]))
    ///     .where_(|reader, id| Ok(reader.read::<Health>(id)?.0 > 0));
    /// assert_eq!(alive.collect(&buffer).unwrap(), vec![ids[0], ids[2]]);
    /// ```
    pub fn where_<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&dyn StateReader, EntityId) -> Result<bool> + Send + Sync + 'static,
    {
        self.predicates.push(Arc::new(predicate));
        self
    }

    pub fn filter(&self) -> &ComponentFilter {
        &self.filter
    }

    /// Classify archetypes created since the last evaluation.
    pub fn evaluate(&mut self, reader: &dyn StateReader) -> Result<&[ArchetypeId]> {
        let generation = reader.archetype_generation();
        let total = reader.archetype_count()?;
        if generation != self.cache.generation || total < self.cache.scanned {
            tracing::debug!(
                filter = ?self.filter,
                scanned = self.cache.scanned,
                total,
                "archetype ids were withdrawn, rebuilding search cache"
            );
            self.cache = SearchCache {
                generation,
                ..SearchCache::default()
            };
        }
        if total > self.cache.scanned {
            let found = reader.search_from(&self.filter, self.cache.scanned)?;
            self.cache.matched.extend(found);
            self.cache.scanned = total;
        }
        Ok(&self.cache.matched)
    }

    /// Call `f` for every matching entity in ascending archetype order.
    /// Returning `false` stops the iteration.
    pub fn each(
        &mut self,
        reader: &dyn StateReader,
        mut f: impl FnMut(EntityId) -> bool,
    ) -> Result<()> {
        self.evaluate(reader)?;
        for &archetype in &self.cache.matched {
            for id in reader.entities_for_archetype(archetype)? {
                if !self.accepts(reader, id)? {
                    continue;
                }
                if !f(id) {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn accepts(&self, reader: &dyn StateReader, id: EntityId) -> Result<bool> {
        for predicate in &self.predicates {
            if !predicate(reader, id)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Number of matching entities.
    pub fn count(&mut self, reader: &dyn StateReader) -> Result<usize> {
        if !self.predicates.is_empty() {
            let mut total = 0;
            self.each(reader, |_| {
                total += 1;
                true
            })?;
            return Ok(total);
        }
        self.evaluate(reader)?;
        let mut total = 0;
        for &archetype in &self.cache.matched {
            total += reader.entities_for_archetype(archetype)?.len();
        }
        Ok(total)
    }

    /// First matching entity in iteration order.
    pub fn first(&mut self, reader: &dyn StateReader) -> Result<Option<EntityId>> {
        let mut found = None;
        self.each(reader, |id| {
            found = Some(id);
            false
        })?;
        Ok(found)
    }

    /// Like [`first`](Self::first), for callers that know a match exists.
    ///
    /// # Panics
    ///
    /// Panics if nothing matches or the reader fails.
    pub fn must_first(&mut self, reader: &dyn StateReader) -> EntityId {
        match self.first(reader) {
            Ok(Some(id)) => id,
            Ok(None) => panic!("no entity matches filter {:?}", self.filter),
            Err(e) => panic!("search over filter {:?} failed: {e}", self.filter),
        }
    }

    /// All matching entities in iteration order.
    pub fn collect(&mut self, reader: &dyn StateReader) -> Result<Vec<EntityId>> {
        let mut ids = Vec::new();
        self.each(reader, |id| {
            ids.push(id);
            true
        })?;
        Ok(ids)
    }

    /// Number of archetypes already classified.
    pub fn scanned(&self) -> usize {
        self.cache.scanned
    }

    /// Matching archetypes found so far, in ascending order.
    pub fn matched_archetypes(&self) -> &[ArchetypeId] {
        &self.cache.matched
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tessera_store::MemoryStore;

    use super::*;
    use crate::prelude::*;

    #[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
    struct A(u8);
    #[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
    struct B(u8);
    #[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
    struct C(u8);

    fn setup() -> (CommandBuffer, [ComponentTypeId; 3]) {
        let mut registry = ComponentRegistry::new();
        let a = registry.register::<A>("a").unwrap();
        let b = registry.register::<B>("b").unwrap();
        let c = registry.register::<C>("c").unwrap();
        let mut cb = CommandBuffer::new(Arc::new(MemoryStore::new()));
        cb.register_components(Arc::new(registry)).unwrap();
        (cb, [a, b, c])
    }

    #[test]
    fn each_visits_archetypes_in_id_order() {
        let (mut cb, [a, b, _]) = setup();
        let first = cb.create_entities(2, &[a]).unwrap();
        let second = cb.create_entities(2, &[a, b]).unwrap();

        let mut search = Search::new(ComponentFilter::contains(&[a]));
        let all = search.collect(&cb).unwrap();
        assert_eq!(all, [first, second].concat());
    }

    #[test]
    fn each_stops_early() {
        let (mut cb, [a, _, _]) = setup();
        cb.create_entities(10, &[a]).unwrap();

        let mut seen = 0;
        let mut search = Search::new(ComponentFilter::All);
        search
            .each(&cb, |_| {
                seen += 1;
                seen < 3
            })
            .unwrap();
        assert_eq!(seen, 3);
    }

    #[test]
    fn first_and_must_first() {
        let (mut cb, [a, b, _]) = setup();
        let ids = cb.create_entities(3, &[b]).unwrap();

        let mut search = Search::new(ComponentFilter::contains(&[b]));
        assert_eq!(search.first(&cb).unwrap(), Some(ids[0]));
        assert_eq!(search.must_first(&cb), ids[0]);

        let mut none = Search::new(ComponentFilter::contains(&[a]));
        assert_eq!(none.first(&cb).unwrap(), None);
    }

    #[test]
    #[should_panic(expected = "no entity matches")]
    fn must_first_panics_without_match() {
        let (cb, [_, _, c]) = setup();
        Search::new(ComponentFilter::contains(&[c])).must_first(&cb);
    }

    #[test]
    fn cache_extends_incrementally() {
        let (mut cb, [a, b, c]) = setup();
        cb.create_entity(&[a, b]).unwrap();

        let mut search = Search::new(ComponentFilter::contains(&[a, b]));
        assert_eq!(search.count(&cb).unwrap(), 1);
        assert_eq!(search.scanned(), 1);

        cb.create_entity(&[c]).unwrap();
        cb.create_entity(&[a, b, c]).unwrap();
        assert_eq!(search.count(&cb).unwrap(), 2);
        assert_eq!(search.scanned(), 3);
        assert_eq!(
            search.matched_archetypes(),
            &[ArchetypeId::new(0), ArchetypeId::new(2)]
        );
    }

    #[test]
    fn discarded_archetype_ids_do_not_keep_stale_matches() {
        let (mut cb, [a, b, _]) = setup();
        cb.create_entity(&[a, b]).unwrap();

        let mut with_b = Search::new(ComponentFilter::contains(&[b]));
        assert_eq!(with_b.count(&cb).unwrap(), 1);
        assert_eq!(with_b.matched_archetypes(), &[ArchetypeId::new(0)]);

        cb.discard_pending();
        let e = cb.create_entity(&[a]).unwrap();
        assert_eq!(cb.component_types_for_entity(e).unwrap(), vec![a]);

        assert_eq!(with_b.count(&cb).unwrap(), 0);
        assert!(with_b.matched_archetypes().is_empty());
        assert_eq!(with_b.scanned(), 1);
        assert_eq!(
            Search::new(ComponentFilter::contains(&[a])).collect(&cb).unwrap(),
            vec![e]
        );
    }

    #[test]
    fn durable_matches_survive_a_discarded_tick() {
        let (mut cb, [a, b, _]) = setup();
        cb.create_entity(&[a]).unwrap();
        cb.commit_pending().unwrap();

        let mut with_a = Search::new(ComponentFilter::contains(&[a]));
        assert_eq!(with_a.count(&cb).unwrap(), 1);

        cb.create_entity(&[b]).unwrap();
        cb.discard_pending();
        assert_eq!(with_a.count(&cb).unwrap(), 1);
        assert_eq!(with_a.scanned(), 1);
    }

    #[test]
    fn where_filters_each_count_and_first() {
        let (mut cb, [a, b, _]) = setup();
        let ids = cb.create_entities(4, &[a]).unwrap();
        let other = cb.create_entity(&[a, b]).unwrap();
        for (i, &id) in ids.iter().enumerate() {
            cb.set(id, &A(i as u8)).unwrap();
        }
        cb.set(other, &A(9)).unwrap();

        let mut big = Search::new(ComponentFilter::contains(&[a]))
            .where_(|reader, id| Ok(crate::reader::read_typed::<A>(reader, id)?.0 >= 2));
        assert_eq!(big.count(&cb).unwrap(), 3);
        assert_eq!(big.first(&cb).unwrap(), Some(ids[2]));
        assert_eq!(big.collect(&cb).unwrap(), vec![ids[2], ids[3], other]);

        let mut seen = Vec::new();
        big.each(&cb, |id| {
            seen.push(id);
            true
        })
        .unwrap();
        assert_eq!(seen, vec![ids[2], ids[3], other]);

        let mut odd_and_big = big
            .clone()
            .where_(|reader, id| Ok(crate::reader::read_typed::<A>(reader, id)?.0 % 2 == 1));
        assert_eq!(odd_and_big.collect(&cb).unwrap(), vec![ids[3], other]);

        let mut nothing = Search::new(ComponentFilter::All).where_(|_, _| Ok(false));
        assert_eq!(nothing.count(&cb).unwrap(), 0);
        assert_eq!(nothing.first(&cb).unwrap(), None);
    }

    #[test]
    fn where_error_stops_the_search() {
        let (mut cb, [a, b, _]) = setup();
        cb.create_entity(&[a]).unwrap();
        cb.create_entity(&[b]).unwrap();

        // Entities without `A` make the read fail.
        let mut search = Search::new(ComponentFilter::All)
            .where_(|reader, id| Ok(crate::reader::read_typed::<A>(reader, id)?.0 == 0));
        assert!(matches!(
            search.count(&cb),
            Err(EcsError::ComponentNotOnEntity { .. })
        ));
        assert!(matches!(
            search.collect(&cb),
            Err(EcsError::ComponentNotOnEntity { .. })
        ));
    }

    #[test]
    fn removed_entities_drop_out_of_results() {
        let (mut cb, [a, _, _]) = setup();
        let ids = cb.create_entities(3, &[a]).unwrap();
        cb.remove_entity(ids[1]).unwrap();

        let mut search = Search::new(ComponentFilter::contains(&[a]));
        assert_eq!(search.collect(&cb).unwrap(), vec![ids[0], ids[2]]);
    }
}
