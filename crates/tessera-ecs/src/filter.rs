//! Component filters used by [`Search`](crate::search::Search).
//!
//! A filter is a predicate over one archetype's component set. Because an
//! archetype's set never changes, a filter's verdict for an archetype is
//! final, which is what lets searches cache their results.

use crate::component::ComponentTypeId;

/// Predicate over an archetype's sorted component set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentFilter {
    /// Matches every archetype.
    All,
    /// The archetype has at least these components.
    Contains(Vec<ComponentTypeId>),
    /// The archetype has exactly these components.
    Exact(Vec<ComponentTypeId>),
    /// Inverts the inner filter.
    Not(Box<ComponentFilter>),
    /// Every inner filter matches. An empty list matches everything.
    And(Vec<ComponentFilter>),
    /// Any inner filter matches. An empty list matches nothing.
    Or(Vec<ComponentFilter>),
}

impl ComponentFilter {
    pub fn contains(components: &[ComponentTypeId]) -> Self {
        ComponentFilter::Contains(components.to_vec())
    }

    pub fn exact(components: &[ComponentTypeId]) -> Self {
        ComponentFilter::Exact(components.to_vec())
    }

    pub fn not(inner: ComponentFilter) -> Self {
        ComponentFilter::Not(Box::new(inner))
    }

    /// Whether an archetype with `components` (sorted) passes the filter.
    pub fn matches(&self, components: &[ComponentTypeId]) -> bool {
        match self {
            ComponentFilter::All => true,
            ComponentFilter::Contains(wanted) => {
                wanted.iter().all(|c| components.binary_search(c).is_ok())
            }
            ComponentFilter::Exact(wanted) => {
                let mut wanted = wanted.clone();
                wanted.sort_unstable();
                wanted.dedup();
                wanted == components
            }
            ComponentFilter::Not(inner) => !inner.matches(components),
            ComponentFilter::And(filters) => filters.iter().all(|f| f.matches(components)),
            ComponentFilter::Or(filters) => filters.iter().any(|f| f.matches(components)),
        }
    }
}
