//! Persisted component schemas.
//!
//! Each registered component type stores its schema descriptor under
//! `SCHEMA:<name>` so a later process can detect that the compiled type no
//! longer matches what was written to the database. The numeric id every
//! component was stored under lives in one index document, `SCHEMA-INDEX`,
//! mapping id to name.
//!
//! Writes are staged into a [`Pipeline`] and committed together, so a
//! failed startup never leaves half of the registrations persisted.

use std::collections::BTreeMap;

use crate::{get_json, KvStore, Pipeline, Result};

/// Key prefix for schema entries.
pub const SCHEMA_PREFIX: &str = "SCHEMA:";

/// Key of the id -> name index.
pub const SCHEMA_INDEX: &str = "SCHEMA-INDEX";

/// Key under which the schema for `name` is stored.
pub fn schema_key(name: &str) -> String {
    format!("{SCHEMA_PREFIX}{name}")
}

/// Read access to persisted schemas over any [`KvStore`], plus staging
/// helpers for writing them atomically.
pub struct SchemaStorage<'a> {
    store: &'a dyn KvStore,
}

impl<'a> SchemaStorage<'a> {
    pub fn new(store: &'a dyn KvStore) -> Self {
        Self { store }
    }

    /// The stored schema for `name`, or `None` if it was never written.
    pub fn get_schema(&self, name: &str) -> Result<Option<Vec<u8>>> {
        self.store.get(&schema_key(name))
    }

    /// The persisted id -> name index; empty for a fresh store.
    pub fn id_index(&self) -> Result<BTreeMap<u32, String>> {
        Ok(get_json(self.store, SCHEMA_INDEX)?.unwrap_or_default())
    }

    /// Queue a schema write on `pipe`.
    pub fn stage_schema(pipe: &mut Pipeline, name: &str, schema: Vec<u8>) {
        pipe.set(schema_key(name), schema);
    }

    /// Queue an index write on `pipe`.
    pub fn stage_id_index(pipe: &mut Pipeline, index: &BTreeMap<u32, String>) -> Result<()> {
        pipe.set_json(SCHEMA_INDEX, index)
    }
}
