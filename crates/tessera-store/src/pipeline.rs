//! Atomic multi-operation commits.
//!
//! A [`Pipeline`] is an ordered batch of [`Op`]s handed to
//! [`KvStore::commit`](crate::KvStore::commit). Until it is committed the
//! pipeline also acts as an overlay: [`Pipeline::staged`] and
//! [`Pipeline::get_through`] give read-after-write visibility for keys that
//! were already written earlier in the same batch.

use std::collections::BTreeMap;

use crate::{KvStore, Result};

/// One write in a [`Pipeline`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// Store `value` under `key`.
    Set { key: String, value: Vec<u8> },
    /// Remove `key`.
    Delete { key: String },
}

impl Op {
    /// The key this operation touches.
    pub fn key(&self) -> &str {
        match self {
            Op::Set { key, .. } | Op::Delete { key } => key,
        }
    }
}

/// An ordered batch of writes committed atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pipeline {
    ops: Vec<Op>,
}

impl Pipeline {
    /// Create an empty pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a write.
    pub fn set(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.ops.push(Op::Set {
            key: key.into(),
            value,
        });
    }

    /// Queue a JSON-encoded write.
    pub fn set_json<T: serde::Serialize + ?Sized>(
        &mut self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<()> {
        let key = key.into();
        let bytes = crate::encode_json(&key, value)?;
        self.set(key, bytes);
        Ok(())
    }

    /// Queue a delete.
    pub fn delete(&mut self, key: impl Into<String>) {
        self.ops.push(Op::Delete { key: key.into() });
    }

    /// Append every operation of `other` after the ones already queued.
    pub fn extend(&mut self, other: Pipeline) {
        self.ops.extend(other.ops);
    }

    /// The queued operations in commit order.
    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether nothing has been queued.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Whether any operation touches `key`.
    pub fn touches(&self, key: &str) -> bool {
        self.ops.iter().any(|op| op.key() == key)
    }

    /// The staged view of `key`.
    ///
    /// - `None`: the pipeline does not touch `key`.
    /// - `Some(None)`: the last operation on `key` deletes it.
    /// - `Some(Some(bytes))`: the last operation on `key` writes `bytes`.
    pub fn staged(&self, key: &str) -> Option<Option<&[u8]>> {
        self.ops.iter().rev().find(|op| op.key() == key).map(|op| match op {
            Op::Set { value, .. } => Some(value.as_slice()),
            Op::Delete { .. } => None,
        })
    }

    /// Read `key` as it would look after this pipeline commits.
    pub fn get_through(&self, store: &dyn KvStore, key: &str) -> Result<Option<Vec<u8>>> {
        match self.staged(key) {
            Some(staged) => Ok(staged.map(<[u8]>::to_vec)),
            None => store.get(key),
        }
    }

    /// Apply all operations to an in-memory map, in order.
    pub(crate) fn apply_to(self, map: &mut BTreeMap<String, Vec<u8>>) {
        for op in self.ops {
            match op {
                Op::Set { key, value } => {
                    map.insert(key, value);
                }
                Op::Delete { key } => {
                    map.remove(&key);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;

    #[test]
    fn last_operation_on_a_key_wins() {
        let mut pipe = Pipeline::new();
        pipe.set("a", vec![1]);
        pipe.delete("a");
        assert_eq!(pipe.staged("a"), Some(None));

        pipe.set("a", vec![2]);
        assert_eq!(pipe.staged("a"), Some(Some(&[2u8][..])));
        assert_eq!(pipe.staged("b"), None);
    }

    #[test]
    fn get_through_falls_back_to_store() {
        let store = MemoryStore::new();
        store.set("durable", vec![7]).unwrap();
        store.set("shadowed", vec![8]).unwrap();

        let mut pipe = Pipeline::new();
        pipe.delete("shadowed");
        pipe.set("fresh", vec![9]);

        assert_eq!(pipe.get_through(&store, "durable").unwrap(), Some(vec![7]));
        assert_eq!(pipe.get_through(&store, "shadowed").unwrap(), None);
        assert_eq!(pipe.get_through(&store, "fresh").unwrap(), Some(vec![9]));
    }

    #[test]
    fn apply_preserves_order() {
        let mut map = BTreeMap::new();
        map.insert("gone".to_owned(), vec![0]);

        let mut pipe = Pipeline::new();
        pipe.set("k", vec![1]);
        pipe.set("k", vec![2]);
        pipe.delete("gone");
        pipe.apply_to(&mut map);

        assert_eq!(map.get("k"), Some(&vec![2]));
        assert!(!map.contains_key("gone"));
    }

    #[test]
    fn extend_appends_after_existing_ops() {
        let mut first = Pipeline::new();
        first.set("x", vec![1]);
        let mut second = Pipeline::new();
        second.set("x", vec![2]);
        second.delete("y");

        first.extend(second);
        assert_eq!(first.len(), 3);
        assert!(first.touches("y"));
        assert_eq!(first.staged("x"), Some(Some(&[2u8][..])));
    }
}
