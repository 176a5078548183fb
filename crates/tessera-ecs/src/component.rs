//! Component type registration and metadata.
//!
//! Every component type must be registered in a [`ComponentRegistry`] before
//! the command buffer can store it. Registration assigns a
//! [`ComponentTypeId`] (starting at 1, in registration order) and builds a
//! [`ComponentVtable`]: monomorphized encode/decode/default functions that
//! let the storage path handle any component as a `serde_json::Value`
//! without downcasting.
//!
//! Registration also describes the type's structure (see
//! [`TypeShape`](crate::shape::TypeShape)) and fingerprints it together with
//! the Rust type name. [`ComponentRegistry::sync_schemas`] compares those
//! descriptors, and the id each name was saved under, with what an earlier
//! process persisted and refuses to start when they differ.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tessera_store::{KvStore, Pipeline, SchemaStorage};

use crate::shape::TypeShape;
use crate::EcsError;

// ---------------------------------------------------------------------------
// Component
// ---------------------------------------------------------------------------

/// Bound satisfied by every storable component type.
///
/// The default value is what an entity reports for a component that was
/// never explicitly set.
pub trait Component: Serialize + DeserializeOwned + Default + Clone + Send + Sync + 'static {}

impl<T> Component for T where T: Serialize + DeserializeOwned + Default + Clone + Send + Sync + 'static
{}

// ---------------------------------------------------------------------------
// ComponentTypeId
// ---------------------------------------------------------------------------

/// Small integer identifying a registered component type.
#[derive(
    Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct ComponentTypeId(u32);

impl ComponentTypeId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for ComponentTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentTypeId({})", self.0)
    }
}

impl fmt::Display for ComponentTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// ComponentVtable -- type-erased operations for a component type
// ---------------------------------------------------------------------------

/// Function pointers for encoding, decoding and defaulting one component
/// type.
///
/// Created via [`ComponentVtable::new::<T>()`]. Every function round-trips
/// through `T`, so a value that passes through the vtable is known to have
/// the shape of the registered type.
#[derive(Clone, Copy)]
pub struct ComponentVtable {
    decode_fn: fn(&[u8]) -> Result<Value, String>,
    validate_fn: fn(&Value) -> Result<(), String>,
    default_fn: fn() -> Result<Value, String>,
}

impl fmt::Debug for ComponentVtable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentVtable").finish_non_exhaustive()
    }
}

impl ComponentVtable {
    /// Create a vtable for a concrete component type `T`.
    pub fn new<T: Component>() -> Self {
        fn decode_impl<T: Component>(bytes: &[u8]) -> Result<Value, String> {
            let typed: T = serde_json::from_slice(bytes).map_err(|e| e.to_string())?;
            serde_json::to_value(typed).map_err(|e| e.to_string())
        }

        fn validate_impl<T: Component>(value: &Value) -> Result<(), String> {
            T::deserialize(value).map(|_| ()).map_err(|e| e.to_string())
        }

        fn default_impl<T: Component>() -> Result<Value, String> {
            serde_json::to_value(T::default()).map_err(|e| e.to_string())
        }

        Self {
            decode_fn: decode_impl::<T>,
            validate_fn: validate_impl::<T>,
            default_fn: default_impl::<T>,
        }
    }

    /// Decode stored bytes into a value of the registered shape.
    pub fn decode(&self, bytes: &[u8]) -> Result<Value, String> {
        (self.decode_fn)(bytes)
    }

    /// Check that `value` deserializes as the registered type.
    pub fn validate(&self, value: &Value) -> Result<(), String> {
        (self.validate_fn)(value)
    }

    /// The registered type's default value.
    pub fn default_value(&self) -> Result<Value, String> {
        (self.default_fn)()
    }

    /// Encode a value for storage.
    pub fn encode(&self, value: &Value) -> Result<Vec<u8>, String> {
        serde_json::to_vec(value).map_err(|e| e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Schema descriptors
// ---------------------------------------------------------------------------

/// What gets persisted under `SCHEMA:<name>`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ComponentSchema {
    /// `std::any::type_name` of the registered type.
    pub type_name: String,
    /// BLAKE3 hex digest of the canonical encoding of `type_name` and `shape`.
    pub fingerprint: String,
    pub shape: TypeShape,
}

impl ComponentSchema {
    /// Describe the compiled type `T`.
    pub fn describe<T: Component>() -> Result<Self, String> {
        let type_name = std::any::type_name::<T>().to_owned();
        let shape = TypeShape::of::<T>()?;
        // Struct fields keep declaration order and enum tables are BTreeMaps,
        // so the encoding is canonical.
        let canonical = serde_json::to_vec(&(&type_name, &shape)).map_err(|e| e.to_string())?;
        Ok(Self {
            fingerprint: blake3::hash(&canonical).to_hex().to_string(),
            type_name,
            shape,
        })
    }
}

// ---------------------------------------------------------------------------
// ComponentInfo
// ---------------------------------------------------------------------------

/// Metadata about a registered component type.
#[derive(Debug, Clone)]
pub struct ComponentInfo {
    /// Unique ID assigned at registration time.
    pub id: ComponentTypeId,
    /// Name supplied by the caller; also the schema storage key.
    pub name: String,
    /// Rust `TypeId` for typed lookups.
    pub type_id: TypeId,
    pub vtable: ComponentVtable,
    pub schema: ComponentSchema,
}

// ---------------------------------------------------------------------------
// ComponentRegistry
// ---------------------------------------------------------------------------

/// Registry mapping Rust types and names to [`ComponentTypeId`]s.
///
/// Owned by one engine instance and shared with its command buffer behind an
/// `Arc` once registration is finished.
#[derive(Debug, Default)]
pub struct ComponentRegistry {
    by_type: HashMap<TypeId, ComponentTypeId>,
    by_name: HashMap<String, ComponentTypeId>,
    /// Indexed by `ComponentTypeId - 1`.
    infos: Vec<ComponentInfo>,
}

impl ComponentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component type under the given `name`.
    ///
    /// Both the name and the Rust type must be new to this registry.
    pub fn register<T: Component>(&mut self, name: &str) -> Result<ComponentTypeId, EcsError> {
        if self.by_name.contains_key(name) {
            return Err(EcsError::DuplicateComponentName {
                name: name.to_owned(),
            });
        }
        let rust_type_id = TypeId::of::<T>();
        if let Some(existing) = self.by_type.get(&rust_type_id) {
            return Err(EcsError::DuplicateComponentType {
                name: name.to_owned(),
                existing: self.infos[existing.0 as usize - 1].name.clone(),
            });
        }

        let vtable = ComponentVtable::new::<T>();
        let schema = ComponentSchema::describe::<T>().map_err(|details| EcsError::ComponentCodec {
            component: name.to_owned(),
            details,
        })?;

        let id = ComponentTypeId(self.infos.len() as u32 + 1);
        self.infos.push(ComponentInfo {
            id,
            name: name.to_owned(),
            type_id: rust_type_id,
            vtable,
            schema,
        });
        self.by_type.insert(rust_type_id, id);
        self.by_name.insert(name.to_owned(), id);
        Ok(id)
    }

    /// Look up a component type by its Rust type.
    pub fn lookup<T: 'static>(&self) -> Option<ComponentTypeId> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    /// Like [`lookup`](Self::lookup) but reports unregistered types as an error.
    pub fn require<T: 'static>(&self) -> Result<ComponentTypeId, EcsError> {
        self.lookup::<T>()
            .ok_or_else(|| EcsError::ComponentNotRegistered {
                name: std::any::type_name::<T>().to_owned(),
                registered: self.registered_names().join(", "),
            })
    }

    /// Look up a component type by its registered name.
    pub fn lookup_by_name(&self, name: &str) -> Option<ComponentTypeId> {
        self.by_name.get(name).copied()
    }

    /// Metadata for a registered id.
    pub fn info(&self, id: ComponentTypeId) -> Option<&ComponentInfo> {
        (id.0 as usize)
            .checked_sub(1)
            .and_then(|idx| self.infos.get(idx))
    }

    /// Like [`info`](Self::info) but reports unknown ids as an error.
    pub fn require_info(&self, id: ComponentTypeId) -> Result<&ComponentInfo, EcsError> {
        self.info(id).ok_or(EcsError::UnknownComponentId { id })
    }

    /// Display name for `id`, falling back to the raw number.
    pub fn name_of(&self, id: ComponentTypeId) -> String {
        self.info(id)
            .map_or_else(|| format!("#{}", id.0), |info| info.name.clone())
    }

    /// All registrations in id order.
    pub fn iter(&self) -> impl Iterator<Item = &ComponentInfo> {
        self.infos.iter()
    }

    /// Total number of registered component types.
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    /// Whether any component types have been registered.
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Returns the names of all registered component types, sorted.
    pub fn registered_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.by_name.keys().map(|s| s.as_str()).collect();
        names.sort();
        names
    }

    /// Compare every registration with its persisted schema and id, then
    /// persist whatever is new.
    ///
    /// Component values and archetypes are stored by numeric id, so a name
    /// must keep the id it was first saved under and no id may change hands.
    /// Nothing is written unless every component passes; everything new is
    /// written in one commit.
    pub fn sync_schemas(&self, store: &dyn KvStore) -> Result<(), EcsError> {
        let schemas = SchemaStorage::new(store);
        let mut index = schemas.id_index()?;
        let stored_ids: HashMap<String, u32> =
            index.iter().map(|(id, name)| (name.clone(), *id)).collect();
        let mut pipe = Pipeline::new();
        let mut index_changed = false;

        for info in &self.infos {
            if let Some(&stored) = stored_ids.get(&info.name) {
                if stored != info.id.get() {
                    return Err(EcsError::ComponentIdMismatch {
                        name: info.name.clone(),
                        registered: info.id,
                        stored: ComponentTypeId(stored),
                    });
                }
            }
            match index.get(&info.id.get()) {
                Some(owner) if *owner != info.name => {
                    return Err(EcsError::ComponentIdTaken {
                        name: info.name.clone(),
                        id: info.id,
                        owner: owner.clone(),
                    });
                }
                Some(_) => {}
                None => {
                    index.insert(info.id.get(), info.name.clone());
                    index_changed = true;
                }
            }

            match schemas.get_schema(&info.name)? {
                Some(stored) => {
                    let stored: ComponentSchema =
                        tessera_store::decode_json(&info.name, &stored)?;
                    if stored.fingerprint != info.schema.fingerprint {
                        return Err(EcsError::SchemaMismatch {
                            name: info.name.clone(),
                        });
                    }
                }
                None => {
                    let encoded = serde_json::to_vec(&info.schema).map_err(|e| {
                        EcsError::ComponentCodec {
                            component: info.name.clone(),
                            details: e.to_string(),
                        }
                    })?;
                    SchemaStorage::stage_schema(&mut pipe, &info.name, encoded);
                }
            }
        }

        if index_changed {
            SchemaStorage::stage_id_index(&mut pipe, &index)?;
        }
        if !pipe.is_empty() {
            store.commit(pipe)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ComponentBundle
// ---------------------------------------------------------------------------

/// A set of initial component values for creating entities.
///
/// ```
/// use tessera_ecs::prelude::*;
///
/// #[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
/// struct Health { hp: u32 }
///
/// let mut registry = ComponentRegistry::new();
/// registry.register::<Health>("health").unwrap();
///
/// let mut bundle = ComponentBundle::new();
/// bundle.add(&registry, Health { hp: 30 }).unwrap();
/// assert_eq!(bundle.component_ids().len(), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct ComponentBundle {
    values: Vec<(ComponentTypeId, Value)>,
}

impl ComponentBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a typed component value.
    pub fn add<T: Component>(
        &mut self,
        registry: &ComponentRegistry,
        value: T,
    ) -> Result<&mut Self, EcsError> {
        let id = registry.require::<T>()?;
        let json = serde_json::to_value(value).map_err(|e| EcsError::ComponentCodec {
            component: registry.name_of(id),
            details: e.to_string(),
        })?;
        self.values.push((id, json));
        Ok(self)
    }

    /// Add an already encoded value.
    pub fn add_raw(&mut self, id: ComponentTypeId, value: Value) -> &mut Self {
        self.values.push((id, value));
        self
    }

    /// Component types in insertion order.
    pub fn component_ids(&self) -> Vec<ComponentTypeId> {
        self.values.iter().map(|(id, _)| *id).collect()
    }

    pub fn values(&self) -> &[(ComponentTypeId, Value)] {
        &self.values
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
