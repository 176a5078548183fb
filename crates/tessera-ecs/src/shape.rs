//! Structural descriptions of component types.
//!
//! [`TypeShape::of`] walks a type's `Deserialize` impl with a deserializer
//! that answers every request with a placeholder and records what was asked
//! for. The result describes the type itself: field names, integer widths,
//! option and sequence element types, and every enum variant's payload.
//! Changing `Option<u64>` to `Option<String>` therefore changes the shape,
//! even though both default to `null`.
//!
//! Enums are explored over several passes, one unexplored variant per enum
//! per pass. A type that recurses through a sequence is cut at the
//! repeated container and recorded as [`SchemaShape::Recursive`].
//!
//! Some `Deserialize` impls reject the placeholders: strings parsed into
//! addresses or ids, non-zero integers, internally tagged or untagged enums,
//! types that recurse through `Option`. Those fall back to
//! [`TypeShape::Sampled`], the JSON shape of the type's default value.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::value::{StrDeserializer, U32Deserializer};
use serde::de::{
    self, DeserializeOwned, DeserializeSeed, EnumAccess, IntoDeserializer, MapAccess, SeqAccess,
    VariantAccess, Visitor,
};
use serde::Serialize;
use serde_json::Value;

/// Upper bound on tracing passes per type.
const MAX_PASSES: usize = 64;

// ---------------------------------------------------------------------------
// Shapes
// ---------------------------------------------------------------------------

/// One node of a traced type.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchemaShape {
    Bool,
    Int { signed: bool, bits: u8 },
    Float { bits: u8 },
    Char,
    String,
    Bytes,
    Unit,
    Option { item: Box<SchemaShape> },
    Seq { item: Box<SchemaShape> },
    Tuple { items: Vec<SchemaShape> },
    Map { key: Box<SchemaShape>, value: Box<SchemaShape> },
    UnitStruct { name: String },
    Newtype { name: String, inner: Box<SchemaShape> },
    TupleStruct { name: String, items: Vec<SchemaShape> },
    Struct { name: String, fields: Vec<(String, SchemaShape)> },
    /// Key into the `enums` table of [`TypeShape::Traced`].
    Enum { key: String },
    /// A container that contains itself.
    Recursive { name: String },
    /// Self-describing data (`serde_json::Value` and the like).
    Any,
}

/// Every variant of one enum, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EnumShape {
    pub name: String,
    /// `None` for a variant no pass managed to reach.
    pub variants: Vec<(String, Option<SchemaShape>)>,
}

/// Structural shape of a JSON value.
///
/// Objects record every field; arrays record their first element (or `any`
/// when empty).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JsonShape {
    Null,
    Bool,
    Number,
    String,
    Array { items: Box<JsonShape> },
    Any,
    Object { fields: BTreeMap<String, JsonShape> },
}

impl JsonShape {
    /// Derive the shape of a JSON value.
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => JsonShape::Null,
            Value::Bool(_) => JsonShape::Bool,
            Value::Number(_) => JsonShape::Number,
            Value::String(_) => JsonShape::String,
            Value::Array(items) => JsonShape::Array {
                items: Box::new(items.first().map_or(JsonShape::Any, JsonShape::of)),
            },
            Value::Object(map) => JsonShape::Object {
                fields: map
                    .iter()
                    .map(|(k, v)| (k.clone(), JsonShape::of(v)))
                    .collect(),
            },
        }
    }
}

/// The full description of a component type.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum TypeShape {
    /// Built from the type's `Deserialize` impl.
    Traced {
        root: SchemaShape,
        enums: BTreeMap<String, EnumShape>,
    },
    /// Built from the JSON of `T::default()`.
    Sampled { shape: JsonShape },
}

impl TypeShape {
    /// Describe `T`, tracing its `Deserialize` impl when possible.
    pub fn of<T: Serialize + DeserializeOwned + Default>() -> Result<Self, String> {
        match trace::<T>() {
            Ok((root, enums)) => Ok(TypeShape::Traced { root, enums }),
            Err(e) => {
                tracing::debug!(
                    type_name = std::any::type_name::<T>(),
                    reason = %e,
                    "falling back to sampled schema"
                );
                let default = serde_json::to_value(T::default()).map_err(|e| e.to_string())?;
                Ok(TypeShape::Sampled {
                    shape: JsonShape::of(&default),
                })
            }
        }
    }
}

fn trace<T: DeserializeOwned>() -> Result<(SchemaShape, BTreeMap<String, EnumShape>), TraceError> {
    let mut state = TraceState::default();
    let mut root = None;
    for pass in 0..MAX_PASSES {
        state.pass = pass;
        state.open();
        T::deserialize(Tracer { state: &mut state })?;
        let shape = state.close_one();
        root.get_or_insert(shape);
        if !state.has_unexplored_variants() {
            break;
        }
    }
    Ok((root.unwrap_or(SchemaShape::Unit), state.enums))
}

// ---------------------------------------------------------------------------
// Trace state
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
enum TraceError {
    #[error("type '{0}' contains itself")]
    Recursive(&'static str),
    #[error("{0}")]
    Custom(String),
}

impl de::Error for TraceError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        TraceError::Custom(msg.to_string())
    }
}

/// Stack lengths to rewind to after a recursive element was cut off.
#[derive(Clone, Copy)]
struct Mark {
    frames: usize,
    top: usize,
    containers: usize,
    variants: usize,
}

#[derive(Default)]
struct TraceState {
    /// Shapes emitted by the calls currently being assembled, innermost last.
    frames: Vec<Vec<SchemaShape>>,
    /// Named structs being traced, outermost first.
    containers: Vec<&'static str>,
    /// `(enum key, variant index)` for enums being traced.
    open_variants: Vec<(String, usize)>,
    enums: BTreeMap<String, EnumShape>,
    pass: usize,
}

impl TraceState {
    fn emit(&mut self, shape: SchemaShape) {
        if let Some(frame) = self.frames.last_mut() {
            frame.push(shape);
        }
    }

    fn open(&mut self) {
        self.frames.push(Vec::new());
    }

    fn close(&mut self) -> Vec<SchemaShape> {
        self.frames.pop().unwrap_or_default()
    }

    fn close_one(&mut self) -> SchemaShape {
        self.close().into_iter().next().unwrap_or(SchemaShape::Unit)
    }

    fn enter(&mut self, name: &'static str) -> Result<(), TraceError> {
        if self.containers.contains(&name) {
            return Err(TraceError::Recursive(name));
        }
        self.containers.push(name);
        Ok(())
    }

    fn leave(&mut self) {
        self.containers.pop();
    }

    fn mark(&self) -> Mark {
        Mark {
            frames: self.frames.len(),
            top: self.frames.last().map_or(0, Vec::len),
            containers: self.containers.len(),
            variants: self.open_variants.len(),
        }
    }

    fn rewind(&mut self, mark: Mark) {
        self.frames.truncate(mark.frames);
        if let Some(top) = self.frames.last_mut() {
            top.truncate(mark.top);
        }
        self.containers.truncate(mark.containers);
        self.open_variants.truncate(mark.variants);
    }

    fn has_unexplored_variants(&self) -> bool {
        self.enums
            .values()
            .any(|e| e.variants.iter().any(|(_, shape)| shape.is_none()))
    }

    /// Pick the variant to trace for enum `key` on this pass.
    ///
    /// Outside of itself an enum takes its first unexplored variant, or
    /// rotates through all of them once every one is known. Nested inside
    /// itself it takes a variant that is not already open, explored ones
    /// first, so recursive enums bottom out.
    fn choose_variant(
        &mut self,
        key: &str,
        name: &'static str,
        variants: &'static [&'static str],
    ) -> Result<usize, TraceError> {
        if variants.is_empty() {
            return Err(TraceError::Custom(format!("enum '{name}' has no variants")));
        }
        let entry = self.enums.entry(key.to_owned()).or_insert_with(|| EnumShape {
            name: name.to_owned(),
            variants: variants.iter().map(|v| ((*v).to_owned(), None)).collect(),
        });
        let open: Vec<usize> = self
            .open_variants
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, idx)| *idx)
            .collect();

        if open.is_empty() {
            return Ok(entry
                .variants
                .iter()
                .position(|(_, shape)| shape.is_none())
                .unwrap_or(self.pass % variants.len()));
        }
        (0..variants.len())
            .filter(|idx| !open.contains(idx))
            .min_by_key(|&idx| entry.variants[idx].1.is_none())
            .ok_or(TraceError::Recursive(name))
    }

    fn record_variant(&mut self, key: &str, idx: usize, shape: SchemaShape) {
        if let Some(slot) = self.enums.get_mut(key).and_then(|e| e.variants.get_mut(idx)) {
            slot.1 = Some(shape);
        }
    }
}

// ---------------------------------------------------------------------------
// Tracer
// ---------------------------------------------------------------------------

struct Tracer<'s> {
    state: &'s mut TraceState,
}

macro_rules! trace_scalar {
    ($method:ident, $visit:ident, $value:expr, $shape:expr) => {
        fn $method<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, TraceError> {
            self.state.emit($shape);
            visitor.$visit($value)
        }
    };
    ($method:ident, $visit:ident, $shape:expr) => {
        fn $method<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, TraceError> {
            self.state.emit($shape);
            visitor.$visit()
        }
    };
}

impl<'s> Tracer<'s> {
    fn fields<'de, V: Visitor<'de>>(
        self,
        fields: &'static [&'static str],
        visitor: V,
    ) -> Result<(V::Value, Vec<(String, SchemaShape)>), TraceError> {
        let state = self.state;
        state.open();
        let value = visitor.visit_map(FieldAccess {
            state: &mut *state,
            fields,
            next: 0,
        })?;
        let shapes = state.close();
        let named = fields
            .iter()
            .map(|f| (*f).to_owned())
            .zip(shapes)
            .collect();
        Ok((value, named))
    }

    fn elements<'de, V: Visitor<'de>>(
        self,
        len: usize,
        visitor: V,
    ) -> Result<(V::Value, Vec<SchemaShape>), TraceError> {
        let state = self.state;
        state.open();
        let value = visitor.visit_seq(ElementAccess {
            state: &mut *state,
            remaining: len,
            cut_recursion: false,
        })?;
        Ok((value, state.close()))
    }
}

impl<'de, 's> de::Deserializer<'de> for Tracer<'s> {
    type Error = TraceError;

    trace_scalar!(deserialize_any, visit_unit, SchemaShape::Any);
    trace_scalar!(deserialize_ignored_any, visit_unit, SchemaShape::Any);
    trace_scalar!(deserialize_bool, visit_bool, false, SchemaShape::Bool);
    trace_scalar!(deserialize_i8, visit_i8, 0, SchemaShape::Int { signed: true, bits: 8 });
    trace_scalar!(deserialize_i16, visit_i16, 0, SchemaShape::Int { signed: true, bits: 16 });
    trace_scalar!(deserialize_i32, visit_i32, 0, SchemaShape::Int { signed: true, bits: 32 });
    trace_scalar!(deserialize_i64, visit_i64, 0, SchemaShape::Int { signed: true, bits: 64 });
    trace_scalar!(deserialize_i128, visit_i128, 0, SchemaShape::Int { signed: true, bits: 128 });
    trace_scalar!(deserialize_u8, visit_u8, 0, SchemaShape::Int { signed: false, bits: 8 });
    trace_scalar!(deserialize_u16, visit_u16, 0, SchemaShape::Int { signed: false, bits: 16 });
    trace_scalar!(deserialize_u32, visit_u32, 0, SchemaShape::Int { signed: false, bits: 32 });
    trace_scalar!(deserialize_u64, visit_u64, 0, SchemaShape::Int { signed: false, bits: 64 });
    trace_scalar!(deserialize_u128, visit_u128, 0, SchemaShape::Int { signed: false, bits: 128 });
    trace_scalar!(deserialize_f32, visit_f32, 0.0, SchemaShape::Float { bits: 32 });
    trace_scalar!(deserialize_f64, visit_f64, 0.0, SchemaShape::Float { bits: 64 });
    trace_scalar!(deserialize_char, visit_char, 'a', SchemaShape::Char);
    trace_scalar!(deserialize_str, visit_str, "", SchemaShape::String);
    trace_scalar!(deserialize_string, visit_string, String::new(), SchemaShape::String);
    trace_scalar!(deserialize_identifier, visit_str, "", SchemaShape::String);
    trace_scalar!(deserialize_bytes, visit_bytes, &[], SchemaShape::Bytes);
    trace_scalar!(deserialize_byte_buf, visit_byte_buf, Vec::new(), SchemaShape::Bytes);
    trace_scalar!(deserialize_unit, visit_unit, SchemaShape::Unit);

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, TraceError> {
        let state = self.state;
        state.open();
        let value = visitor.visit_some(Tracer { state: &mut *state })?;
        let item = state.close_one();
        state.emit(SchemaShape::Option {
            item: Box::new(item),
        });
        Ok(value)
    }

    fn deserialize_unit_struct<V: Visitor<'de>>(
        self,
        name: &'static str,
        visitor: V,
    ) -> Result<V::Value, TraceError> {
        self.state.emit(SchemaShape::UnitStruct {
            name: name.to_owned(),
        });
        visitor.visit_unit()
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        name: &'static str,
        visitor: V,
    ) -> Result<V::Value, TraceError> {
        let state = self.state;
        state.enter(name)?;
        state.open();
        let value = visitor.visit_newtype_struct(Tracer { state: &mut *state })?;
        let inner = state.close_one();
        state.leave();
        state.emit(SchemaShape::Newtype {
            name: name.to_owned(),
            inner: Box::new(inner),
        });
        Ok(value)
    }

    fn deserialize_seq<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, TraceError> {
        let state = self.state;
        state.open();
        let value = visitor.visit_seq(ElementAccess {
            state: &mut *state,
            remaining: 1,
            cut_recursion: true,
        })?;
        let item = state.close().into_iter().next().unwrap_or(SchemaShape::Any);
        state.emit(SchemaShape::Seq {
            item: Box::new(item),
        });
        Ok(value)
    }

    fn deserialize_tuple<V: Visitor<'de>>(
        self,
        len: usize,
        visitor: V,
    ) -> Result<V::Value, TraceError> {
        let state = self.state;
        let (value, items) = Tracer { state: &mut *state }.elements(len, visitor)?;
        state.emit(SchemaShape::Tuple { items });
        Ok(value)
    }

    fn deserialize_tuple_struct<V: Visitor<'de>>(
        self,
        name: &'static str,
        len: usize,
        visitor: V,
    ) -> Result<V::Value, TraceError> {
        let state = self.state;
        state.enter(name)?;
        let (value, items) = Tracer { state: &mut *state }.elements(len, visitor)?;
        state.leave();
        state.emit(SchemaShape::TupleStruct {
            name: name.to_owned(),
            items,
        });
        Ok(value)
    }

    fn deserialize_map<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, TraceError> {
        let state = self.state;
        state.open();
        let value = visitor.visit_map(EntryAccess {
            state: &mut *state,
            remaining: 1,
        })?;
        let mut shapes = state.close().into_iter();
        let key = shapes.next().unwrap_or(SchemaShape::Any);
        let entry = shapes.next().unwrap_or(SchemaShape::Any);
        state.emit(SchemaShape::Map {
            key: Box::new(key),
            value: Box::new(entry),
        });
        Ok(value)
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        name: &'static str,
        fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, TraceError> {
        let state = self.state;
        state.enter(name)?;
        let (value, fields) = Tracer { state: &mut *state }.fields(fields, visitor)?;
        state.leave();
        state.emit(SchemaShape::Struct {
            name: name.to_owned(),
            fields,
        });
        Ok(value)
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        name: &'static str,
        variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, TraceError> {
        let state = self.state;
        let key = format!("{name}({})", variants.join("|"));
        let idx = state.choose_variant(&key, name, variants)?;

        state.open_variants.push((key.clone(), idx));
        state.open();
        let value = visitor.visit_enum(VariantTrace {
            state: &mut *state,
            idx,
            variant: variants[idx],
        })?;
        let payload = state.close_one();
        state.open_variants.pop();

        state.record_variant(&key, idx, payload);
        state.emit(SchemaShape::Enum { key });
        Ok(value)
    }

    fn is_human_readable(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// Access helpers
// ---------------------------------------------------------------------------

/// Sequence elements. Homogeneous sequences yield one element; tuples yield
/// `remaining` of them.
struct ElementAccess<'s> {
    state: &'s mut TraceState,
    remaining: usize,
    /// End the sequence instead of failing when the element contains an
    /// enclosing struct.
    cut_recursion: bool,
}

impl<'de, 's> SeqAccess<'de> for ElementAccess<'s> {
    type Error = TraceError;

    fn next_element_seed<T: DeserializeSeed<'de>>(
        &mut self,
        seed: T,
    ) -> Result<Option<T::Value>, TraceError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        let mark = self.state.mark();
        match seed.deserialize(Tracer {
            state: &mut *self.state,
        }) {
            Ok(value) => Ok(Some(value)),
            Err(TraceError::Recursive(name)) if self.cut_recursion => {
                self.state.rewind(mark);
                self.state.emit(SchemaShape::Recursive {
                    name: name.to_owned(),
                });
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.remaining)
    }
}

/// One map entry.
struct EntryAccess<'s> {
    state: &'s mut TraceState,
    remaining: usize,
}

impl<'de, 's> MapAccess<'de> for EntryAccess<'s> {
    type Error = TraceError;

    fn next_key_seed<K: DeserializeSeed<'de>>(
        &mut self,
        seed: K,
    ) -> Result<Option<K::Value>, TraceError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        seed.deserialize(Tracer {
            state: &mut *self.state,
        })
        .map(Some)
    }

    fn next_value_seed<V: DeserializeSeed<'de>>(&mut self, seed: V) -> Result<V::Value, TraceError> {
        seed.deserialize(Tracer {
            state: &mut *self.state,
        })
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.remaining)
    }
}

/// Struct fields, keyed by their declared names.
struct FieldAccess<'s> {
    state: &'s mut TraceState,
    fields: &'static [&'static str],
    next: usize,
}

impl<'de, 's> MapAccess<'de> for FieldAccess<'s> {
    type Error = TraceError;

    fn next_key_seed<K: DeserializeSeed<'de>>(
        &mut self,
        seed: K,
    ) -> Result<Option<K::Value>, TraceError> {
        match self.fields.get(self.next) {
            Some(&field) => {
                self.next += 1;
                let key: StrDeserializer<'static, TraceError> = field.into_deserializer();
                seed.deserialize(key).map(Some)
            }
            None => Ok(None),
        }
    }

    fn next_value_seed<V: DeserializeSeed<'de>>(&mut self, seed: V) -> Result<V::Value, TraceError> {
        seed.deserialize(Tracer {
            state: &mut *self.state,
        })
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.fields.len() - self.next)
    }
}

/// The variant picked for one enum on this pass.
struct VariantTrace<'s> {
    state: &'s mut TraceState,
    idx: usize,
    variant: &'static str,
}

impl<'de, 's> EnumAccess<'de> for VariantTrace<'s> {
    type Error = TraceError;
    type Variant = Self;

    fn variant_seed<V: DeserializeSeed<'de>>(self, seed: V) -> Result<(V::Value, Self), TraceError> {
        let index: U32Deserializer<TraceError> = (self.idx as u32).into_deserializer();
        let value = seed.deserialize(index)?;
        Ok((value, self))
    }
}

impl<'de, 's> VariantAccess<'de> for VariantTrace<'s> {
    type Error = TraceError;

    fn unit_variant(self) -> Result<(), TraceError> {
        self.state.emit(SchemaShape::Unit);
        Ok(())
    }

    fn newtype_variant_seed<T: DeserializeSeed<'de>>(self, seed: T) -> Result<T::Value, TraceError> {
        seed.deserialize(Tracer { state: self.state })
    }

    fn tuple_variant<V: Visitor<'de>>(self, len: usize, visitor: V) -> Result<V::Value, TraceError> {
        let state = self.state;
        let (value, items) = Tracer { state: &mut *state }.elements(len, visitor)?;
        state.emit(SchemaShape::Tuple { items });
        Ok(value)
    }

    fn struct_variant<V: Visitor<'de>>(
        self,
        fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, TraceError> {
        let state = self.state;
        let (value, fields) = Tracer { state: &mut *state }.fields(fields, visitor)?;
        state.emit(SchemaShape::Struct {
            name: self.variant.to_owned(),
            fields,
        });
        Ok(value)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
