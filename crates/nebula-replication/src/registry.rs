//! Component type registry: maps stable string tags to type-erased
//! operations over a Bevy [`World`].
//!
//! Replication and prediction never name concrete component types. Each
//! registered type contributes a [`ComponentDescriptor`] of function
//! pointers so that serialization, deep cloning, restoring and
//! tolerance-aware comparison stay pluggable per component.

use std::any::{Any, TypeId};
use std::collections::BTreeMap;
use std::fmt;

use bevy_ecs::prelude::*;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::ReplicationError;

// ---------------------------------------------------------------------------
// Tags and markers
// ---------------------------------------------------------------------------

/// A tag identifying a component type in serialized messages.
pub type ComponentTypeTag = String;

/// Marker for entities the server replicates. Entities without it are
/// invisible to the [`ReplicationManager`](crate::ReplicationManager).
#[derive(Component, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Replicated;

// ---------------------------------------------------------------------------
// ComponentValue
// ---------------------------------------------------------------------------

trait ErasedValue: Any + Send + Sync {
    fn clone_boxed(&self) -> Box<dyn ErasedValue>;
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any + Clone + Send + Sync> ErasedValue for T {
    fn clone_boxed(&self) -> Box<dyn ErasedValue> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// An owned, type-erased component value. Cloning is always deep: a
/// `ComponentValue` never aliases storage inside a [`World`].
pub struct ComponentValue {
    inner: Box<dyn ErasedValue>,
}

impl ComponentValue {
    /// Wraps a concrete value.
    pub fn new<T: Any + Clone + Send + Sync>(value: T) -> Self {
        Self {
            inner: Box::new(value),
        }
    }

    /// Returns the concrete value if it is a `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.as_any().downcast_ref::<T>()
    }

    /// [`TypeId`] of the wrapped value.
    pub fn value_type_id(&self) -> TypeId {
        Any::type_id(self.inner.as_any())
    }
}

impl Clone for ComponentValue {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone_boxed(),
        }
    }
}

impl fmt::Debug for ComponentValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentValue")
            .field("type_id", &self.value_type_id())
            .finish_non_exhaustive()
    }
}

/// Full component state of one entity, keyed by component tag.
pub type EntityState = BTreeMap<ComponentTypeTag, ComponentValue>;

// ---------------------------------------------------------------------------
// Divergence
// ---------------------------------------------------------------------------

/// Returns `true` if `predicted` and `server` differ. Numeric fields are
/// compared with an absolute tolerance of `threshold`; every other field
/// must match exactly. Values that fail to serialize count as divergent.
pub fn values_diverge<T: Serialize>(predicted: &T, server: &T, threshold: f64) -> bool {
    match (serde_json::to_value(predicted), serde_json::to_value(server)) {
        (Ok(a), Ok(b)) => json_diverges(&a, &b, threshold),
        _ => true,
    }
}

fn json_diverges(a: &Value, b: &Value, threshold: f64) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => (x - y).abs() > threshold,
            _ => x != y,
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() != ys.len()
                || xs
                    .iter()
                    .zip(ys)
                    .any(|(x, y)| json_diverges(x, y, threshold))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() != ys.len()
                || xs
                    .iter()
                    .any(|(k, x)| ys.get(k).is_none_or(|y| json_diverges(x, y, threshold)))
        }
        _ => a != b,
    }
}

// ---------------------------------------------------------------------------
// ComponentDescriptor
// ---------------------------------------------------------------------------

/// Type-erased operations for one registered component type.
pub struct ComponentDescriptor {
    /// Rust [`TypeId`] of the component.
    pub type_id: TypeId,
    /// Stable tag used on the wire and in snapshots (e.g. `"Position"`).
    pub tag: &'static str,
    /// Serialize the component from `entity`. `None` if absent.
    pub serializer: fn(&World, Entity) -> Option<Vec<u8>>,
    /// Decode bytes and insert (or overwrite) the component on `entity`.
    pub deserializer: fn(&mut World, Entity, &[u8]) -> Result<(), ReplicationError>,
    /// Remove the component from `entity` if present.
    pub remover: fn(&mut World, Entity),
    /// Deep-clone the component out of the world.
    pub snapshot: fn(&World, Entity) -> Option<ComponentValue>,
    /// Write a value back onto `entity`. Returns `false` on a type mismatch
    /// or a missing entity.
    pub restore: fn(&mut World, Entity, &ComponentValue) -> bool,
    /// Decode bytes into a detached value.
    pub decode: fn(&[u8]) -> Result<ComponentValue, ReplicationError>,
    /// Encode a detached value.
    pub encode: fn(&ComponentValue) -> Option<Vec<u8>>,
    /// Tolerance-aware comparison of two detached values.
    pub diverges: fn(&ComponentValue, &ComponentValue, f64) -> bool,
}

// ---------------------------------------------------------------------------
// ComponentRegistry
// ---------------------------------------------------------------------------

/// Defines which components participate in replication and prediction.
/// Components are registered at startup; unregistered components are
/// ignored everywhere.
#[derive(Default)]
pub struct ComponentRegistry {
    descriptors: Vec<ComponentDescriptor>,
}

impl ComponentRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            descriptors: Vec::new(),
        }
    }

    /// Registers `T` under `tag`. Registering the same tag twice replaces
    /// the earlier descriptor.
    pub fn register<T>(&mut self, tag: &'static str)
    where
        T: Component + Serialize + DeserializeOwned + Clone,
    {
        let descriptor = ComponentDescriptor {
            type_id: TypeId::of::<T>(),
            tag,
            serializer: |world, entity| {
                world
                    .get::<T>(entity)
                    .and_then(|c| postcard::to_allocvec(c).ok())
            },
            deserializer: |world, entity, bytes| {
                let value = postcard::from_bytes::<T>(bytes)
                    .map_err(|e| ReplicationError::Decode(e.to_string()))?;
                let mut entity_mut = world
                    .get_entity_mut(entity)
                    .map_err(|_| ReplicationError::MissingEntity(entity))?;
                entity_mut.insert(value);
                Ok(())
            },
            remover: |world, entity| {
                if let Ok(mut entity_mut) = world.get_entity_mut(entity) {
                    entity_mut.remove::<T>();
                }
            },
            snapshot: |world, entity| world.get::<T>(entity).cloned().map(ComponentValue::new),
            restore: |world, entity, value| {
                let Some(value) = value.downcast_ref::<T>() else {
                    return false;
                };
                match world.get_entity_mut(entity) {
                    Ok(mut entity_mut) => {
                        entity_mut.insert(value.clone());
                        true
                    }
                    Err(_) => false,
                }
            },
            decode: |bytes| {
                postcard::from_bytes::<T>(bytes)
                    .map(ComponentValue::new)
                    .map_err(|e| ReplicationError::Decode(e.to_string()))
            },
            encode: |value| {
                value
                    .downcast_ref::<T>()
                    .and_then(|v| postcard::to_allocvec(v).ok())
            },
            diverges: |a, b, threshold| match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
                (Some(a), Some(b)) => values_diverge(a, b, threshold),
                _ => true,
            },
        };
        self.descriptors.retain(|d| d.tag != tag);
        self.descriptors.push(descriptor);
    }

    /// Returns the registered descriptors in registration order.
    pub fn descriptors(&self) -> &[ComponentDescriptor] {
        &self.descriptors
    }

    /// Looks up a descriptor by tag.
    pub fn get(&self, tag: &str) -> Option<&ComponentDescriptor> {
        self.descriptors.iter().find(|d| d.tag == tag)
    }

    /// Looks up a descriptor by tag, failing on unknown tags.
    pub fn require(&self, tag: &str) -> Result<&ComponentDescriptor, ReplicationError> {
        self.get(tag)
            .ok_or_else(|| ReplicationError::UnknownComponent(tag.to_string()))
    }

    /// Serializes every registered component present on `entity`, in
    /// registration order.
    pub fn serialize_entity(
        &self,
        world: &World,
        entity: Entity,
    ) -> Vec<(ComponentTypeTag, Vec<u8>)> {
        self.descriptors
            .iter()
            .filter_map(|d| (d.serializer)(world, entity).map(|bytes| (d.tag.to_string(), bytes)))
            .collect()
    }

    /// Deep-clones every registered component present on `entity`.
    pub fn snapshot_entity(&self, world: &World, entity: Entity) -> EntityState {
        self.descriptors
            .iter()
            .filter_map(|d| (d.snapshot)(world, entity).map(|v| (d.tag.to_string(), v)))
            .collect()
    }

    /// Writes every value of `state` back onto `entity`. Unknown tags and
    /// mismatched values are skipped; returns how many were written.
    pub fn restore_entity(&self, world: &mut World, entity: Entity, state: &EntityState) -> usize {
        let mut written = 0;
        for (tag, value) in state {
            match self.get(tag) {
                Some(desc) if (desc.restore)(world, entity, value) => written += 1,
                Some(_) => tracing::warn!("could not restore {tag} on {entity:?}"),
                None => tracing::warn!("restore skipped unregistered component {tag}"),
            }
        }
        written
    }

    /// Decodes a wire component list into detached values.
    pub fn decode_state(
        &self,
        components: &[(ComponentTypeTag, Vec<u8>)],
    ) -> Result<EntityState, ReplicationError> {
        components
            .iter()
            .map(|(tag, bytes)| Ok((tag.clone(), (self.require(tag)?.decode)(bytes)?)))
            .collect()
    }

    /// Compares one component value pair through its descriptor. Unknown
    /// tags compare as divergent.
    pub fn diverges(
        &self,
        tag: &str,
        predicted: &ComponentValue,
        server: &ComponentValue,
        threshold: f64,
    ) -> bool {
        self.get(tag)
            .is_none_or(|d| (d.diverges)(predicted, server, threshold))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
