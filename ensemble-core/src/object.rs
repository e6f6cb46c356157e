//! Replicated object model.
//!
//! Objects live in a generational arena. Handles are `(index, generation)`
//! pairs, so a handle to a destroyed and reused slot is simply invalid
//! instead of dangling.
//!
//! ```text
//! ObjectWorld
//!   ├─ ObjectArena<Box<dyn SyncObject>>   slots + free list + path index
//!   └─ Box<dyn ObjectFactory>             begin_create ─► finish_create
//! ```
//!
//! The collaboration layer never looks inside an object. It only moves
//! bytes in and out through [`SyncObject`].

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

use crate::transaction::{ObjectId, PropertyDelta};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SerializationError {
    #[error("Unknown property: {0}")]
    UnknownProperty(String),
    #[error("Malformed object data: {0}")]
    Malformed(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApplyError {
    #[error("Object not found: {0}")]
    ObjectNotFound(String),
    #[error("Cannot create {object}: outer {outer} is missing")]
    MissingAncestor { object: String, outer: String },
    #[error("Cannot create object of class {class_path}: {reason}")]
    CreationFailed { class_path: String, reason: String },
    #[error(transparent)]
    Serialization(#[from] SerializationError),
}

// ─── Serialization capability ─────────────────────────────────────────

/// Byte-level access to a replicated object.
pub trait SyncObject: Send {
    fn serialize_full(&self) -> Result<Vec<u8>, SerializationError>;

    fn serialize_property(&self, name: &str) -> Result<Vec<u8>, SerializationError>;

    fn deserialize_full(&mut self, data: &[u8]) -> Result<(), SerializationError>;

    fn deserialize_property(&mut self, name: &str, data: &[u8]) -> Result<(), SerializationError>;

    /// Serialize only the given root properties.
    fn serialize_delta(&self, changed: &[String]) -> Result<Vec<PropertyDelta>, SerializationError> {
        changed
            .iter()
            .map(|name| {
                Ok(PropertyDelta {
                    name: name.clone(),
                    data: self.serialize_property(name)?,
                })
            })
            .collect()
    }

    /// Called before remote data is written into the object.
    fn notify_pre_change(&mut self) {}

    /// Called after remote data was written into the object.
    fn notify_post_change(&mut self) {}
}

/// An object between the two creation phases.
pub struct PendingObject {
    pub object_id: ObjectId,
    pub object: Box<dyn SyncObject>,
}

/// Two-phase object construction: allocate, then initialise from state.
pub trait ObjectFactory: Send {
    fn begin_create(&mut self, object_id: &ObjectId) -> Result<PendingObject, ApplyError>;

    fn finish_create(
        &mut self,
        mut pending: PendingObject,
        initial_state: Option<&[u8]>,
    ) -> Result<Box<dyn SyncObject>, ApplyError> {
        if let Some(data) = initial_state {
            pending.object.deserialize_full(data)?;
        }
        Ok(pending.object)
    }
}

// ─── Arena ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectHandle {
    index: u32,
    generation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    Alive,
    /// Destroyed by a transaction, awaiting collection
    PendingDestroy,
}

struct Entry<T> {
    value: T,
    state: ObjectState,
    path: String,
}

struct Slot<T> {
    generation: u32,
    entry: Option<Entry<T>>,
}

/// Generational arena indexed by object path.
pub struct ObjectArena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    by_path: HashMap<String, ObjectHandle>,
}

impl<T> Default for ObjectArena<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            by_path: HashMap::new(),
        }
    }
}

impl<T> ObjectArena<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `value` under `path`, replacing any previous object at that path.
    pub fn insert(&mut self, path: impl Into<String>, value: T) -> ObjectHandle {
        let path = path.into();
        if let Some(old) = self.by_path.get(&path).copied() {
            self.remove(old);
        }

        let entry = Entry {
            value,
            state: ObjectState::Alive,
            path: path.clone(),
        };
        let handle = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.entry = Some(entry);
                ObjectHandle {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                ObjectHandle {
                    index: (self.slots.len() - 1) as u32,
                    generation: 0,
                }
            }
        };
        self.by_path.insert(path, handle);
        handle
    }

    fn entry(&self, handle: ObjectHandle) -> Option<&Entry<T>> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    fn entry_mut(&mut self, handle: ObjectHandle) -> Option<&mut Entry<T>> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    pub fn is_valid(&self, handle: ObjectHandle) -> bool {
        self.entry(handle).is_some()
    }

    pub fn get(&self, handle: ObjectHandle) -> Option<&T> {
        self.entry(handle).map(|e| &e.value)
    }

    pub fn get_mut(&mut self, handle: ObjectHandle) -> Option<&mut T> {
        self.entry_mut(handle).map(|e| &mut e.value)
    }

    pub fn state(&self, handle: ObjectHandle) -> Option<ObjectState> {
        self.entry(handle).map(|e| e.state)
    }

    pub fn set_state(&mut self, handle: ObjectHandle, state: ObjectState) -> bool {
        match self.entry_mut(handle) {
            Some(entry) => {
                entry.state = state;
                true
            }
            None => false,
        }
    }

    pub fn path(&self, handle: ObjectHandle) -> Option<&str> {
        self.entry(handle).map(|e| e.path.as_str())
    }

    /// Handle of the object at `path`, alive or pending destroy.
    pub fn find(&self, path: &str) -> Option<ObjectHandle> {
        self.by_path.get(path).copied()
    }

    /// Remove the object and bump the slot generation.
    pub fn remove(&mut self, handle: ObjectHandle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        self.by_path.remove(&entry.path);
        Some(entry.value)
    }

    /// Handles of every object whose path starts with `prefix`.
    pub fn handles_with_prefix(&self, prefix: &str) -> Vec<ObjectHandle> {
        self.by_path
            .iter()
            .filter(|(path, _)| path.starts_with(prefix))
            .map(|(_, handle)| *handle)
            .collect()
    }

    /// Change the path an object is indexed under.
    pub fn reindex(&mut self, handle: ObjectHandle, new_path: String) -> bool {
        let Some(entry) = self.entry_mut(handle) else {
            return false;
        };
        let old_path = std::mem::replace(&mut entry.path, new_path.clone());
        self.by_path.remove(&old_path);
        self.by_path.insert(new_path, handle);
        true
    }

    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }
}

// ─── World ────────────────────────────────────────────────────────────

/// All replicated objects known to a client.
pub struct ObjectWorld {
    arena: ObjectArena<Box<dyn SyncObject>>,
    factory: Box<dyn ObjectFactory>,
}

impl ObjectWorld {
    pub fn new(factory: Box<dyn ObjectFactory>) -> Self {
        Self {
            arena: ObjectArena::new(),
            factory,
        }
    }

    /// Resolve `object_id`, creating it when allowed.
    ///
    /// A pending-destroy object is revived when creation is allowed. Creation
    /// requires the outer object to exist and be alive.
    pub fn find_or_create(
        &mut self,
        object_id: &ObjectId,
        allow_create: bool,
        initial_state: Option<&[u8]>,
    ) -> Result<ObjectHandle, ApplyError> {
        let path = object_id.object_path();

        if let Some(handle) = self.arena.find(&path) {
            match self.arena.state(handle) {
                Some(ObjectState::Alive) => return Ok(handle),
                Some(ObjectState::PendingDestroy) if allow_create => {
                    self.arena.set_state(handle, ObjectState::Alive);
                    return Ok(handle);
                }
                _ => return Err(ApplyError::ObjectNotFound(path)),
            }
        }

        if !allow_create {
            return Err(ApplyError::ObjectNotFound(path));
        }
        if let Some(outer) = object_id.outer_object_path() {
            if !self.is_alive(&outer) {
                return Err(ApplyError::MissingAncestor { object: path, outer });
            }
        }

        let pending = self.factory.begin_create(object_id)?;
        let object = self.factory.finish_create(pending, initial_state)?;
        log::trace!("Created object {path}");
        Ok(self.arena.insert(path, object))
    }

    pub fn find(&self, path: &str) -> Option<ObjectHandle> {
        self.arena.find(path)
    }

    pub fn is_alive(&self, path: &str) -> bool {
        self.arena
            .find(path)
            .and_then(|h| self.arena.state(h))
            .is_some_and(|s| s == ObjectState::Alive)
    }

    pub fn get(&self, handle: ObjectHandle) -> Option<&dyn SyncObject> {
        self.arena.get(handle).map(|o| o.as_ref())
    }

    pub fn get_mut(&mut self, handle: ObjectHandle) -> Option<&mut (dyn SyncObject + 'static)> {
        self.arena.get_mut(handle).map(|o| o.as_mut())
    }

    pub fn state(&self, handle: ObjectHandle) -> Option<ObjectState> {
        self.arena.state(handle)
    }

    /// Mark the object at `path` pending destroy.
    pub fn destroy(&mut self, path: &str) -> bool {
        match self.arena.find(path) {
            Some(handle) => self.arena.set_state(handle, ObjectState::PendingDestroy),
            None => false,
        }
    }

    /// Drop every pending-destroy object. Returns how many were removed.
    pub fn collect_garbage(&mut self) -> usize {
        let doomed: Vec<ObjectHandle> = self
            .arena
            .handles_with_prefix("")
            .into_iter()
            .filter(|h| self.arena.state(*h) == Some(ObjectState::PendingDestroy))
            .collect();
        for handle in &doomed {
            self.arena.remove(*handle);
        }
        doomed.len()
    }

    /// Remove every object of a package.
    pub fn purge_package(&mut self, package_name: &str) -> usize {
        let handles = self.arena.handles_with_prefix(&format!("{package_name}:"));
        for handle in &handles {
            self.arena.remove(*handle);
        }
        handles.len()
    }

    /// Re-home every object of `from` under `to`.
    pub fn rename_package(&mut self, from: &str, to: &str) -> usize {
        let prefix = format!("{from}:");
        let handles = self.arena.handles_with_prefix(&prefix);
        for handle in &handles {
            let Some(path) = self.arena.path(*handle) else {
                continue;
            };
            let new_path = format!("{to}:{}", &path[prefix.len()..]);
            self.arena.reindex(*handle, new_path);
        }
        handles.len()
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }
}

// ─── Property bag ─────────────────────────────────────────────────────

/// A schemaless object: root properties as JSON values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyBag {
    pub class_path: String,
    properties: BTreeMap<String, Value>,
    pre_change_notifications: u32,
    post_change_notifications: u32,
}

impl PropertyBag {
    pub fn new(class_path: impl Into<String>) -> Self {
        Self {
            class_path: class_path.into(),
            ..Self::default()
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.properties.insert(name.into(), value);
    }

    pub fn notification_counts(&self) -> (u32, u32) {
        (self.pre_change_notifications, self.post_change_notifications)
    }
}

impl SyncObject for PropertyBag {
    fn serialize_full(&self) -> Result<Vec<u8>, SerializationError> {
        serde_json::to_vec(&self.properties).map_err(|e| SerializationError::Malformed(e.to_string()))
    }

    fn serialize_property(&self, name: &str) -> Result<Vec<u8>, SerializationError> {
        let value = self
            .properties
            .get(name)
            .ok_or_else(|| SerializationError::UnknownProperty(name.to_string()))?;
        serde_json::to_vec(value).map_err(|e| SerializationError::Malformed(e.to_string()))
    }

    fn deserialize_full(&mut self, data: &[u8]) -> Result<(), SerializationError> {
        self.properties =
            serde_json::from_slice(data).map_err(|e| SerializationError::Malformed(e.to_string()))?;
        Ok(())
    }

    fn deserialize_property(&mut self, name: &str, data: &[u8]) -> Result<(), SerializationError> {
        let value: Value =
            serde_json::from_slice(data).map_err(|e| SerializationError::Malformed(e.to_string()))?;
        self.properties.insert(name.to_string(), value);
        Ok(())
    }

    fn notify_pre_change(&mut self) {
        self.pre_change_notifications += 1;
    }

    fn notify_post_change(&mut self) {
        self.post_change_notifications += 1;
    }
}

/// Creates a [`PropertyBag`] for any class.
#[derive(Debug, Default)]
pub struct PropertyBagFactory;

impl ObjectFactory for PropertyBagFactory {
    fn begin_create(&mut self, object_id: &ObjectId) -> Result<PendingObject, ApplyError> {
        Ok(PendingObject {
            object_id: object_id.clone(),
            object: Box::new(PropertyBag::new(object_id.class_path.clone())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id(outer: &str, name: &str) -> ObjectId {
        ObjectId::new("/Script/Engine.Actor", "/Game/Foo", outer, name)
    }

    fn world() -> ObjectWorld {
        ObjectWorld::new(Box::new(PropertyBagFactory))
    }

    #[test]
    fn test_arena_generation_invalidates_handles() {
        let mut arena: ObjectArena<u32> = ObjectArena::new();
        let a = arena.insert("a", 1);
        assert_eq!(arena.get(a), Some(&1));

        assert_eq!(arena.remove(a), Some(1));
        assert!(!arena.is_valid(a));

        // Slot is reused with a new generation
        let b = arena.insert("b", 2);
        assert_ne!(a, b);
        assert!(arena.get(a).is_none());
        assert_eq!(arena.get(b), Some(&2));
        assert_eq!(arena.find("b"), Some(b));
        assert!(arena.find("a").is_none());
    }

    #[test]
    fn test_arena_insert_replaces_path() {
        let mut arena: ObjectArena<&str> = ObjectArena::new();
        let first = arena.insert("x", "old");
        let second = arena.insert("x", "new");
        assert!(!arena.is_valid(first));
        assert_eq!(arena.get(second), Some(&"new"));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_find_or_create_requires_outer() {
        let mut world = world();
        let child = id("Level", "Actor");

        let err = world.find_or_create(&child, true, None).unwrap_err();
        assert_eq!(
            err,
            ApplyError::MissingAncestor {
                object: "/Game/Foo:Level.Actor".into(),
                outer: "/Game/Foo:Level".into(),
            }
        );

        world.find_or_create(&id("", "Level"), true, None).unwrap();
        assert!(world.find_or_create(&child, true, None).is_ok());
        assert_eq!(world.len(), 2);
    }

    #[test]
    fn test_find_without_create() {
        let mut world = world();
        let err = world.find_or_create(&id("", "Level"), false, None).unwrap_err();
        assert_eq!(err, ApplyError::ObjectNotFound("/Game/Foo:Level".into()));
    }

    #[test]
    fn test_initial_state_applied_on_create() {
        let mut world = world();
        let data = serde_json::to_vec(&json!({ "label": "Chair" })).unwrap();
        let handle = world.find_or_create(&id("", "Chair"), true, Some(&data)).unwrap();

        let label = world.get(handle).unwrap().serialize_property("label").unwrap();
        assert_eq!(label, serde_json::to_vec(&json!("Chair")).unwrap());
    }

    #[test]
    fn test_destroy_and_revive() {
        let mut world = world();
        let level = id("", "Level");
        let handle = world.find_or_create(&level, true, None).unwrap();

        assert!(world.destroy("/Game/Foo:Level"));
        assert_eq!(world.state(handle), Some(ObjectState::PendingDestroy));
        assert!(world.find_or_create(&level, false, None).is_err());

        let revived = world.find_or_create(&level, true, None).unwrap();
        assert_eq!(revived, handle);
        assert_eq!(world.state(handle), Some(ObjectState::Alive));

        world.destroy("/Game/Foo:Level");
        assert_eq!(world.collect_garbage(), 1);
        assert!(world.is_empty());
    }

    #[test]
    fn test_purge_and_rename_package() {
        let mut world = world();
        world.find_or_create(&id("", "Level"), true, None).unwrap();
        world.find_or_create(&id("Level", "Actor"), true, None).unwrap();
        world
            .find_or_create(&ObjectId::new("/Script/Engine.Actor", "/Game/Other", "", "A"), true, None)
            .unwrap();

        assert_eq!(world.rename_package("/Game/Foo", "/Game/Bar"), 2);
        assert!(world.is_alive("/Game/Bar:Level.Actor"));
        assert!(!world.is_alive("/Game/Foo:Level"));

        assert_eq!(world.purge_package("/Game/Bar"), 2);
        assert_eq!(world.len(), 1);
    }

    #[test]
    fn test_property_bag_delta() {
        let mut bag = PropertyBag::new("/Script/Engine.Actor");
        bag.set("location", json!([1, 2, 3]));
        bag.set("label", json!("Chair"));

        let delta = bag.serialize_delta(&["location".to_string()]).unwrap();
        assert_eq!(delta.len(), 1);
        assert_eq!(delta[0].name, "location");

        let mut other = PropertyBag::new("/Script/Engine.Actor");
        other.deserialize_property("location", &delta[0].data).unwrap();
        assert_eq!(other.get("location"), Some(&json!([1, 2, 3])));

        assert_eq!(
            bag.serialize_property("missing"),
            Err(SerializationError::UnknownProperty("missing".into()))
        );
        assert!(matches!(
            other.deserialize_full(b"not json"),
            Err(SerializationError::Malformed(_))
        ));
    }
}
